//! Long-form answers stitched from several bounded completions.
//!
//! Free-tier providers truncate hard above a few hundred completion
//! tokens, so one big call cannot produce a long plan. Instead: one
//! schema-validated outline call, one call per section, and bounded
//! continuation calls whenever a section stops with finish reason
//! "length". Continuations re-send the tail of the text and the join is
//! deduplicated by a longest-common-affix scan.

use filmbuddy_core::{
    ChatMessage, ChatRequest, ChunkConfig, Clock, DeadlineBudget, ResponseFormat, SharedClock,
};
use filmbuddy_errors::ErrorEnvelope;
use filmbuddy_gateway::LlmGateway;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::sync::LazyLock;

pub const TRUNCATION_MARKER: &str = "(…trimmed to fit message limits)";

/// Longest overlap considered when joining a continuation.
const OVERLAP_MAX: usize = 400;
/// Shortest overlap still treated as a duplicate rather than chance.
const OVERLAP_MIN: usize = 40;

const OUTLINE_SCHEMA_NAME: &str = "FilmbuddyChunkOutline";

static STRICT_FORMAT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(reply\s+exactly|format\s+each\s+line\s+exactly|NO_LIBRARY_ACCESS|CHOSEN_TITLE_ID|LIST_CREATED|LIST_ADD_OK|WATCHLIST_OK)")
        .unwrap()
});

const LONG_FORM_CUES: &[&str] = &[
    "deep dive",
    "go deeper",
    "even deeper",
    "full plan",
    "step-by-step",
    "detailed",
    "everything",
    "all of",
    "do them all",
    "write a",
    "explain",
];

/// Strict-format requests must never be chunked; stitching would break
/// the exact-output contract.
pub fn is_strict_output_request(text: &str) -> bool {
    let t = text.trim();
    !t.is_empty() && STRICT_FORMAT_RE.is_match(t)
}

pub fn should_use_chunk_mode(text: &str, cfg: &ChunkConfig) -> bool {
    let t = text.trim();
    if t.is_empty() || is_strict_output_request(t) {
        return false;
    }
    if t.chars().count() > cfg.long_form_min_chars {
        return true;
    }
    let low = t.to_lowercase();
    LONG_FORM_CUES.iter().any(|cue| low.contains(cue))
}

/// Join `a` and `b`, removing the duplicated span a continuation usually
/// re-emits. Scans exact overlaps from `OVERLAP_MAX` down to
/// `OVERLAP_MIN`; below that a repeat is indistinguishable from normal
/// prose. Without an overlap the continuation has restarted from the
/// last word boundary, so a trailing fragment cut mid-word is dropped
/// when `b`'s first word restarts it ("fox ja" + "jumps over" joins as
/// "fox jumps over", never "fox ja jumps over").
pub fn merge_with_overlap(a: &str, b: &str) -> String {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let max_k = OVERLAP_MAX.min(a_chars.len()).min(b_chars.len());
    let mut k = max_k;
    while k >= OVERLAP_MIN {
        if a_chars[a_chars.len() - k..] == b_chars[..k] {
            let mut merged = a.to_string();
            merged.extend(&b_chars[k..]);
            return merged;
        }
        k -= 1;
    }
    let (head, fragment) = split_trailing_fragment(a);
    if restarts_fragment(fragment, b) {
        let head = head.trim_end();
        if head.is_empty() {
            return b.to_string();
        }
        return format!("{head} {b}");
    }
    let separator = if a.ends_with('\n') || b.starts_with('\n') || a.is_empty() {
        ""
    } else {
        " "
    };
    format!("{a}{separator}{b}")
}

/// Split off a trailing alphanumeric fragment that sits hard against the
/// end of `s` (no trailing whitespace, no closing punctuation).
fn split_trailing_fragment(s: &str) -> (&str, &str) {
    if s.is_empty() || s.ends_with(char::is_whitespace) {
        return (s, "");
    }
    let cut = s
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map_or(0, |(i, c)| i + c.len_utf8());
    let fragment = &s[cut..];
    if !fragment.is_empty() && fragment.chars().all(char::is_alphanumeric) {
        (&s[..cut], fragment)
    } else {
        (s, "")
    }
}

/// A fragment counts as the truncated start of the continuation's first
/// word when that word is longer and begins with the same letter.
fn restarts_fragment(fragment: &str, b: &str) -> bool {
    if fragment.is_empty() {
        return false;
    }
    let Some(first_word) = b.split_whitespace().next() else {
        return false;
    };
    fragment.chars().count() < first_word.chars().count()
        && fragment
            .chars()
            .next()
            .map(|c| c.to_lowercase().to_string())
            == first_word
                .chars()
                .next()
                .map(|c| c.to_lowercase().to_string())
}

#[derive(Debug, Clone, Deserialize)]
struct Outline {
    #[serde(default)]
    intro: String,
    sections: Vec<OutlineSection>,
}

#[derive(Debug, Clone, Deserialize)]
struct OutlineSection {
    title: String,
    #[serde(default)]
    bullets: Vec<String>,
}

fn outline_response_format() -> ResponseFormat {
    ResponseFormat::JsonSchema {
        name: OUTLINE_SCHEMA_NAME.to_string(),
        strict: true,
        schema: json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "intro": {"type": "string"},
                "sections": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "properties": {
                            "title": {"type": "string"},
                            "bullets": {"type": "array", "items": {"type": "string"}}
                        },
                        "required": ["title", "bullets"]
                    }
                }
            },
            "required": ["sections"]
        }),
    }
}

/// Explicit position in the generation run. Driven as a step machine so
/// the deadline check sits in exactly one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkStep {
    Outline,
    Section(usize),
    Continuation { section: usize, taken: usize },
    Done,
}

pub struct ChunkedGenerator<'a> {
    gateway: &'a dyn LlmGateway,
    cfg: ChunkConfig,
    clock: SharedClock,
}

impl<'a> ChunkedGenerator<'a> {
    pub fn new(gateway: &'a dyn LlmGateway, cfg: ChunkConfig, clock: SharedClock) -> Self {
        Self { gateway, cfg, clock }
    }

    /// Generate the long-form answer for `user_text`. `base` supplies the
    /// conversation id, models, endpoint and deadline; messages and
    /// response format are replaced per step.
    pub fn generate(
        &self,
        base: &ChatRequest,
        user_text: &str,
        budget: &DeadlineBudget,
    ) -> Result<String, ErrorEnvelope> {
        let mut out = String::new();
        let mut sections: Vec<OutlineSection> = Vec::new();
        let mut section_text = String::new();
        let mut step = ChunkStep::Outline;

        loop {
            if budget.within_margin(self.clock.now()) {
                break;
            }
            match step {
                ChunkStep::Outline => {
                    let req = self.step_request(
                        base,
                        budget,
                        vec![
                            ChatMessage::system(
                                "Plan a long-form answer. Return JSON with an optional short \
                                 intro and ordered sections, each with a title and 2-5 bullets.",
                            ),
                            ChatMessage::user(user_text.to_string()),
                        ],
                        Some(outline_response_format()),
                        self.cfg.outline_max_tokens,
                    );
                    let outcome = self.gateway.route(&req)?;
                    let outline: Option<Outline> =
                        crate::schema::extract_json_object(&outcome.content)
                            .and_then(|v| serde_json::from_value(v).ok());
                    let Some(mut outline) = outline else {
                        step = ChunkStep::Done;
                        continue;
                    };
                    outline.sections.truncate(self.cfg.max_sections);
                    if !outline.intro.trim().is_empty() {
                        out.push_str(outline.intro.trim());
                    }
                    step = if outline.sections.is_empty() {
                        ChunkStep::Done
                    } else {
                        ChunkStep::Section(0)
                    };
                    sections = outline.sections;
                }
                ChunkStep::Section(index) => {
                    let Some(section) = sections.get(index).cloned() else {
                        step = ChunkStep::Done;
                        continue;
                    };
                    let prompt = section_prompt(user_text, &section, index, sections.len());
                    let req = self.step_request(
                        base,
                        budget,
                        vec![
                            ChatMessage::system(
                                "Write one section of a longer answer. Plain text only, no \
                                 heading, no preamble.",
                            ),
                            ChatMessage::user(prompt),
                        ],
                        None,
                        self.cfg.section_max_tokens,
                    );
                    let outcome = match self.gateway.route(&req) {
                        Ok(outcome) => outcome,
                        // One bad call must not lose every completed
                        // section; return what exists.
                        Err(_) if !out.trim().is_empty() => break,
                        Err(err) => return Err(err),
                    };
                    section_text = outcome.content.trim().to_string();
                    if outcome.finish_reason == "length" && self.cfg.max_continuations > 0 {
                        step = ChunkStep::Continuation { section: index, taken: 0 };
                    } else {
                        self.flush_section(&mut out, &section.title, &mut section_text);
                        step = self.next_step(index, &out);
                    }
                }
                ChunkStep::Continuation { section, taken } => {
                    let title = sections
                        .get(section)
                        .map(|s| s.title.clone())
                        .unwrap_or_else(|| format!("Part {}", section + 1));
                    let tail = tail_chars(&section_text, self.cfg.tail_chars);
                    let prompt = format!(
                        "Continue this text exactly where it stops. Do not repeat what is \
                         already written, do not summarize, just continue.\n\n{tail}"
                    );
                    let req = self.step_request(
                        base,
                        budget,
                        vec![ChatMessage::user(prompt)],
                        None,
                        self.cfg.section_max_tokens,
                    );
                    let outcome = match self.gateway.route(&req) {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            // A failed continuation ends the section with
                            // what we have.
                            self.flush_section(&mut out, &title, &mut section_text);
                            step = self.next_step(section, &out);
                            continue;
                        }
                    };
                    section_text = merge_with_overlap(&section_text, outcome.content.trim());
                    let more = outcome.finish_reason == "length"
                        && taken + 1 < self.cfg.max_continuations
                        && char_len(&section_text) < self.cfg.section_char_cap;
                    if more {
                        step = ChunkStep::Continuation { section, taken: taken + 1 };
                    } else {
                        self.flush_section(&mut out, &title, &mut section_text);
                        step = self.next_step(section, &out);
                    }
                }
                ChunkStep::Done => break,
            }
        }

        // A deadline mid-section still flushes the partial text.
        if !section_text.trim().is_empty() {
            let title = "More".to_string();
            self.flush_section(&mut out, &title, &mut section_text);
        }

        Ok(self.finish(out))
    }

    fn step_request(
        &self,
        base: &ChatRequest,
        budget: &DeadlineBudget,
        messages: Vec<ChatMessage>,
        response_format: Option<ResponseFormat>,
        max_tokens: u32,
    ) -> ChatRequest {
        let now = self.clock.now();
        let mut req = ChatRequest::new(
            base.conversation_id,
            messages,
            base.models.clone(),
            base.base_url.clone(),
            budget.clamp_timeout(now, base.timeout),
            base.deadline,
        );
        req.provider = base.provider.clone();
        req.response_format = response_format;
        req.temperature = Some(0.3);
        req.top_p = Some(1.0);
        req.max_tokens = Some(max_tokens);
        req
    }

    fn flush_section(&self, out: &mut String, title: &str, section_text: &mut String) {
        let body = truncate_chars(section_text.trim(), self.cfg.section_char_cap);
        if body.is_empty() {
            section_text.clear();
            return;
        }
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str("### ");
        out.push_str(title);
        out.push('\n');
        out.push_str(&body);
        section_text.clear();
    }

    fn next_step(&self, current: usize, out: &str) -> ChunkStep {
        if char_len(out) >= self.cfg.total_char_ceiling {
            return ChunkStep::Done;
        }
        ChunkStep::Section(current + 1)
    }

    fn finish(&self, out: String) -> String {
        if char_len(&out) <= self.cfg.total_char_ceiling {
            return out;
        }
        let mut trimmed = truncate_chars(&out, self.cfg.total_char_ceiling);
        trimmed.push('\n');
        trimmed.push_str(TRUNCATION_MARKER);
        trimmed
    }
}

fn section_prompt(user_text: &str, section: &OutlineSection, index: usize, total: usize) -> String {
    let bullets = if section.bullets.is_empty() {
        String::new()
    } else {
        format!("\nCover:\n- {}", section.bullets.join("\n- "))
    };
    format!(
        "Request: {user_text}\n\nWrite section {} of {}: \"{}\".{bullets}",
        index + 1,
        total,
        section.title,
    )
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn truncate_chars(s: &str, max: usize) -> String {
    if char_len(s) <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

fn tail_chars(s: &str, max: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    let start = chars.len().saturating_sub(max);
    chars[start..].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ScriptedGateway, base_request, plain_outcome};
    use chrono::Duration;
    use filmbuddy_core::{Clock, ManualClock};
    use std::sync::Arc;

    #[test]
    fn overlap_merge_removes_the_duplicated_span() {
        let overlap = "the quick brown fox jumps over the lazy dog near the riverbank";
        let a = format!("Opening paragraph. {overlap}");
        let b = format!("{overlap} And then the story continues.");
        let merged = merge_with_overlap(&a, &b);
        assert_eq!(
            merged,
            format!("Opening paragraph. {overlap} And then the story continues.")
        );
        assert_eq!(merged.matches("riverbank").count(), 1);
    }

    #[test]
    fn truncated_word_is_dropped_when_the_continuation_restarts_it() {
        let merged = merge_with_overlap(
            "...the quick brown fox ja",
            "jumps over the lazy dog",
        );
        assert_eq!(merged, "...the quick brown fox jumps over the lazy dog");

        // Fragment-only previous text falls back to the continuation.
        assert_eq!(merge_with_overlap("ju", "jumps high"), "jumps high");
    }

    #[test]
    fn short_or_absent_overlap_joins_with_whitespace() {
        // A complete trailing word survives the join.
        let merged = merge_with_overlap("ends at the fence", "Then the fox leaves.");
        assert_eq!(merged, "ends at the fence Then the fox leaves.");

        // A fragment whose restart letter differs is kept as written.
        let merged = merge_with_overlap("stops at doc", "jumps over the fence");
        assert_eq!(merged, "stops at doc jumps over the fence");

        let merged = merge_with_overlap("line one\n", "line two");
        assert_eq!(merged, "line one\nline two");
    }

    #[test]
    fn strict_format_requests_never_chunk() {
        let cfg = ChunkConfig::default();
        assert!(!should_use_chunk_mode(
            "Reply exactly: pong and also write a detailed plan",
            &cfg
        ));
        assert!(should_use_chunk_mode("Give me a full plan, step-by-step", &cfg));
        assert!(!should_use_chunk_mode("best heist movie?", &cfg));
    }

    #[test]
    fn long_messages_chunk_without_a_cue() {
        let cfg = ChunkConfig::default();
        let long = "tonight ".repeat(120);
        assert!(long.chars().count() > cfg.long_form_min_chars);
        assert!(should_use_chunk_mode(&long, &cfg));
    }

    #[test]
    fn sections_are_stitched_under_their_outline_titles() {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let outline = serde_json::json!({
            "intro": "Here is the plan.",
            "sections": [
                {"title": "Tonight", "bullets": ["pick one"]},
                {"title": "This weekend", "bullets": ["pick two"]}
            ]
        })
        .to_string();
        let gateway = ScriptedGateway::new(vec![
            Ok(plain_outcome(&outline, "stop")),
            Ok(plain_outcome("Watch Dune tonight.", "stop")),
            Ok(plain_outcome("Save Oppenheimer for Saturday.", "stop")),
        ]);
        let cfg = ChunkConfig::default();
        let generator = ChunkedGenerator::new(&gateway, cfg, clock.clone());
        let budget = DeadlineBudget::new(clock.now(), Duration::seconds(50), Duration::seconds(5));
        let base = base_request(clock.now() + Duration::seconds(50));

        let text = generator
            .generate(&base, "plan my movie week, detailed", &budget)
            .expect("generated");
        assert_eq!(
            text,
            "Here is the plan.\n\n### Tonight\nWatch Dune tonight.\n\n### This weekend\nSave Oppenheimer for Saturday."
        );
        assert_eq!(gateway.request_count(), 3);
    }

    #[test]
    fn length_stops_trigger_merged_continuations() {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let outline = serde_json::json!({
            "sections": [{"title": "Plan", "bullets": []}]
        })
        .to_string();
        let overlap = "a shared run of text long enough to count as one duplicated span";
        let first = format!("The section starts here. {overlap}");
        let second = format!("{overlap} and here it finishes cleanly.");
        let gateway = ScriptedGateway::new(vec![
            Ok(plain_outcome(&outline, "stop")),
            Ok(plain_outcome(&first, "length")),
            Ok(plain_outcome(&second, "stop")),
        ]);
        let generator = ChunkedGenerator::new(&gateway, ChunkConfig::default(), clock.clone());
        let budget = DeadlineBudget::new(clock.now(), Duration::seconds(50), Duration::seconds(5));
        let base = base_request(clock.now() + Duration::seconds(50));

        let text = generator
            .generate(&base, "write a detailed plan", &budget)
            .expect("generated");
        assert_eq!(text.matches(overlap).count(), 1);
        assert!(text.ends_with("and here it finishes cleanly."));
        assert_eq!(gateway.request_count(), 3);
    }

    #[test]
    fn total_ceiling_appends_the_truncation_marker() {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let outline = serde_json::json!({
            "sections": [
                {"title": "One", "bullets": []},
                {"title": "Two", "bullets": []}
            ]
        })
        .to_string();
        let huge = "word ".repeat(3_000);
        let gateway = ScriptedGateway::new(vec![
            Ok(plain_outcome(&outline, "stop")),
            Ok(plain_outcome(&huge, "stop")),
            Ok(plain_outcome(&huge, "stop")),
        ]);
        let cfg = ChunkConfig::default();
        let ceiling = cfg.total_char_ceiling;
        let generator = ChunkedGenerator::new(&gateway, cfg, clock.clone());
        let budget = DeadlineBudget::new(clock.now(), Duration::seconds(50), Duration::seconds(5));
        let base = base_request(clock.now() + Duration::seconds(50));

        let text = generator
            .generate(&base, "write a detailed plan", &budget)
            .expect("generated");
        assert!(text.ends_with(TRUNCATION_MARKER));
        assert!(text.chars().count() <= ceiling + TRUNCATION_MARKER.chars().count() + 1);
    }

    #[test]
    fn deadline_inside_margin_makes_no_calls() {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let gateway = ScriptedGateway::new(vec![]);
        let generator = ChunkedGenerator::new(&gateway, ChunkConfig::default(), clock.clone());
        let budget = DeadlineBudget::new(clock.now(), Duration::seconds(3), Duration::seconds(5));
        let base = base_request(clock.now() + Duration::seconds(3));

        let text = generator
            .generate(&base, "write a detailed plan", &budget)
            .expect("generated");
        assert!(text.is_empty());
        assert_eq!(gateway.request_count(), 0);
    }
}
