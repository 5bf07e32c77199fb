//! Model-free answers for command-shaped messages.
//!
//! Smoke tests and power users issue byte-exact commands ("Reply
//! exactly: pong", "Trending now ... Format each line exactly ..."). A
//! model round-trip adds latency and can paraphrase the required output,
//! so these shapes are matched by regex and answered with at most one or
//! two direct tool calls. A write executed here was spelled out verbatim
//! by the user; model-initiated writes still go through the action gate.

use filmbuddy_core::{ChatMessage, ToolCall, ToolResult};
use regex::Regex;
use serde_json::{Value, json};
use std::sync::LazyLock;

/// Executes one tool call on behalf of the current user and records it
/// in the trace. Implemented by the orchestrator.
pub trait ToolRunner {
    fn run(&mut self, call: ToolCall) -> ToolResult;
}

#[derive(Debug, Clone)]
pub struct DeterministicReply {
    pub text: String,
    pub navigate_to: Option<String>,
}

impl DeterministicReply {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            navigate_to: None,
        }
    }
}

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[1-7][0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}")
        .unwrap()
});
static PONG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\breply\s+(exactly\s*:\s*)?pong\b").unwrap());
static THREE_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)reply\s+with\s+exactly\s+3\s+lines").unwrap());
static ACK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\breply\s+exactly\s*:\s*ack\b").unwrap());
static NO_ACCESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)reply\s+exactly\s*:\s*no_access").unwrap());
static OTHER_USER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)user\s*_?id\s*=\s*([0-9a-f]{8}-[0-9a-f]{4}-[1-7][0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12})")
        .unwrap()
});
static FIRST_TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)take\s+the\s+first\s+title\s*id").unwrap());
static SEARCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)search\s+the\s+catalog\s+for\s*:\s*(.+)$").unwrap());
static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)find\s+the\s+movie\s+(.+?)\s+and\s+tell\s+me\s+its\s+year").unwrap()
});
static YEAR_FORMAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)reply\s+exactly\s*:\s*year=").unwrap());
static WANT_TO_WATCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)status\s*=\s*want_to_watch").unwrap());
static WATCHED_UPDATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)update\s+chosen_title_id").unwrap());
static STATUS_TO_WATCHED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)status\s+to\s+watched").unwrap());
static SHOW_WATCHLIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)show\s+my\s+watchlist").unwrap());
static CREATE_LIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)create\s+a\s+list\s+named").unwrap());
static LIST_CREATED_FORMAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)list_created\s*=\s*<list\s*id>").unwrap());
static ADD_TO_LIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)add\s+chosen_title_id\s+to\s+(smoke\s+test\s+)?list").unwrap());
static LIST_ITEMS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)get\s+items\s+for\s+list").unwrap());
static REMOVE_FROM_LIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)remove\s+chosen_title_id\s+from\s+list").unwrap());
static LIST_EMPTY_FORMAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)reply\s+exactly\s*:\s*list_empty_ok").unwrap());
static CHOSEN_TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)CHOSEN_TITLE_ID\s*=\s*([0-9a-f]{8}-[0-9a-f]{4}-[1-7][0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12})")
        .unwrap()
});
static LIST_CREATED_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)LIST_CREATED\s*=\s*([0-9a-f]{8}-[0-9a-f]{4}-[1-7][0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12})")
        .unwrap()
});

/// Try to answer `text` without the model. `None` means the message is
/// not command-shaped and the agent loop must handle it.
pub fn route(
    user_id: &str,
    text: &str,
    history: &[ChatMessage],
    runner: &mut dyn ToolRunner,
) -> Option<DeterministicReply> {
    let txt = text.trim();
    if txt.is_empty() {
        return None;
    }
    let low = txt.to_lowercase();

    // Echo probes.
    if PONG_RE.is_match(txt) {
        return Some(DeterministicReply::text("pong"));
    }
    if THREE_LINES_RE.is_match(txt) {
        return Some(DeterministicReply::text("A\nB\nC"));
    }
    if ACK_RE.is_match(txt) {
        return Some(DeterministicReply::text("ACK"));
    }

    // Reading someone else's library is refused without a tool call.
    if let Some(cap) = OTHER_USER_RE.captures(txt) {
        let other = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
        if !other.eq_ignore_ascii_case(user_id)
            && low.contains("watchlist")
            && NO_ACCESS_RE.is_match(txt)
        {
            return Some(DeterministicReply::text("NO_ACCESS"));
        }
    }

    // Trending, strict lines.
    if low.contains("trending now") && low.contains("format") && low.contains('|') {
        let result = runner.run(call("get_trending", json!({"limit": 5})));
        let Some(value) = ok_value(&result) else {
            return Some(DeterministicReply::text("NO_CATALOG_ACCESS"));
        };
        let items = pick_items(&value);
        if items.is_empty() {
            return Some(DeterministicReply::text("NO_RESULTS"));
        }
        return Some(DeterministicReply::text(format_title_lines(&items, 5)));
    }

    // First trending title id, exact echo.
    if FIRST_TITLE_RE.is_match(txt) && low.contains("chosen_title_id") {
        if let Some(id) = extract_from_history(history, &CHOSEN_TITLE_RE) {
            return Some(DeterministicReply::text(format!("CHOSEN_TITLE_ID={id}")));
        }
        let result = runner.run(call("get_trending", json!({"limit": 1})));
        let Some(value) = ok_value(&result) else {
            return Some(DeterministicReply::text("CHOSEN_TITLE_ID="));
        };
        let items = pick_items(&value);
        let id = items
            .first()
            .and_then(|it| it.get("id"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Some(DeterministicReply::text(format!("CHOSEN_TITLE_ID={id}")));
    }

    // Catalog search, strict lines.
    if let Some(cap) = SEARCH_RE.captures(txt) {
        let query = strip_quotes(cap.get(1).map(|m| m.as_str()).unwrap_or_default().trim_end_matches('.'));
        let result = runner.run(call("search_catalog", json!({"query": query, "limit": 5})));
        let Some(value) = ok_value(&result) else {
            return Some(DeterministicReply::text("NO_CATALOG_ACCESS"));
        };
        let items = pick_items(&value);
        if items.is_empty() {
            return Some(DeterministicReply::text("NO_RESULTS"));
        }
        return Some(DeterministicReply::text(format_title_lines(&items, 5)));
    }

    // Release-year lookup, exact echo.
    if let Some(cap) = YEAR_RE.captures(txt) {
        if YEAR_FORMAT_RE.is_match(txt) {
            let title = strip_quotes(cap.get(1).map(|m| m.as_str()).unwrap_or_default());
            let result = runner.run(call("search_catalog", json!({"query": title, "limit": 5})));
            let Some(value) = ok_value(&result) else {
                return Some(DeterministicReply::text("NO_CATALOG_ACCESS"));
            };
            let year = pick_items(&value)
                .first()
                .map(|best| year_of(best))
                .unwrap_or_default();
            if year.len() != 4 || !year.chars().all(|c| c.is_ascii_digit()) {
                return Some(DeterministicReply::text("NO_CATALOG_ACCESS"));
            }
            return Some(DeterministicReply::text(format!("YEAR={year}")));
        }
    }

    // Watchlist add: the message names the title and the status verbatim.
    if low.contains("watchlist") && WANT_TO_WATCH_RE.is_match(txt) {
        let Some(title_id) = resolve_chosen_title_id(txt, history) else {
            return Some(DeterministicReply::text("NO_WRITE_ACCESS"));
        };
        let result = runner.run(call(
            "diary_set_status",
            json!({"title_id": title_id, "status": "want_to_watch"}),
        ));
        let text = if result.is_ok() { "WATCHLIST_OK" } else { "NO_WRITE_ACCESS" };
        return Some(DeterministicReply::text(text));
    }
    if WATCHED_UPDATE_RE.is_match(txt) && STATUS_TO_WATCHED_RE.is_match(txt) {
        let Some(title_id) = resolve_chosen_title_id(txt, history) else {
            return Some(DeterministicReply::text("NO_WRITE_ACCESS"));
        };
        let result = runner.run(call(
            "diary_set_status",
            json!({"title_id": title_id, "status": "watched"}),
        ));
        let text = if result.is_ok() { "WATCHED_OK" } else { "NO_WRITE_ACCESS" };
        return Some(DeterministicReply::text(text));
    }

    // Watchlist read, strict lines.
    if SHOW_WATCHLIST_RE.is_match(txt) && low.contains("newest") && low.contains("format") {
        let status = if low.contains("status watched") {
            Some("watched")
        } else if low.contains("status want_to_watch") {
            Some("want_to_watch")
        } else {
            None
        };
        let mut args = json!({"limit": 5, "sort": "newest"});
        if let Some(status) = status {
            args["status"] = json!(status);
        }
        let result = runner.run(call("get_my_library", args));
        let Some(value) = ok_value(&result) else {
            return Some(DeterministicReply::text("NO_LIBRARY_ACCESS"));
        };
        let items = pick_items(&value);
        if items.is_empty() {
            return Some(DeterministicReply::text("NO_RESULTS"));
        }
        let lines: Vec<String> = items
            .iter()
            .take(5)
            .map(|it| {
                format!(
                    "{} | {} | {}",
                    str_field(it, &["title_id", "titleId", "id"]),
                    str_field(it, &["title"]),
                    str_field(it, &["status"]),
                )
            })
            .collect();
        return Some(DeterministicReply::text(lines.join("\n")));
    }

    // List lifecycle commands.
    if CREATE_LIST_RE.is_match(txt) && LIST_CREATED_FORMAT_RE.is_match(txt) {
        let name_part = txt.splitn(2, ':').nth(1).unwrap_or("");
        let name = strip_quotes(name_part.split('(').next().unwrap_or("").trim_end_matches('.'));
        let is_public = !low.contains("private");
        let name = if name.is_empty() { "List".to_string() } else { name };
        let result = runner.run(call(
            "create_list",
            json!({"list_name": name, "is_public": is_public}),
        ));
        let list_id = ok_value(&result)
            .map(|v| str_field(&v, &["list_id", "listId", "id"]))
            .unwrap_or_default();
        if result.is_ok() && !list_id.is_empty() {
            return Some(DeterministicReply::text(format!("LIST_CREATED={list_id}")));
        }
        return Some(DeterministicReply::text("NO_LIST_ACCESS"));
    }

    if ADD_TO_LIST_RE.is_match(txt) && low.contains("list_add_ok") {
        let Some(title_id) = resolve_chosen_title_id(txt, history) else {
            return Some(DeterministicReply::text("NO_LIST_ACCESS"));
        };
        let Some(list_id) = uuid_in(txt).or_else(|| extract_from_history(history, &LIST_CREATED_ID_RE))
        else {
            return Some(DeterministicReply::text("NO_LIST_ACCESS"));
        };
        let result = runner.run(call(
            "list_add_item",
            json!({"list_id": list_id, "title_id": title_id, "position": 0}),
        ));
        let text = if result.is_ok() { "LIST_ADD_OK" } else { "NO_LIST_ACCESS" };
        return Some(DeterministicReply::text(text));
    }

    if REMOVE_FROM_LIST_RE.is_match(txt) && low.contains("list_remove_ok") {
        let title_id = resolve_chosen_title_id(txt, history);
        let list_id = extract_from_history(history, &LIST_CREATED_ID_RE).or_else(|| uuid_in(txt));
        let (Some(title_id), Some(list_id)) = (title_id, list_id) else {
            return Some(DeterministicReply::text("NO_LIST_ACCESS"));
        };
        let result = runner.run(call(
            "list_remove_item",
            json!({"list_id": list_id, "title_id": title_id}),
        ));
        let text = if result.is_ok() { "LIST_REMOVE_OK" } else { "NO_LIST_ACCESS" };
        return Some(DeterministicReply::text(text));
    }

    if LIST_ITEMS_RE.is_match(txt) && LIST_EMPTY_FORMAT_RE.is_match(txt) {
        let Some(list_id) = uuid_in(txt).or_else(|| extract_from_history(history, &LIST_CREATED_ID_RE))
        else {
            return Some(DeterministicReply::text("NO_LIST_ACCESS"));
        };
        let result = runner.run(call("get_list_items", json!({"list_id": list_id, "limit": 50})));
        let Some(value) = ok_value(&result) else {
            return Some(DeterministicReply::text("NO_LIST_ACCESS"));
        };
        let text = if pick_items(&value).is_empty() { "LIST_EMPTY_OK" } else { "LIST_NOT_EMPTY" };
        return Some(DeterministicReply::text(text));
    }

    if LIST_ITEMS_RE.is_match(txt) && low.contains("position") {
        let Some(list_id) = uuid_in(txt).or_else(|| extract_from_history(history, &LIST_CREATED_ID_RE))
        else {
            return Some(DeterministicReply::text("NO_LIST_ACCESS"));
        };
        let result = runner.run(call("get_list_items", json!({"list_id": list_id, "limit": 50})));
        let Some(value) = ok_value(&result) else {
            return Some(DeterministicReply::text("NO_LIST_ACCESS"));
        };
        let items = pick_items(&value);
        if items.is_empty() {
            return Some(DeterministicReply::text("NO_RESULTS"));
        }
        let lines: Vec<String> = items
            .iter()
            .enumerate()
            .map(|(idx, it)| {
                let position = it
                    .get("position")
                    .and_then(Value::as_u64)
                    .unwrap_or(idx as u64);
                format!(
                    "{} | {} | {}",
                    str_field(it, &["title_id", "titleId", "id"]),
                    str_field(it, &["title"]),
                    position,
                )
            })
            .collect();
        return Some(DeterministicReply::text(lines.join("\n")));
    }

    None
}

fn call(tool: &str, args: Value) -> ToolCall {
    ToolCall {
        tool: tool.to_string(),
        args,
    }
}

/// The payload of a successful result.
pub(crate) fn ok_value(result: &ToolResult) -> Option<Value> {
    match result {
        ToolResult::Ok { result, .. } => Some(result.clone()),
        ToolResult::Err { .. } => None,
    }
}

/// Tool payloads have drifted across versions; accept a bare array or an
/// `items`/`results` wrapper, one level deep.
pub(crate) fn pick_items(value: &Value) -> Vec<Value> {
    if let Some(arr) = value.as_array() {
        return arr.clone();
    }
    for key in ["items", "results"] {
        if let Some(arr) = value.get(key).and_then(Value::as_array) {
            return arr.clone();
        }
    }
    if let Some(nested) = value.get("result") {
        if let Some(arr) = nested.as_array() {
            return arr.clone();
        }
        for key in ["items", "results"] {
            if let Some(arr) = nested.get(key).and_then(Value::as_array) {
                return arr.clone();
            }
        }
    }
    Vec::new()
}

/// `id | title | year` lines, pipes in titles replaced so the format
/// stays machine-splittable.
pub(crate) fn format_title_lines(items: &[Value], limit: usize) -> String {
    items
        .iter()
        .take(limit)
        .map(|it| {
            format!(
                "{} | {} | {}",
                str_field(it, &["id", "title_id", "titleId"]),
                str_field(it, &["title"]).replace('|', "—"),
                year_of(it),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn str_field(value: &Value, keys: &[&str]) -> String {
    for key in keys {
        if let Some(s) = value.get(*key).and_then(Value::as_str) {
            return s.trim().to_string();
        }
    }
    String::new()
}

fn year_of(item: &Value) -> String {
    if let Some(year) = item.get("year") {
        if let Some(n) = year.as_u64() {
            return n.to_string();
        }
        if let Some(s) = year.as_str() {
            return s.chars().take(4).collect();
        }
    }
    for key in ["release_date", "releaseDate", "first_air_date", "firstAirDate"] {
        if let Some(s) = item.get(key).and_then(Value::as_str) {
            return s.chars().take(4).collect();
        }
    }
    String::new()
}

pub(crate) fn strip_quotes(text: &str) -> String {
    text.trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '“' | '”'))
        .trim()
        .to_string()
}

fn uuid_in(text: &str) -> Option<String> {
    UUID_RE.find(text).map(|m| m.as_str().to_string())
}

/// Newest-first scan of the conversation for an earlier exact-format
/// token (e.g. `CHOSEN_TITLE_ID=<uuid>`).
fn extract_from_history(history: &[ChatMessage], re: &Regex) -> Option<String> {
    history.iter().rev().find_map(|message| {
        re.captures(&message.content().as_text())
            .and_then(|cap| cap.get(1))
            .map(|m| m.as_str().to_string())
    })
}

fn resolve_chosen_title_id(text: &str, history: &[ChatMessage]) -> Option<String> {
    if let Some(cap) = CHOSEN_TITLE_RE.captures(text) {
        return Some(cap[1].to_string());
    }
    if text.to_lowercase().contains("chosen_title_id") {
        if let Some(id) = extract_from_history(history, &CHOSEN_TITLE_RE) {
            return Some(id);
        }
    }
    uuid_in(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StubRunner {
        results: HashMap<&'static str, ToolResult>,
        calls: Vec<ToolCall>,
    }

    impl StubRunner {
        fn new() -> Self {
            Self {
                results: HashMap::new(),
                calls: Vec::new(),
            }
        }

        fn with(mut self, tool: &'static str, result: ToolResult) -> Self {
            self.results.insert(tool, result);
            self
        }
    }

    impl ToolRunner for StubRunner {
        fn run(&mut self, call: ToolCall) -> ToolResult {
            self.calls.push(call.clone());
            self.results
                .get(call.tool.as_str())
                .cloned()
                .unwrap_or_else(|| ToolResult::err("TOOL_ERROR", "unscripted tool"))
        }
    }

    #[test]
    fn pong_needs_no_tools() {
        let mut runner = StubRunner::new();
        let reply = route("u1", "Reply exactly: pong", &[], &mut runner).expect("routed");
        assert_eq!(reply.text, "pong");
        assert!(runner.calls.is_empty());
    }

    #[test]
    fn trending_formats_strict_lines() {
        let mut runner = StubRunner::new().with(
            "get_trending",
            ToolResult::ok(json!({"items": [
                {"id": "0198b2f0-0000-7000-8000-000000000001", "title": "Dune: Part Two", "release_date": "2024-03-01"},
                {"id": "0198b2f0-0000-7000-8000-000000000002", "title": "Poor Things", "release_date": "2023-12-08"},
            ]})),
        );
        let reply = route(
            "u1",
            "Trending now please. Format each line exactly: `titleId | title | year`",
            &[],
            &mut runner,
        )
        .expect("routed");
        assert_eq!(
            reply.text,
            "0198b2f0-0000-7000-8000-000000000001 | Dune: Part Two | 2024\n\
             0198b2f0-0000-7000-8000-000000000002 | Poor Things | 2023"
        );
    }

    #[test]
    fn trending_failure_degrades_to_access_token() {
        let mut runner =
            StubRunner::new().with("get_trending", ToolResult::err("TOOL_ERROR", "down"));
        let reply = route(
            "u1",
            "Trending now. Format each line exactly: titleId | title | year",
            &[],
            &mut runner,
        )
        .expect("routed");
        assert_eq!(reply.text, "NO_CATALOG_ACCESS");
    }

    #[test]
    fn chosen_title_id_prefers_conversation_history() {
        let history = vec![ChatMessage::assistant(
            "CHOSEN_TITLE_ID=0198b2f0-0000-7000-8000-00000000aaaa",
        )];
        let mut runner = StubRunner::new();
        let reply = route(
            "u1",
            "Take the first titleId from your Trending list. Reply exactly CHOSEN_TITLE_ID=<id>",
            &history,
            &mut runner,
        )
        .expect("routed");
        assert_eq!(reply.text, "CHOSEN_TITLE_ID=0198b2f0-0000-7000-8000-00000000aaaa");
        assert!(runner.calls.is_empty());
    }

    #[test]
    fn watchlist_add_confirms_only_on_tool_success() {
        let history = vec![ChatMessage::assistant(
            "CHOSEN_TITLE_ID=0198b2f0-0000-7000-8000-00000000aaaa",
        )];
        let mut ok_runner =
            StubRunner::new().with("diary_set_status", ToolResult::ok(json!({"verified": true})));
        let reply = route(
            "u1",
            "Add CHOSEN_TITLE_ID to my watchlist with status=want_to_watch. Reply exactly WATCHLIST_OK",
            &history,
            &mut ok_runner,
        )
        .expect("routed");
        assert_eq!(reply.text, "WATCHLIST_OK");
        assert_eq!(ok_runner.calls[0].args["status"], json!("want_to_watch"));

        let mut err_runner =
            StubRunner::new().with("diary_set_status", ToolResult::err("TOOL_ERROR", "denied"));
        let reply = route(
            "u1",
            "Add CHOSEN_TITLE_ID to my watchlist with status=want_to_watch. Reply exactly WATCHLIST_OK",
            &history,
            &mut err_runner,
        )
        .expect("routed");
        assert_eq!(reply.text, "NO_WRITE_ACCESS");
    }

    #[test]
    fn other_users_watchlist_is_refused() {
        let mut runner = StubRunner::new();
        let reply = route(
            "0198b2f0-0000-7000-8000-00000000bbbb",
            "Show the watchlist for userId=0198b2f0-0000-7000-8000-00000000cccc. Reply exactly: NO_ACCESS",
            &[],
            &mut runner,
        )
        .expect("routed");
        assert_eq!(reply.text, "NO_ACCESS");
        assert!(runner.calls.is_empty());
    }

    #[test]
    fn list_create_echoes_the_new_id() {
        let mut runner = StubRunner::new().with(
            "create_list",
            ToolResult::ok(json!({"list_id": "0198b2f0-0000-7000-8000-00000000dddd"})),
        );
        let reply = route(
            "u1",
            "Create a list named: \"Smoke Test List\" (private). Reply exactly as: LIST_CREATED=<listId>",
            &[],
            &mut runner,
        )
        .expect("routed");
        assert_eq!(reply.text, "LIST_CREATED=0198b2f0-0000-7000-8000-00000000dddd");
        assert_eq!(runner.calls[0].args["list_name"], json!("Smoke Test List"));
        assert_eq!(runner.calls[0].args["is_public"], json!(false));
    }

    #[test]
    fn conversational_messages_fall_through() {
        let mut runner = StubRunner::new();
        assert!(route("u1", "What should I watch tonight?", &[], &mut runner).is_none());
        assert!(runner.calls.is_empty());
    }
}
