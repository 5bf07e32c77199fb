//! Ordered-model routing over the upstream gateway.
//!
//! For each candidate model (circuit permitting) the router walks the
//! capability-gated variant ladder until one payload is accepted.
//! First success wins and closes the model's circuit; exhaustion raises
//! an aggregate failure carrying every attempt.

use crate::capability::{CapabilityGate, CapabilityKey};
use crate::circuit::{CircuitBreaker, should_trip};
use crate::variants::{
    PayloadVariant, apply_provider_requirement, build_variants, dedup_variants, gate_payload,
    should_require_matched_providers,
};
use chrono::Duration;
use filmbuddy_core::{ChatRequest, Clock, GatewayConfig, SharedClock, StreamCallback, StreamChunk};
use filmbuddy_errors::{
    Attempt, Culprit, CulpritSource, ErrorCode, ErrorEnvelope, classify_upstream, preview,
    upstream_error_message,
};
use rand::Rng;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::{Value, json};
use std::io::BufRead;
use std::sync::Arc;
use std::thread;

/// A usable completion from one (model, variant) attempt.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub content: String,
    pub model_used: String,
    pub variant_used: String,
    pub finish_reason: String,
    pub raw: Value,
}

/// The routing surface the orchestrator talks to. Trait-shaped so agent
/// tests can script outcomes without a network.
pub trait LlmGateway: Send + Sync {
    fn route(&self, req: &ChatRequest) -> Result<RouteOutcome, ErrorEnvelope>;

    /// Streaming variant. Model/variant fallback happens only before the
    /// first content delta reaches `cb`; afterwards a failure is final.
    fn route_stream(
        &self,
        req: &ChatRequest,
        cb: StreamCallback,
    ) -> Result<RouteOutcome, ErrorEnvelope>;
}

enum VariantOutcome {
    Success(RouteOutcome),
    NextVariant,
    AbandonModel,
}

pub struct ModelRouter {
    cfg: GatewayConfig,
    client: Client,
    circuit: Arc<CircuitBreaker>,
    capabilities: Arc<CapabilityGate>,
    clock: SharedClock,
}

impl ModelRouter {
    pub fn new(
        cfg: GatewayConfig,
        circuit: Arc<CircuitBreaker>,
        capabilities: Arc<CapabilityGate>,
        clock: SharedClock,
    ) -> filmbuddy_core::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self {
            cfg,
            client,
            circuit,
            capabilities,
            clock,
        })
    }

    fn resolve_api_key(&self) -> Option<String> {
        std::env::var(&self.cfg.api_key_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                self.cfg
                    .api_key
                    .as_ref()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
    }

    fn not_configured(&self, reason: &str, var: &str) -> ErrorEnvelope {
        ErrorEnvelope::new(ErrorCode::NotConfigured, reason)
            .with_culprit(Culprit::new(var, CulpritSource::Env))
    }

    /// Per-model variant list: capability-gated, provider-matched,
    /// structurally deduplicated, with the model id filled in.
    fn variants_for_model(&self, req: &ChatRequest, ladder: &[PayloadVariant], model: &str) -> Vec<PayloadVariant> {
        let provider = req.provider.order.first().map(String::as_str);
        let key = CapabilityKey::new(&req.base_url, model, provider);
        let capabilities = self.capabilities.resolve(&key);
        let gated: Vec<PayloadVariant> = ladder
            .iter()
            .map(|variant| {
                let mut payload = gate_payload(&variant.payload, capabilities.as_ref());
                let require = should_require_matched_providers(
                    self.cfg.provider_match,
                    req.provider.require_parameters,
                    &payload,
                );
                apply_provider_requirement(&mut payload, require);
                payload["model"] = json!(model);
                PayloadVariant {
                    tag: variant.tag,
                    payload,
                }
            })
            .collect();
        dedup_variants(gated)
    }

    fn remaining_timeout(&self, req: &ChatRequest) -> Option<std::time::Duration> {
        let remaining = req.deadline.signed_duration_since(self.clock.now());
        if remaining <= Duration::zero() {
            return None;
        }
        let capped = if remaining < req.timeout {
            remaining
        } else {
            req.timeout
        };
        capped.to_std().ok()
    }

    fn chat_url(&self, req: &ChatRequest) -> String {
        format!("{}/chat/completions", req.base_url.trim_end_matches('/'))
    }

    /// Bounded wait before the single 429 retry: the upstream hint,
    /// capped, plus a little jitter to spread concurrent retriers.
    fn rate_limit_delay(&self, retry_after_seconds: Option<u64>) -> std::time::Duration {
        let base_ms = retry_after_seconds
            .map(|s| s.min(self.cfg.retry_after_cap_seconds) * 1000)
            .unwrap_or(1000);
        let jitter = rand::thread_rng().gen_range(0..250);
        std::time::Duration::from_millis(base_ms + jitter)
    }

    fn send_once(
        &self,
        req: &ChatRequest,
        model: &str,
        variant: &PayloadVariant,
        api_key: &str,
        attempts: &mut Vec<Attempt>,
    ) -> Result<AttemptReply, VariantOutcome> {
        let Some(timeout) = self.remaining_timeout(req) else {
            return Err(VariantOutcome::AbandonModel);
        };
        let response = self
            .client
            .post(self.chat_url(req))
            .bearer_auth(api_key)
            .timeout(timeout)
            .json(&variant.payload)
            .send();
        match response {
            Ok(resp) => {
                let status = resp.status();
                let upstream_request_id = resp
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .map(ToString::to_string);
                let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
                Ok(AttemptReply {
                    status,
                    retry_after,
                    upstream_request_id,
                    response: resp,
                })
            }
            Err(err) => {
                // Transport failure: no status, transient by definition.
                self.circuit
                    .on_failure(model, None, Some(&err.to_string()), None);
                attempts.push(Attempt {
                    model: model.to_string(),
                    variant: variant.tag.as_str().to_string(),
                    status: None,
                    message: Some(preview(&err.to_string(), 220)),
                    upstream_request_id: None,
                });
                Err(VariantOutcome::NextVariant)
            }
        }
    }

    fn record_http_failure(
        &self,
        model: &str,
        variant: &PayloadVariant,
        status: StatusCode,
        body: &str,
        retry_after: Option<u64>,
        upstream_request_id: Option<String>,
        attempts: &mut Vec<Attempt>,
    ) {
        let message = serde_json::from_str::<Value>(body)
            .ok()
            .as_ref()
            .and_then(upstream_error_message)
            .unwrap_or_else(|| body.chars().take(220).collect());
        if should_trip(Some(status.as_u16())) {
            self.circuit
                .on_failure(model, Some(status.as_u16()), Some(&message), retry_after);
        }
        attempts.push(Attempt {
            model: model.to_string(),
            variant: variant.tag.as_str().to_string(),
            status: Some(status.as_u16()),
            message: Some(preview(&message, 220)),
            upstream_request_id,
        });
    }

    fn try_variant(
        &self,
        req: &ChatRequest,
        model: &str,
        variant: &PayloadVariant,
        api_key: &str,
        attempts: &mut Vec<Attempt>,
    ) -> VariantOutcome {
        // One bounded 429 retry per variant, then move on.
        let mut rate_limit_retried = false;
        loop {
            let reply = match self.send_once(req, model, variant, api_key, attempts) {
                Ok(reply) => reply,
                Err(outcome) => return outcome,
            };
            let status = reply.status;
            if status.is_success() {
                let body = match reply.response.text() {
                    Ok(body) => body,
                    Err(err) => {
                        attempts.push(Attempt {
                            model: model.to_string(),
                            variant: variant.tag.as_str().to_string(),
                            status: Some(status.as_u16()),
                            message: Some(format!("body read failed: {err}")),
                            upstream_request_id: reply.upstream_request_id,
                        });
                        return VariantOutcome::NextVariant;
                    }
                };
                return match parse_completion(&body) {
                    Some((content, finish_reason, raw)) if !content.trim().is_empty() => {
                        VariantOutcome::Success(RouteOutcome {
                            content,
                            model_used: model.to_string(),
                            variant_used: variant.tag.as_str().to_string(),
                            finish_reason,
                            raw,
                        })
                    }
                    _ => {
                        // Accepted but useless: an empty completion is not
                        // a success, try the next candidate model.
                        attempts.push(Attempt {
                            model: model.to_string(),
                            variant: variant.tag.as_str().to_string(),
                            status: Some(status.as_u16()),
                            message: Some("empty completion".to_string()),
                            upstream_request_id: reply.upstream_request_id,
                        });
                        VariantOutcome::AbandonModel
                    }
                };
            }

            let retry_after = reply.retry_after;
            let body = reply.response.text().unwrap_or_default();
            self.record_http_failure(
                model,
                variant,
                status,
                &body,
                retry_after,
                reply.upstream_request_id.clone(),
                attempts,
            );

            match status.as_u16() {
                429 if !rate_limit_retried => {
                    rate_limit_retried = true;
                    thread::sleep(self.rate_limit_delay(retry_after));
                    continue;
                }
                // Transient or payload-shape rejections walk the ladder.
                400 | 408 | 429 => return VariantOutcome::NextVariant,
                s if s >= 500 => return VariantOutcome::NextVariant,
                // Anything else (401/403/404…) is not a variant problem.
                _ => return VariantOutcome::AbandonModel,
            }
        }
    }

    fn exhausted(&self, attempts: Vec<Attempt>) -> ErrorEnvelope {
        let Some(last) = attempts.last().cloned() else {
            return ErrorEnvelope::new(
                ErrorCode::UpstreamUnavailable,
                "all candidate models are cooling down",
            );
        };
        let message = last.message.clone().unwrap_or_default();
        let code = classify_upstream(last.status, &message);
        let reason = match last.status {
            Some(status) => format!("upstream returned {status}: {message}"),
            None => message.clone(),
        };
        let mut envelope = ErrorEnvelope::new(code, reason)
            .with_model(last.model.clone())
            .with_attempts(attempts);
        if let Some(status) = last.status {
            envelope = envelope.with_status(status);
        }
        if code == ErrorCode::Unauthorized {
            envelope = envelope.with_culprit(Culprit::new(
                self.cfg.api_key_env.clone(),
                CulpritSource::Env,
            ));
        }
        envelope
    }
}

struct AttemptReply {
    status: StatusCode,
    retry_after: Option<u64>,
    upstream_request_id: Option<String>,
    response: reqwest::blocking::Response,
}

impl LlmGateway for ModelRouter {
    fn route(&self, req: &ChatRequest) -> Result<RouteOutcome, ErrorEnvelope> {
        let api_key = self.resolve_api_key().ok_or_else(|| {
            self.not_configured(
                &format!("{} not set and gateway.api_key is empty", self.cfg.api_key_env),
                &self.cfg.api_key_env,
            )
        })?;
        if req.models.is_empty() {
            return Err(self.not_configured("no candidate models configured", "gateway.models"));
        }

        let ladder = build_variants(req, &self.cfg);
        let mut attempts: Vec<Attempt> = Vec::new();
        for model in &req.models {
            if self.circuit.is_open(model) {
                continue;
            }
            let variants = self.variants_for_model(req, &ladder, model);
            for variant in &variants {
                match self.try_variant(req, model, variant, &api_key, &mut attempts) {
                    VariantOutcome::Success(outcome) => {
                        self.circuit.on_success(model);
                        return Ok(outcome);
                    }
                    VariantOutcome::NextVariant => {}
                    VariantOutcome::AbandonModel => break,
                }
            }
        }
        Err(self.exhausted(attempts))
    }

    fn route_stream(
        &self,
        req: &ChatRequest,
        cb: StreamCallback,
    ) -> Result<RouteOutcome, ErrorEnvelope> {
        let api_key = self.resolve_api_key().ok_or_else(|| {
            self.not_configured(
                &format!("{} not set and gateway.api_key is empty", self.cfg.api_key_env),
                &self.cfg.api_key_env,
            )
        })?;
        if req.models.is_empty() {
            return Err(self.not_configured("no candidate models configured", "gateway.models"));
        }

        let ladder = build_variants(req, &self.cfg);
        let mut attempts: Vec<Attempt> = Vec::new();
        for model in &req.models {
            if self.circuit.is_open(model) {
                continue;
            }
            let variants = self.variants_for_model(req, &ladder, model);
            'variants: for variant in &variants {
                let mut payload = variant.payload.clone();
                payload["stream"] = json!(true);
                let streaming = PayloadVariant {
                    tag: variant.tag,
                    payload,
                };
                let reply = match self.send_once(req, model, &streaming, &api_key, &mut attempts) {
                    Ok(reply) => reply,
                    Err(VariantOutcome::AbandonModel) => break 'variants,
                    Err(_) => continue 'variants,
                };
                let status = reply.status;
                if !status.is_success() {
                    let retry_after = reply.retry_after;
                    let body = reply.response.text().unwrap_or_default();
                    self.record_http_failure(
                        model,
                        variant,
                        status,
                        &body,
                        retry_after,
                        reply.upstream_request_id,
                        &mut attempts,
                    );
                    match status.as_u16() {
                        400 | 408 | 429 => continue 'variants,
                        s if s >= 500 => continue 'variants,
                        _ => break 'variants,
                    }
                }

                // Headers accepted; bytes may now flow. The moment the
                // first delta reaches the callback, fallback is over.
                match read_sse_stream(reply.response, &cb) {
                    Ok((content, finish_reason)) if !content.trim().is_empty() => {
                        self.circuit.on_success(model);
                        return Ok(RouteOutcome {
                            content,
                            model_used: model.to_string(),
                            variant_used: variant.tag.as_str().to_string(),
                            finish_reason,
                            raw: Value::Null,
                        });
                    }
                    Ok(_) => {
                        attempts.push(Attempt {
                            model: model.to_string(),
                            variant: variant.tag.as_str().to_string(),
                            status: Some(status.as_u16()),
                            message: Some("empty stream".to_string()),
                            upstream_request_id: None,
                        });
                        break 'variants;
                    }
                    Err(StreamFailure::BeforeFirstToken(message)) => {
                        self.circuit.on_failure(model, None, Some(&message), None);
                        attempts.push(Attempt {
                            model: model.to_string(),
                            variant: variant.tag.as_str().to_string(),
                            status: None,
                            message: Some(message),
                            upstream_request_id: None,
                        });
                        continue 'variants;
                    }
                    Err(StreamFailure::MidStream(message)) => {
                        // Known limitation: once tokens were delivered the
                        // failure is surfaced, never silently retried.
                        attempts.push(Attempt {
                            model: model.to_string(),
                            variant: variant.tag.as_str().to_string(),
                            status: None,
                            message: Some(message.clone()),
                            upstream_request_id: None,
                        });
                        return Err(ErrorEnvelope::new(
                            ErrorCode::UpstreamUnavailable,
                            format!("stream interrupted after first token: {message}"),
                        )
                        .with_model(model.clone())
                        .with_attempts(attempts));
                    }
                }
            }
        }
        Err(self.exhausted(attempts))
    }
}

enum StreamFailure {
    BeforeFirstToken(String),
    MidStream(String),
}

/// Read an SSE body line-by-line, forwarding each content delta.
fn read_sse_stream(
    response: reqwest::blocking::Response,
    cb: &StreamCallback,
) -> Result<(String, String), StreamFailure> {
    let mut content_out = String::new();
    let mut finish_reason: Option<String> = None;
    let mut delivered = false;

    let reader = std::io::BufReader::new(response);
    for line_result in reader.lines() {
        let line = match line_result {
            Ok(line) => line,
            Err(err) => {
                let message = format!("stream read error: {err}");
                return if delivered {
                    Err(StreamFailure::MidStream(message))
                } else {
                    Err(StreamFailure::BeforeFirstToken(message))
                };
            }
        };
        let trimmed = line.trim();
        if !trimmed.starts_with("data:") {
            continue;
        }
        let chunk = trimmed.trim_start_matches("data:").trim();
        if chunk == "[DONE]" {
            cb(StreamChunk::Done);
            break;
        }
        let value: Value = match serde_json::from_str(chunk) {
            Ok(value) => value,
            Err(_) => continue,
        };
        let choice = value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first());
        let Some(choice) = choice else {
            continue;
        };
        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            finish_reason = Some(reason.to_string());
        }
        if let Some(delta) = choice.get("delta")
            && let Some(content) = delta.get("content").and_then(|v| v.as_str())
        {
            content_out.push_str(content);
            delivered = true;
            cb(StreamChunk::ContentDelta(content.to_string()));
        }
    }

    Ok((content_out, finish_reason.unwrap_or_else(|| "stop".to_string())))
}

/// Extract (content, finish_reason, raw) from a non-streaming completion
/// body. Providers answer with `message.content` or legacy `text`.
fn parse_completion(body: &str) -> Option<(String, String, Value)> {
    let raw: Value = serde_json::from_str(body).ok()?;
    let choice = raw.get("choices")?.as_array()?.first()?;
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("stop")
        .to_string();
    let content = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .or_else(|| choice.get("text").and_then(|v| v.as_str()))
        .unwrap_or_default()
        .to_string();
    Some((content, finish_reason, raw))
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    parse_retry_after_http_date(value)
}

fn parse_retry_after_http_date(value: &str) -> Option<u64> {
    use chrono::{DateTime, NaiveDateTime, Utc};
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let delta = retry_at.signed_duration_since(Utc::now()).num_seconds();
    Some(delta.max(0) as u64)
}
