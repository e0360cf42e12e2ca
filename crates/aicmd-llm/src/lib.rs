use aicmd_core::{ChatMessage, ChatRequest, CompletionRequest, LlmConfig};
use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::{Value, json};
use std::error::Error as StdError;
use std::thread;
use std::time::Duration;

/// Base delay for network/transport error retries (1s, 2s, 4s exponential backoff).
const NETWORK_RETRY_BASE_MS: u64 = 1000;

pub trait LlmClient {
    /// One-shot completion. Returns every choice in the order the service
    /// produced them; a choice without text is an empty string.
    fn complete(&self, req: &CompletionRequest) -> Result<Vec<String>>;

    /// Multi-turn chat. Returns the assistant reply text.
    fn chat(&self, req: &ChatRequest) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    cfg: LlmConfig,
    client: Client,
}

impl OpenAiClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self { cfg, client })
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

    fn require_api_key(&self) -> Result<String> {
        self.resolve_api_key()
            .ok_or_else(|| anyhow!("{} not set and llm.api_key is empty", self.cfg.api_key_env))
    }

    fn build_completion_payload(&self, req: &CompletionRequest) -> Value {
        json!({
            "model": self.cfg.model,
            "messages": [{"role": "user", "content": req.prompt}],
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
            "top_p": req.top_p,
            "n": req.n.max(1),
        })
    }

    fn build_chat_payload(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| json!({"role": m.role(), "content": m.content()}))
            .collect();
        let mut payload = json!({
            "model": self.cfg.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
        });
        if let Some(temp) = req.temperature {
            payload["temperature"] = json!(temp);
        }
        payload
    }

    /// POST `payload` and return the body of the first successful response.
    fn post_with_retries(&self, payload: &Value, api_key: &str) -> Result<String> {
        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            let response = self
                .client
                .post(&self.cfg.endpoint)
                .bearer_auth(api_key)
                .json(payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER))
                        .map(|seconds| seconds.min(self.cfg.timeout_seconds));
                    let body = resp.text()?;
                    if status.is_success() {
                        return Ok(body);
                    }
                    last_err = Some(format_api_error(
                        status,
                        &body,
                        attempt,
                        self.cfg.max_retries,
                        &self.cfg.api_key_env,
                    ));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(self.cfg.retry_base_ms, attempt, retry_after));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(format_transport_error(&e));
                    if should_retry_transport_error(&e) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(NETWORK_RETRY_BASE_MS, attempt, None));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("completion request failed without detailed error")))
    }
}

impl LlmClient for OpenAiClient {
    fn complete(&self, req: &CompletionRequest) -> Result<Vec<String>> {
        let key = self.require_api_key()?;
        let body = self.post_with_retries(&self.build_completion_payload(req), &key)?;
        parse_completion_payload(&body)
    }

    fn chat(&self, req: &ChatRequest) -> Result<String> {
        let key = self.require_api_key()?;
        let body = self.post_with_retries(&self.build_chat_payload(req), &key)?;
        parse_chat_payload(&body)
    }
}

/// Convenience for callers that only hold a history slice.
pub fn chat_request(messages: &[ChatMessage], temperature: f32, max_tokens: u32) -> ChatRequest {
    ChatRequest {
        messages: messages.to_vec(),
        temperature: Some(temperature),
        max_tokens,
    }
}

/// Produce a user-friendly error from an API HTTP response.
fn format_api_error(
    status: StatusCode,
    body: &str,
    attempt: u8,
    max_retries: u8,
    api_key_env: &str,
) -> anyhow::Error {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        StatusCode::UNAUTHORIZED => anyhow!(
            "Invalid or missing API key (HTTP 401).\n\
             Set {api_key_env}, configure llm.api_key in settings.json, \
             or remove the key file to be prompted again."
        ),
        StatusCode::TOO_MANY_REQUESTS => anyhow!(
            "Rate limited (HTTP 429). Exhausted {}/{} retries. Try again shortly. Detail: {}",
            attempt + 1,
            max_retries + 1,
            detail
        ),
        StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE => anyhow!(
            "Completion service error (HTTP {}). Exhausted {}/{} retries. Detail: {}",
            status.as_u16(),
            attempt + 1,
            max_retries + 1,
            detail
        ),
        _ => anyhow!(
            "Completion service error (HTTP {}): {}",
            status.as_u16(),
            detail
        ),
    }
}

/// Produce a user-friendly error from a transport/network failure.
fn format_transport_error(err: &reqwest::Error) -> anyhow::Error {
    let inner_msg = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let is_dns = inner_msg.contains("dns")
        || inner_msg.contains("resolve")
        || inner_msg.contains("name or service not known")
        || inner_msg.contains("no such host");

    if err.is_timeout() {
        anyhow!(
            "Request timed out. If this persists, increase llm.timeout_seconds in settings.json."
        )
    } else if is_dns {
        anyhow!("DNS resolution failed. Check your internet connection and DNS settings.")
    } else if err.is_connect() {
        anyhow!("Connection refused. Could not reach the completion service endpoint.")
    } else {
        anyhow!("Network error: {err}")
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::SERVICE_UNAVAILABLE
    )
}

fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    parse_retry_after_http_date(value)
}

fn parse_retry_after_http_date(value: &str) -> Option<u64> {
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

fn retry_delay_ms(base_ms: u64, attempt: u8, retry_after_seconds: Option<u64>) -> Duration {
    if let Some(seconds) = retry_after_seconds {
        return Duration::from_millis(seconds.saturating_mul(1000));
    }
    let exponent = u32::from(attempt);
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(exponential.max(base_ms.max(100)))
}

/// Collect `choices[i].message.content` in index order. A body without
/// `choices` yields an empty list so callers can fall back.
fn parse_completion_payload(body: &str) -> Result<Vec<String>> {
    let value: Value = serde_json::from_str(body)?;
    let Some(choices) = value.get("choices").and_then(|v| v.as_array()) else {
        return Ok(Vec::new());
    };
    let mut indexed: Vec<(u64, String)> = choices
        .iter()
        .enumerate()
        .map(|(pos, choice)| {
            let index = choice
                .get("index")
                .and_then(|v| v.as_u64())
                .unwrap_or(pos as u64);
            (index, choice_text(choice))
        })
        .collect();
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, text)| text).collect())
}

fn parse_chat_payload(body: &str) -> Result<String> {
    Ok(parse_completion_payload(body)?
        .into_iter()
        .next()
        .unwrap_or_default())
}

fn choice_text(choice: &Value) -> String {
    choice
        .get("message")
        .and_then(|m| m.get("content"))
        .or_else(|| choice.get("text"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
