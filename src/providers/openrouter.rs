//! OpenRouter REST adapter
//!
//! OpenAI-shaped chat completions. OpenRouter fronts models with widely
//! varying context windows, so an estimated-token guard drops the oldest
//! history turns (keeping the first, which carries the session framing)
//! before a request can overflow the bound.

use super::{log_payload, Provider, ProviderError, Role, Turn, TurnOutput};
use crate::cancel::CancelSignal;
use crate::util::estimate_read_tokens;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

const BASE_URL: &str = "https://openrouter.ai/api/v1";
const MAX_TOKENS: u32 = 4096;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Conservative context bound applied to the estimated prompt size.
const MAX_CONTEXT_TOKENS: u64 = 100_000;

pub struct OpenRouterProvider {
    client: reqwest::Client,
    model: String,
    api_key: Option<String>,
}

impl OpenRouterProvider {
    pub fn new(model: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client"),
            model,
            api_key,
        }
    }

    /// Drop oldest turns (after the first) until the estimate fits.
    fn bounded_history(history: &[Turn]) -> Vec<&Turn> {
        let mut kept: Vec<&Turn> = history.iter().collect();
        let estimate = |turns: &[&Turn]| -> u64 {
            turns.iter().map(|t| estimate_read_tokens(&t.text)).sum()
        };
        while kept.len() > 2 && estimate(&kept) > MAX_CONTEXT_TOKENS {
            kept.remove(1);
        }
        kept
    }

    fn build_body(&self, history: &[Turn]) -> Value {
        let messages: Vec<Value> = Self::bounded_history(history)
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                json!({ "role": role, "content": turn.text })
            })
            .collect();
        json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": MAX_TOKENS,
        })
    }

    fn classify_status(status: u16, retry_after_secs: Option<u64>, body: &str) -> ProviderError {
        match status {
            429 => ProviderError::RateLimited { retry_after_secs },
            401 | 403 => ProviderError::Auth(format!("openrouter returned {}", status)),
            s if s >= 500 => ProviderError::Server { status: s },
            s => ProviderError::Api {
                status: s,
                message: crate::util::truncate_utf8_safe(body, 200).to_string(),
            },
        }
    }

    fn parse_reply(data: &Value) -> Result<TurnOutput, ProviderError> {
        let text = data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if text.trim().is_empty() {
            return Err(ProviderError::EmptyReply);
        }
        let usage = &data["usage"];
        Ok(TurnOutput {
            text,
            input_tokens: usage["prompt_tokens"].as_u64(),
            output_tokens: usage["completion_tokens"].as_u64(),
            memory_session_id: None,
        })
    }
}

#[async_trait]
impl Provider for OpenRouterProvider {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    async fn run_turn(
        &self,
        history: &[Turn],
        _memory_session_id: Option<&str>,
        cancel: &CancelSignal,
    ) -> Result<TurnOutput, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Auth("OPENROUTER_API_KEY not configured".into()))?;

        let body = self.build_body(history);
        log_payload("request", self.name(), &body.to_string());

        let request = self
            .client
            .post(format!("{}/chat/completions", BASE_URL))
            .bearer_auth(api_key)
            .json(&body)
            .send();
        let response = tokio::select! {
            r = request => r.map_err(|e| ProviderError::Network(e.to_string()))?,
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        let status = response.status().as_u16();
        let retry_after = super::retry_after_secs(response.headers());
        let text = tokio::select! {
            t = response.text() => t.map_err(|e| ProviderError::Network(e.to_string()))?,
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };
        log_payload("response", self.name(), &text);

        if status != 200 {
            return Err(Self::classify_status(status, retry_after, &text));
        }
        let data: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Self::parse_reply(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_bound_drops_middle_turns_first() {
        let mut history = vec![Turn::user("init framing")];
        for i in 0..100 {
            history.push(Turn::user(format!("turn {} {}", i, "x".repeat(8000))));
        }
        let kept = OpenRouterProvider::bounded_history(&history);
        assert!(kept.len() < history.len());
        assert_eq!(kept[0].text, "init framing");
        // The newest turn always survives.
        assert_eq!(kept.last().unwrap().text, history.last().unwrap().text);
    }

    #[test]
    fn parses_choice_and_usage() {
        let data = serde_json::json!({
            "choices": [{ "message": { "content": "reply" } }],
            "usage": { "prompt_tokens": 20, "completion_tokens": 5 }
        });
        let out = OpenRouterProvider::parse_reply(&data).unwrap();
        assert_eq!(out.text, "reply");
        assert_eq!(out.input_tokens, Some(20));
        assert_eq!(out.output_tokens, Some(5));
    }

    #[test]
    fn missing_content_is_empty_reply() {
        let data = serde_json::json!({ "choices": [] });
        assert!(matches!(
            OpenRouterProvider::parse_reply(&data),
            Err(ProviderError::EmptyReply)
        ));
    }
}
