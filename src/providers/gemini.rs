//! Gemini REST adapter
//!
//! Posts the conversation to the generateContent endpoint. History roles
//! map `assistant -> model`; the free tier is paced by the process-global
//! rate limiter before every request.

use super::{log_payload, Provider, ProviderError, RateLimiter, Role, Turn, TurnOutput};
use crate::cancel::CancelSignal;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const TEMPERATURE: f64 = 0.3;
const MAX_OUTPUT_TOKENS: u32 = 4096;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct GeminiProvider {
    client: reqwest::Client,
    model: String,
    api_key: Option<String>,
    rate_limiter: Arc<RateLimiter>,
}

impl GeminiProvider {
    pub fn new(model: String, api_key: Option<String>, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client"),
            model,
            api_key,
            rate_limiter,
        }
    }

    fn build_body(history: &[Turn]) -> Value {
        let contents: Vec<Value> = history
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                };
                json!({ "role": role, "parts": [{ "text": turn.text }] })
            })
            .collect();
        json!({
            "contents": contents,
            "generationConfig": {
                "temperature": TEMPERATURE,
                "maxOutputTokens": MAX_OUTPUT_TOKENS,
            }
        })
    }

    fn classify_status(status: u16, retry_after_secs: Option<u64>, body: &str) -> ProviderError {
        match status {
            429 => ProviderError::RateLimited { retry_after_secs },
            401 | 403 => ProviderError::Auth(format!("gemini returned {}", status)),
            s if s >= 500 => ProviderError::Server { status: s },
            s => ProviderError::Api {
                status: s,
                message: crate::util::truncate_utf8_safe(body, 200).to_string(),
            },
        }
    }

    fn parse_reply(data: &Value) -> Result<TurnOutput, ProviderError> {
        let text: String = data["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(ProviderError::EmptyReply);
        }

        let usage = &data["usageMetadata"];
        Ok(TurnOutput {
            text,
            input_tokens: usage["promptTokenCount"].as_u64(),
            output_tokens: usage["candidatesTokenCount"].as_u64(),
            memory_session_id: None,
        })
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
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
            .ok_or_else(|| ProviderError::Auth("GEMINI_API_KEY not configured".into()))?;

        self.rate_limiter.wait_turn(&self.model).await;
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            BASE_URL, self.model, api_key
        );
        let body = Self::build_body(history);
        log_payload("request", self.name(), &body.to_string());

        let request = self.client.post(&url).json(&body).send();
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
    fn assistant_maps_to_model_role() {
        let body = GeminiProvider::build_body(&[
            Turn::user("hi"),
            Turn::assistant("hello"),
        ]);
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["generationConfig"]["temperature"], 0.3);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 4096);
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            GeminiProvider::classify_status(429, Some(30), ""),
            ProviderError::RateLimited { retry_after_secs: Some(30) }
        ));
        assert!(matches!(
            GeminiProvider::classify_status(503, None, ""),
            ProviderError::Server { status: 503 }
        ));
        assert!(matches!(
            GeminiProvider::classify_status(403, None, ""),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            GeminiProvider::classify_status(400, None, "bad request"),
            ProviderError::Api { status: 400, .. }
        ));
    }

    #[test]
    fn parses_candidates_and_usage() {
        let data = serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "a" }, { "text": "b" }] } }],
            "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 4 }
        });
        let out = GeminiProvider::parse_reply(&data).unwrap();
        assert_eq!(out.text, "ab");
        assert_eq!(out.input_tokens, Some(10));
        assert_eq!(out.output_tokens, Some(4));
    }

    #[test]
    fn blank_reply_is_empty_error() {
        let data = serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": "  " }] } }]
        });
        assert!(matches!(
            GeminiProvider::parse_reply(&data),
            Err(ProviderError::EmptyReply)
        ));
    }
}
