//! Provider adapters
//!
//! A uniform async interface over the three LLM backends the agent can
//! drive: the Claude CLI as a subprocess, and the Gemini / OpenRouter REST
//! APIs. Errors carry a fallback classification so the agent loop can hand
//! a transient failure to the configured fallback provider with the same
//! session state.

mod claude;
mod gemini;
mod openrouter;
mod ratelimit;

pub use claude::ClaudeCliProvider;
pub use gemini::GeminiProvider;
pub use openrouter::OpenRouterProvider;
pub use ratelimit::RateLimiter;

use crate::cancel::CancelSignal;
use crate::config::{ProviderKind, Settings};
use crate::credentials::Credentials;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// One conversation turn in provider-neutral form.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, text: text.into() }
    }
}

/// Result of one provider turn.
#[derive(Debug, Clone, Default)]
pub struct TurnOutput {
    pub text: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    /// Provider-side session id, when the backend manages its own resume
    /// state (the Claude CLI reports one).
    pub memory_session_id: Option<String>,
}

/// Split a total token count when the provider gives no precise split.
/// Observed traffic runs roughly 70% input / 30% output.
pub fn split_estimated_tokens(total: u64) -> (u64, u64) {
    let input = total * 70 / 100;
    (input, total - input)
}

/// Errors from provider turns, classified for the fallback decision.
#[derive(Debug)]
pub enum ProviderError {
    /// HTTP 429 or an explicit rate-limit signal.
    RateLimited { retry_after_secs: Option<u64> },
    /// HTTP 5xx.
    Server { status: u16 },
    /// Connection reset, DNS failure, timeout.
    Network(String),
    /// Authentication or authorization failure (401/403, missing key).
    Auth(String),
    /// Any other non-retryable API error.
    Api { status: u16, message: String },
    /// The provider returned a well-formed but empty reply.
    EmptyReply,
    /// Subprocess could not be spawned or exited abnormally.
    Spawn(String),
    /// The provider reply could not be decoded.
    Malformed(String),
    /// The session's cancel token fired mid-call.
    Cancelled,
}

impl ProviderError {
    /// True for errors where trying the configured fallback provider makes
    /// sense: rate limits, server-side failures and transport loss. Plain
    /// 4xx and auth failures are fatal to the current provider.
    pub fn should_fall_back(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Server { .. } | Self::Network(_)
        )
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { retry_after_secs } => match retry_after_secs {
                Some(secs) => write!(f, "rate limited, retry after {}s", secs),
                None => write!(f, "rate limited"),
            },
            Self::Server { status } => write!(f, "server error ({})", status),
            Self::Network(msg) => write!(f, "network error: {}", msg),
            Self::Auth(msg) => write!(f, "auth error: {}", msg),
            Self::Api { status, message } => write!(f, "API error ({}): {}", status, message),
            Self::EmptyReply => write!(f, "empty reply"),
            Self::Spawn(msg) => write!(f, "subprocess error: {}", msg),
            Self::Malformed(msg) => write!(f, "malformed reply: {}", msg),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for ProviderError {}

/// Uniform provider interface.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one turn against the backend with the full conversation so far.
    /// Implementations honor `cancel` at every await point.
    async fn run_turn(
        &self,
        history: &[Turn],
        memory_session_id: Option<&str>,
        cancel: &CancelSignal,
    ) -> Result<TurnOutput, ProviderError>;

    /// True when this backend manages its own session resume state and
    /// reports a memory session id in turn output.
    fn captures_session_id(&self) -> bool {
        false
    }
}

/// Primary provider plus optional fallback. The fallback is wired after
/// construction to keep the construction graph acyclic.
pub struct ProviderChain {
    primary: Arc<dyn Provider>,
    fallback: std::sync::Mutex<Option<Arc<dyn Provider>>>,
}

impl ProviderChain {
    pub fn new(primary: Arc<dyn Provider>) -> Self {
        Self {
            primary,
            fallback: std::sync::Mutex::new(None),
        }
    }

    pub fn set_fallback(&self, fallback: Arc<dyn Provider>) {
        *self.fallback.lock().unwrap() = Some(fallback);
    }

    pub fn primary(&self) -> &Arc<dyn Provider> {
        &self.primary
    }

    /// Run a turn on the primary; on a fallback-eligible failure, retry
    /// once on the fallback with the same history.
    pub async fn run_turn(
        &self,
        history: &[Turn],
        memory_session_id: Option<&str>,
        cancel: &CancelSignal,
    ) -> Result<TurnOutput, ProviderError> {
        match self.primary.run_turn(history, memory_session_id, cancel).await {
            Ok(output) => Ok(output),
            Err(e) if e.should_fall_back() => {
                let fallback = self.fallback.lock().unwrap().clone();
                match fallback {
                    Some(fallback) => {
                        tracing::warn!(
                            "Provider {} failed ({}); falling back to {}",
                            self.primary.name(),
                            e,
                            fallback.name()
                        );
                        fallback.run_turn(history, memory_session_id, cancel).await
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }
}

/// Build the provider chain selected by settings, with the conventional
/// fallback wiring (Gemini/OpenRouter fall back to Claude).
pub fn build_chain(settings: &Settings, credentials: &Credentials) -> Arc<ProviderChain> {
    let rate_limiter = Arc::new(RateLimiter::new(settings.gemini_rate_limiting));

    let claude: Arc<dyn Provider> = Arc::new(ClaudeCliProvider::new(settings, credentials));
    let chain = match settings.provider {
        ProviderKind::Claude => ProviderChain::new(claude),
        ProviderKind::Gemini => {
            let gemini: Arc<dyn Provider> = Arc::new(GeminiProvider::new(
                settings.gemini_model.clone(),
                credentials.gemini_api_key().map(str::to_string),
                rate_limiter,
            ));
            let chain = ProviderChain::new(gemini);
            chain.set_fallback(claude);
            chain
        }
        ProviderKind::Openrouter => {
            let openrouter: Arc<dyn Provider> = Arc::new(OpenRouterProvider::new(
                settings.openrouter_model.clone(),
                credentials.openrouter_api_key().map(str::to_string),
            ));
            let chain = ProviderChain::new(openrouter);
            chain.set_fallback(claude);
            chain
        }
    };
    Arc::new(chain)
}

/// Seconds from a `Retry-After` header, when present and numeric.
pub(crate) fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Bounded payload logging: request/response bodies are logged at most
/// this long.
pub(crate) const LOG_PAYLOAD_LIMIT: usize = 600;

pub(crate) fn log_payload(label: &str, provider: &str, payload: &str) {
    tracing::debug!(
        "{} {}: {}",
        provider,
        label,
        crate::util::truncate_utf8_safe(payload, LOG_PAYLOAD_LIMIT)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;

    struct ScriptedProvider {
        name: &'static str,
        result: fn() -> Result<TurnOutput, ProviderError>,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn run_turn(
            &self,
            _history: &[Turn],
            _memory_session_id: Option<&str>,
            _cancel: &CancelSignal,
        ) -> Result<TurnOutput, ProviderError> {
            (self.result)()
        }
    }

    #[test]
    fn fallback_classification() {
        assert!(ProviderError::RateLimited { retry_after_secs: None }.should_fall_back());
        assert!(ProviderError::Server { status: 503 }.should_fall_back());
        assert!(ProviderError::Network("reset".into()).should_fall_back());
        assert!(!ProviderError::Api { status: 400, message: String::new() }.should_fall_back());
        assert!(!ProviderError::Auth("bad key".into()).should_fall_back());
        assert!(!ProviderError::Cancelled.should_fall_back());
    }

    #[test]
    fn token_split_is_70_30() {
        assert_eq!(split_estimated_tokens(1000), (700, 300));
        assert_eq!(split_estimated_tokens(0), (0, 0));
        let (i, o) = split_estimated_tokens(7);
        assert_eq!(i + o, 7);
    }

    #[tokio::test]
    async fn chain_falls_back_on_rate_limit() {
        let chain = ProviderChain::new(Arc::new(ScriptedProvider {
            name: "gemini",
            result: || Err(ProviderError::RateLimited { retry_after_secs: None }),
        }));
        chain.set_fallback(Arc::new(ScriptedProvider {
            name: "claude",
            result: || {
                Ok(TurnOutput {
                    text: "ok".into(),
                    ..Default::default()
                })
            },
        }));

        let (_handle, signal) = cancel_pair();
        let out = chain
            .run_turn(&[Turn::user("hi")], None, &signal)
            .await
            .unwrap();
        assert_eq!(out.text, "ok");
    }

    #[tokio::test]
    async fn chain_does_not_fall_back_on_4xx() {
        let chain = ProviderChain::new(Arc::new(ScriptedProvider {
            name: "gemini",
            result: || Err(ProviderError::Api { status: 400, message: "bad".into() }),
        }));
        chain.set_fallback(Arc::new(ScriptedProvider {
            name: "claude",
            result: || Ok(TurnOutput::default()),
        }));

        let (_handle, signal) = cancel_pair();
        let err = chain
            .run_turn(&[Turn::user("hi")], None, &signal)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 400, .. }));
    }
}
