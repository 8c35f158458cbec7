//! Per-model request-rate gate for the Gemini free tier
//!
//! One `last_request_time` per process: Gemini rate limits are keyed to the
//! API key, not to sessions, so every agent shares the gate. A 100ms safety
//! margin absorbs clock skew between us and the quota window. Disabled
//! entirely on paid tiers via settings.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Safety margin added to the minimum request spacing.
const SAFETY_MARGIN: Duration = Duration::from_millis(100);

/// Requests-per-minute budget for a Gemini model.
pub fn model_rpm(model: &str) -> u32 {
    match model {
        "gemini-2.5-flash-lite" => 10,
        "gemini-2.5-flash" => 10,
        "gemini-2.5-pro" => 5,
        "gemini-2.0-flash" => 15,
        "gemini-2.0-flash-lite" => 30,
        "gemini-3-flash" => 10,
        "gemini-3-flash-preview" => 5,
        _ => 10,
    }
}

/// Process-global spacing gate.
pub struct RateLimiter {
    enabled: bool,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            last_request: Mutex::new(None),
        }
    }

    /// Sleep until the next request for `model` is allowed, then record it.
    /// No-op when rate limiting is disabled.
    pub async fn wait_turn(&self, model: &str) {
        if !self.enabled {
            return;
        }
        loop {
            let wait = self.try_claim(model);
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    /// Claim a request slot, or return how long to wait before retrying.
    fn try_claim(&self, model: &str) -> Option<Duration> {
        let min_gap = min_gap(model);
        let mut last = self.last_request.lock().unwrap();
        match *last {
            Some(at) => {
                let elapsed = at.elapsed();
                if elapsed >= min_gap {
                    *last = Some(Instant::now());
                    None
                } else {
                    Some(min_gap - elapsed)
                }
            }
            None => {
                *last = Some(Instant::now());
                None
            }
        }
    }
}

/// Minimum spacing between requests for a model, margin included.
fn min_gap(model: &str) -> Duration {
    Duration::from_secs_f64(60.0 / model_rpm(model) as f64) + SAFETY_MARGIN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpm_table() {
        assert_eq!(model_rpm("gemini-2.5-pro"), 5);
        assert_eq!(model_rpm("gemini-2.0-flash-lite"), 30);
        assert_eq!(model_rpm("something-new"), 10);
    }

    #[tokio::test]
    async fn disabled_limiter_never_waits() {
        let limiter = RateLimiter::new(false);
        let start = Instant::now();
        limiter.wait_turn("gemini-2.5-pro").await;
        limiter.wait_turn("gemini-2.5-pro").await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn second_claim_inside_gap_reports_wait() {
        let limiter = RateLimiter::new(true);
        assert!(limiter.try_claim("gemini-2.0-flash-lite").is_none(), "first slot is free");

        let wait = limiter
            .try_claim("gemini-2.0-flash-lite")
            .expect("second claim must wait");
        // 30 rpm -> 2s spacing plus the 100ms margin.
        assert!(wait <= Duration::from_millis(2100));
        assert!(wait > Duration::from_millis(1500));
    }

    #[test]
    fn gap_includes_margin() {
        assert_eq!(min_gap("gemini-2.5-pro"), Duration::from_secs(12) + SAFETY_MARGIN);
    }
}
