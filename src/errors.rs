//! Provider failure taxonomy and retry policy.
//!
//! Errors reach this layer as free-form strings (HTTP bodies, transport
//! messages, settle failures), so classification is substring-based. The
//! kind drives the recovery strategy in the agent loop.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Classified failure kind for an LLM call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 429 / throttling — retry with backoff.
    RateLimit,
    /// 401/403 — bad API key or permissions.
    Auth,
    /// Request or provider took too long.
    Timeout,
    /// Quota or payment exhausted.
    Billing,
    /// Provider rejected the request shape.
    Format,
    /// Anything else.
    Unknown,
}

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "429",
    "too many requests",
    "overloaded",
];

const AUTH_PATTERNS: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "forbidden",
    "invalid api key",
    "authentication_error",
    "permission_error",
];

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "deadline exceeded", "408"];

const BILLING_PATTERNS: &[&str] = &[
    "402",
    "billing",
    "quota exceeded",
    "insufficient credit",
    "payment required",
];

const FORMAT_PATTERNS: &[&str] = &[
    "invalid_request_error",
    "invalid request",
    "malformed",
    "400",
];

/// Classify a free-form provider error string.
pub fn classify_error(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches(RATE_LIMIT_PATTERNS) {
        ErrorKind::RateLimit
    } else if matches(AUTH_PATTERNS) {
        ErrorKind::Auth
    } else if matches(BILLING_PATTERNS) {
        ErrorKind::Billing
    } else if matches(TIMEOUT_PATTERNS) {
        ErrorKind::Timeout
    } else if matches(FORMAT_PATTERNS) {
        ErrorKind::Format
    } else {
        ErrorKind::Unknown
    }
}

/// Context-overflow is orthogonal to the kind taxonomy: it triggers
/// compaction, not retry.
pub fn is_context_overflow(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("request too large")
        || lower.contains("context length exceeded")
        || lower.contains("prompt is too long")
        || (lower.contains("413") && lower.contains("too large"))
}

/// Whether this kind should count against a provider when picking failover
/// candidates. Timeouts are excluded: they say more about the request than
/// the provider.
#[allow(dead_code)]
pub fn is_failover_worthy(kind: ErrorKind) -> bool {
    !matches!(kind, ErrorKind::Timeout)
}

/// Cancellation is signalled through error strings at some seams; detect it
/// so retry never re-enters a cancelled operation.
pub fn is_cancelled(message: &str) -> bool {
    message.to_lowercase().contains("cancelled")
}

/// Backoff parameters for [`retry_async`].
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Fractional jitter: each delay is scaled by `1 + U(-jitter, +jitter)`.
    pub jitter: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

/// Delay before retrying the (1-based) attempt `k` that just failed:
/// `clamp(min * 2^(k-1) * (1 ± jitter), min, max)`.
pub fn backoff_delay(opts: &RetryOptions, attempt: u32) -> Duration {
    let base = opts.min_delay.as_millis() as f64 * 2f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = if opts.jitter > 0.0 {
        rand::thread_rng().gen_range(-opts.jitter..=opts.jitter)
    } else {
        0.0
    };
    let jittered = base * (1.0 + jitter);
    let clamped = jittered
        .max(opts.min_delay.as_millis() as f64)
        .min(opts.max_delay.as_millis() as f64);
    Duration::from_millis(clamped as u64)
}

/// Run `op` up to `opts.attempts` times. `should_retry(err, attempt)` can cut
/// the loop short; the last error is re-raised when attempts are exhausted.
/// Cancellation bypasses retry entirely: the backoff sleep races the token,
/// and a cancelled token never re-enters the operation.
///
/// `on_attempt(attempt, delay, err)` fires before each backoff sleep.
pub async fn retry_async<T, F, Fut, P, O>(
    mut op: F,
    opts: &RetryOptions,
    should_retry: P,
    cancel: &CancellationToken,
    mut on_attempt: O,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    P: Fn(&anyhow::Error, u32) -> bool,
    O: FnMut(u32, Duration, &anyhow::Error),
{
    let attempts = opts.attempts.max(1);
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            anyhow::bail!("operation cancelled");
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if is_cancelled(&e.to_string()) || cancel.is_cancelled() {
                    return Err(e);
                }
                let final_attempt = attempt == attempts;
                if final_attempt || !should_retry(&e, attempt) {
                    return Err(e);
                }
                let delay = backoff_delay(opts, attempt);
                on_attempt(attempt, delay, &e);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after failure");
                last_err = Some(e);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => anyhow::bail!("operation cancelled"),
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("retry exhausted without error")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_classify_rate_limit() {
        assert_eq!(
            classify_error("429 Too Many Requests"),
            ErrorKind::RateLimit
        );
        assert_eq!(classify_error("Rate limit reached"), ErrorKind::RateLimit);
        assert_eq!(classify_error("server overloaded"), ErrorKind::RateLimit);
    }

    #[test]
    fn test_classify_auth_billing_timeout_format() {
        assert_eq!(classify_error("401 Unauthorized"), ErrorKind::Auth);
        assert_eq!(classify_error("invalid api key"), ErrorKind::Auth);
        assert_eq!(classify_error("402 payment required"), ErrorKind::Billing);
        assert_eq!(classify_error("request timed out"), ErrorKind::Timeout);
        assert_eq!(
            classify_error("invalid_request_error: bad field"),
            ErrorKind::Format
        );
        assert_eq!(classify_error("something odd"), ErrorKind::Unknown);
    }

    #[test]
    fn test_context_overflow_patterns() {
        assert!(is_context_overflow("Prompt is too long: 210000 tokens"));
        assert!(is_context_overflow("context length exceeded"));
        assert!(is_context_overflow("HTTP 413: payload too large"));
        assert!(!is_context_overflow("413 teapot"));
        assert!(!is_context_overflow("rate limit"));
    }

    #[test]
    fn test_failover_excludes_timeout() {
        assert!(!is_failover_worthy(ErrorKind::Timeout));
        assert!(is_failover_worthy(ErrorKind::RateLimit));
        assert!(is_failover_worthy(ErrorKind::Auth));
    }

    #[test]
    fn test_backoff_delay_bounds() {
        let opts = RetryOptions {
            attempts: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: 0.2,
        };
        for attempt in 1..=6 {
            let d = backoff_delay(&opts, attempt);
            assert!(d >= opts.min_delay, "attempt {attempt}: {d:?} under min");
            assert!(d <= opts.max_delay, "attempt {attempt}: {d:?} over max");
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let opts = RetryOptions {
            attempts: 3,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        };
        let cancel = CancellationToken::new();
        let result: anyhow::Result<u32> = retry_async(
            move || {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        anyhow::bail!("rate limit");
                    }
                    Ok(42)
                }
            },
            &opts,
            |e, _| classify_error(&e.to_string()) == ErrorKind::RateLimit,
            &cancel,
            |_, _, _| {},
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let opts = RetryOptions {
            min_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let result: anyhow::Result<()> = retry_async(
            move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("401 Unauthorized");
                }
            },
            &opts,
            |e, _| classify_error(&e.to_string()) == ErrorKind::RateLimit,
            &cancel,
            |_, _, _| {},
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_reports_attempts() {
        let opts = RetryOptions {
            attempts: 3,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: 0.0,
        };
        let cancel = CancellationToken::new();
        let mut reported = Vec::new();
        let result: anyhow::Result<()> = retry_async(
            || async { anyhow::bail!("rate limit") },
            &opts,
            |_, _| true,
            &cancel,
            |attempt, delay, _| reported.push((attempt, delay)),
        )
        .await;
        assert!(result.is_err());
        // Final attempt re-raises without a backoff callback.
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0].0, 1);
        assert_eq!(reported[1].0, 2);
    }

    #[tokio::test]
    async fn test_retry_cancelled_token_bypasses() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let result: anyhow::Result<()> = retry_async(
            move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            &RetryOptions::default(),
            |_, _| true,
            &cancel,
            |_, _, _| {},
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
