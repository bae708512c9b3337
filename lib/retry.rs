use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Backoff settings for [`with_retry`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `max_retries = 3` allows four attempts in total.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy with no sleeping between attempts. Used by tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
        }
    }
}

/// Lowercased fragments that mark an error message as transient.
const TRANSIENT_PATTERNS: &[&str] = &[
    "econnreset",
    "connection reset",
    "econnrefused",
    "connection refused",
    "etimedout",
    "timed out",
    "timeout",
    "deadlock",
    "too many connections",
    "too many clients",
    "could not serialize access",
    "closed connection",
    "broken pipe",
    "throttl",
    "too many requests",
    "service unavailable",
    "bad gateway",
];

/// HTTP statuses that are worth retrying when they appear as a status code.
const TRANSIENT_STATUS_CODES: &[&str] = &["429", "502", "503"];

/// Words that introduce a status code, e.g. `status 503`, `HTTP/1.1 502`, `error code: 429`.
const STATUS_MARKERS: &[&str] = &["status", "code", "http", "returned", "response"];

/// True when a transient status code appears as a whole token shortly after a status marker.
///
/// Bare digits are not enough: row ranges, constraint values and ids contain them too.
fn mentions_transient_status(lowered: &str) -> bool {
    let tokens: Vec<&str> = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .collect();
    tokens.iter().enumerate().any(|(at, token)| {
        TRANSIENT_STATUS_CODES.contains(token)
            && tokens[at.saturating_sub(3)..at]
                .iter()
                .any(|before| STATUS_MARKERS.contains(before))
    })
}

/// Default transient classifier: matches the rendered error against known network, pool and
/// lock-contention failures.
pub fn is_transient_message(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    TRANSIENT_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
        || mentions_transient_status(&lowered)
}

/// [`is_transient_message`] applied to any displayable error.
pub fn default_is_transient<E: Display>(error: &E) -> bool {
    is_transient_message(&error.to_string())
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the policy is exhausted.
///
/// `op` receives the zero-based attempt number. Exhaustion returns the last error.
pub async fn with_retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    mut op: F,
    mut is_transient: C,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(&E) -> bool,
    E: Display,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= policy.max_retries || !is_transient(&error) {
                    return Err(error);
                }

                let delay = compute_backoff_delay(policy, attempt, rand::thread_rng().gen());
                tracing::debug!(
                    event = "retry_scheduled",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure; retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// `min(base * factor^attempt * (1 + jitter), max)` where `jitter_unit` in `[0, 1)` is scaled to
/// at most 20%.
pub fn compute_backoff_delay(policy: &RetryPolicy, attempt: u32, jitter_unit: f64) -> Duration {
    if policy.base_delay.is_zero() {
        return Duration::ZERO;
    }

    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let jitter = 1.0 + 0.2 * jitter_unit.clamp(0.0, 1.0);
    let raw_secs = policy.base_delay.as_secs_f64() * policy.backoff_factor.powi(exponent) * jitter;
    let capped = raw_secs.min(policy.max_delay.as_secs_f64());
    if !capped.is_finite() || capped <= 0.0 {
        return policy.max_delay;
    }
    Duration::from_secs_f64(capped)
}
