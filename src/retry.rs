// ABOUTME: Bounded retry policies with exponential backoff.
// ABOUTME: Drives transient-call retries and wait-until-ready polling against remote systems.

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

/// Classifies an error as worth retrying.
///
/// Network blips, rate limits, and "not yet" answers are transient. A
/// rejected request or a broken build is not, and retrying it only delays
/// the failure.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// How often and how long to retry one kind of remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    /// Attempts made by [`retry`], including the first one.
    pub max_attempts: u32,

    /// Delay before the second attempt; doubled after each further attempt.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Upper bound for a single delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Upper bound on the total time [`poll_until`] waits.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl RetryPolicy {
    pub const fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            timeout,
        }
    }

    /// Single provider API calls (create, delete, describe).
    pub const fn provider_call() -> Self {
        Self::new(
            5,
            Duration::from_secs(1),
            Duration::from_secs(16),
            Duration::from_secs(60),
        )
    }

    /// Waiting for a freshly created node to boot and accept SSH.
    pub const fn node_ready() -> Self {
        Self::new(
            60,
            Duration::from_secs(5),
            Duration::from_secs(20),
            Duration::from_secs(600),
        )
    }

    /// Waiting for a managed database to come online.
    pub const fn database_ready() -> Self {
        Self::new(
            90,
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(1200),
        )
    }

    /// Pulling the image and starting the container on a node.
    pub const fn container_start() -> Self {
        Self::new(
            4,
            Duration::from_secs(3),
            Duration::from_secs(20),
            Duration::from_secs(300),
        )
    }

    /// Container readiness probing after start.
    pub const fn readiness() -> Self {
        Self::new(
            20,
            Duration::from_secs(2),
            Duration::from_secs(10),
            Duration::from_secs(120),
        )
    }

    /// Delay to wait after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::provider_call()
    }
}

/// Policies for each kind of remote wait, as configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicies {
    pub provider_call: RetryPolicy,
    pub node_ready: RetryPolicy,
    pub database_ready: RetryPolicy,
    pub container_start: RetryPolicy,
    pub readiness: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            provider_call: RetryPolicy::provider_call(),
            node_ready: RetryPolicy::node_ready(),
            database_ready: RetryPolicy::database_ready(),
            container_start: RetryPolicy::container_start(),
            readiness: RetryPolicy::readiness(),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts. Returns the last error in the latter cases.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    what,
                    attempt = attempt + 1,
                    max_attempts,
                    ?delay,
                    "transient failure, retrying: {}",
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::warn!(what, attempts = max_attempts, "retries exhausted: {}", e);
                }
                return Err(e);
            }
        }
    }
}

/// One observation made while polling.
#[derive(Debug)]
pub enum Probe<T> {
    /// The awaited condition holds.
    Ready(T),
    /// Not there yet; the text describes what was observed.
    NotYet(String),
}

/// Why [`poll_until`] gave up.
#[derive(Debug)]
pub enum WaitError<E> {
    /// The policy's timeout elapsed. `last` is the last observation.
    TimedOut { waited: Duration, last: String },
    /// The probe failed with a non-transient error.
    Failed(E),
}

/// Poll `probe` with backoff until it reports ready, fails permanently, or
/// `policy.timeout` elapses. Transient probe errors count as "not yet".
pub async fn poll_until<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut probe: F,
) -> Result<T, WaitError<E>>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>, E>>,
{
    let start = tokio::time::Instant::now();
    let deadline = start + policy.timeout;
    let mut attempt = 0;
    let mut last = String::from("no observation yet");

    loop {
        match probe().await {
            Ok(Probe::Ready(value)) => {
                tracing::debug!(what, elapsed = ?start.elapsed(), "ready");
                return Ok(value);
            }
            Ok(Probe::NotYet(observed)) => last = observed,
            Err(e) if e.is_transient() => last = e.to_string(),
            Err(e) => return Err(WaitError::Failed(e)),
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(WaitError::TimedOut {
                waited: start.elapsed(),
                last,
            });
        }

        let delay = policy.delay_for(attempt).min(deadline - now);
        tracing::debug!(what, attempt = attempt + 1, ?delay, "waiting: {}", last);
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
