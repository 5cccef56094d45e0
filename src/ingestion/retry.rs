//! Bounded retry state machine and self-imposed request pacing

use crate::config::PipelineConfig;
use crate::error::FetchError;
use crate::ingestion::connector::SourceError;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// How a failed attempt should be treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// HTTP 429
    Throttled,
    /// 5xx or a transport failure; may clear up on its own
    Transient,
    /// Other 4xx or an unreadable body; retrying will not help
    Fatal,
}

pub fn classify(err: &SourceError) -> FailureClass {
    match err {
        SourceError::Status { status: 429, .. } => FailureClass::Throttled,
        SourceError::Status { status, .. } if *status >= 500 => FailureClass::Transient,
        SourceError::Status { .. } => FailureClass::Fatal,
        SourceError::Transport { .. } => FailureClass::Transient,
        SourceError::Decode(_) => FailureClass::Fatal,
    }
}

/// Where a single page request stands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryState {
    /// Attempt number `attempt` (1-based) is about to be issued.
    Attempt { attempt: u32 },
    /// Attempt `attempt` failed and may be retried after `delay`.
    Backoff { attempt: u32, delay: Duration },
    /// Terminal: the request is abandoned.
    Failed(FetchError),
}

impl RetryState {
    /// Leave `Backoff` for the next attempt. Other states are returned unchanged.
    pub fn resume(self) -> RetryState {
        match self {
            RetryState::Backoff { attempt, .. } => RetryState::Attempt { attempt: attempt + 1 },
            other => other,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
            jitter: true,
        }
    }

    /// Policy with zero delays, for driving the state machine in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn start(&self) -> RetryState {
        RetryState::Attempt { attempt: 1 }
    }

    /// Transition after attempt `attempt` failed with `err`.
    pub fn on_error(&self, attempt: u32, err: &SourceError) -> RetryState {
        let class = classify(err);
        if class == FailureClass::Fatal {
            return RetryState::Failed(upstream(err, attempt));
        }
        if attempt >= self.max_attempts {
            let terminal = match class {
                FailureClass::Throttled => FetchError::Throttled { attempts: attempt },
                _ => upstream(err, attempt),
            };
            return RetryState::Failed(terminal);
        }
        RetryState::Backoff {
            attempt,
            delay: self.delay_for(attempt),
        }
    }

    /// Exponential delay after attempt `attempt`, capped at `max_delay`.
    ///
    /// With jitter the delay is drawn uniformly from the upper half of the
    /// exponential step so that retries never collapse to zero.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);
        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let ceiling = capped.as_millis() as u64;
        let floor = ceiling / 2;
        Duration::from_millis(rand::thread_rng().gen_range(floor..=ceiling))
    }
}

fn upstream(err: &SourceError, attempts: u32) -> FetchError {
    let status = match err {
        SourceError::Status { status, .. } => Some(*status),
        _ => None,
    };
    FetchError::Upstream {
        status,
        message: err.to_string(),
        attempts,
    }
}

/// Enforces a minimum interval between consecutive requests.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: None,
        }
    }

    /// Wait until a request may be issued, then record it as issued.
    pub async fn acquire(&mut self) {
        if let Some(last) = self.last_request {
            tokio::time::sleep_until(last + self.min_interval).await;
        }
        self.last_request = Some(Instant::now());
    }
}
