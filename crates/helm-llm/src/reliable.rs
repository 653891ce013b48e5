use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::{info, warn};

use helm_core::context::LlmContext;
use helm_core::errors::ProviderError;
use helm_core::provider::{EventStream, Provider, StreamOptions};
use helm_core::stream::{RetryInfo, StreamEvent};

/// Retry and circuit breaker tuning.
#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Consecutive-failure breaker. Open trips after N failures in a row;
/// after the cooldown one probe request is let through.
#[derive(Debug)]
struct Breaker {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            opened_at: None,
        }
    }

    fn admit(&mut self, cooldown: Duration) -> Result<(), ProviderError> {
        if self.state != BreakerState::Open {
            return Ok(());
        }
        let cooled = self
            .opened_at
            .map(|t| t.elapsed() >= cooldown)
            .unwrap_or(true);
        if cooled {
            self.state = BreakerState::HalfOpen;
            Ok(())
        } else {
            Err(ProviderError::Overloaded)
        }
    }

    fn on_success(&mut self) {
        self.failures = 0;
        if self.state != BreakerState::Closed {
            info!("circuit breaker closed after successful request");
            self.state = BreakerState::Closed;
            self.opened_at = None;
        }
    }

    fn on_failure(&mut self, threshold: u32, cooldown: Duration) {
        self.failures += 1;
        if self.failures >= threshold && self.state != BreakerState::Open {
            warn!(
                failures = self.failures,
                cooldown_secs = cooldown.as_secs(),
                "circuit breaker opened"
            );
            self.state = BreakerState::Open;
            self.opened_at = Some(Instant::now());
        }
    }
}

/// Wraps a [`Provider`] with open-time retries and a circuit breaker.
///
/// Retries apply only while opening the stream: once any event has been
/// yielded the stream is committed and mid-stream failures surface in-band.
/// Retryable errors back off exponentially with jitter; `retry_after` hints
/// from rate-limit responses win over computed delays. Each retry that
/// preceded a successful open shows up as a [`StreamEvent::Retry`] at the
/// front of the returned stream.
pub struct ReliableProvider<P: Provider> {
    inner: P,
    config: ReliableConfig,
    breaker: Arc<Mutex<Breaker>>,
    total_retries: AtomicU64,
}

impl<P: Provider> ReliableProvider<P> {
    pub fn new(inner: P, config: ReliableConfig) -> Self {
        Self {
            inner,
            config,
            breaker: Arc::new(Mutex::new(Breaker::new())),
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: P) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    fn admit(&self) -> Result<(), ProviderError> {
        self.breaker
            .lock()
            .admit(self.config.circuit_breaker_cooldown)
    }

    /// Backoff for the given zero-based attempt. A server hint wins;
    /// otherwise exponential with jitter, floored at 100ms.
    fn backoff(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hinted) = hint {
            return hinted;
        }
        let base_ms = self.config.base_delay.as_millis() as f64;
        let ceiling_ms = self.config.max_delay.as_millis() as f64;
        let raw = (base_ms * 2.0_f64.powi(attempt as i32)).min(ceiling_ms);

        let spread = raw * self.config.jitter_factor;
        let jittered = raw + jitter_within(spread);
        Duration::from_millis(jittered.max(100.0) as u64)
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn circuit_state_name(&self) -> &'static str {
        match self.breaker.lock().state {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Uniform value in `[-spread, +spread]` from thread-local xorshift64 state.
fn jitter_within(spread: f64) -> f64 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static RNG: Cell<u64> = Cell::new(
            // `| 1` keeps xorshift out of the zero fixed point.
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64 | 1
        );
    }

    let raw = RNG.with(|cell| {
        let mut x = cell.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        cell.set(x);
        x
    });

    if spread <= 0.0 {
        return 0.0;
    }
    let unit = (raw % 10_000) as f64 / 10_000.0;
    (unit * 2.0 - 1.0) * spread
}

#[async_trait]
impl<P: Provider> Provider for ReliableProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn context_window(&self) -> u64 {
        self.inner.context_window()
    }

    async fn stream(
        &self,
        context: &LlmContext,
        options: &StreamOptions,
    ) -> Result<EventStream, ProviderError> {
        self.admit()?;

        let mut preamble: Vec<StreamEvent> = Vec::new();

        for attempt in 0..=self.config.max_retries {
            match self.inner.stream(context, options).await {
                Ok(stream) => {
                    self.breaker.lock().on_success();
                    return if preamble.is_empty() {
                        Ok(stream)
                    } else {
                        Ok(futures::stream::iter(preamble).chain(stream).boxed())
                    };
                }
                Err(e) if e.is_fatal() || !e.is_retryable() || attempt == self.config.max_retries => {
                    self.breaker.lock().on_failure(
                        self.config.circuit_breaker_threshold,
                        self.config.circuit_breaker_cooldown,
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.backoff(attempt, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying stream open"
                    );
                    preamble.push(StreamEvent::Retry {
                        attempt: attempt + 1,
                        delay_ms: delay.as_millis() as u64,
                        error: RetryInfo {
                            kind: e.kind().to_string(),
                            message: e.to_string(),
                        },
                    });
                    tokio::time::sleep(delay).await;
                    self.admit()?;
                }
            }
        }

        // The loop always returns from its last iteration.
        Err(ProviderError::Network("retry loop exhausted".into()))
    }
}
