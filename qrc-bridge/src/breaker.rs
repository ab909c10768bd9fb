//! Circuit breaker gating calls to the Core
//!
//! Classifies the upstream dependency as closed, open, or half-open from
//! consecutive success/failure counts and rejects calls fast while open.
//! An optional error filter keeps non-qualifying errors (validation,
//! authentication) from moving the breaker in either direction.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::BreakerConfig;
use crate::error::{Error, Result};
use crate::events::EventHub;

/// Breaker classification of the dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow through normally
    Closed,
    /// Calls are rejected without being attempted
    Open,
    /// A limited number of probe calls are allowed through
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Emitted on every state transition
#[derive(Debug, Clone)]
pub struct BreakerTransition {
    /// State before the transition
    pub from: BreakerState,
    /// State after the transition
    pub to: BreakerState,
}

/// Predicate deciding whether an error counts against the breaker
pub type ErrorFilter = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Async callback probing dependency health while the breaker is open
pub type HealthProbe = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker.
///
/// Closed → (failures ≥ threshold) → Open → (timeout elapses) → HalfOpen →
/// (`success_threshold` successes) → Closed. Any qualifying failure in
/// half-open reopens immediately.
pub struct CircuitBreaker {
    config: BreakerConfig,
    error_filter: Option<ErrorFilter>,
    inner: Mutex<Inner>,
    events: EventHub<BreakerTransition>,
}

impl CircuitBreaker {
    /// Breaker with the given thresholds and no error filter
    pub fn new(config: BreakerConfig) -> Arc<Self> {
        Self::with_error_filter_opt(config, None)
    }

    /// Breaker whose failure counting is restricted to errors the filter accepts
    pub fn with_error_filter(config: BreakerConfig, filter: ErrorFilter) -> Arc<Self> {
        Self::with_error_filter_opt(config, Some(filter))
    }

    fn with_error_filter_opt(config: BreakerConfig, filter: Option<ErrorFilter>) -> Arc<Self> {
        Arc::new(Self {
            config,
            error_filter: filter,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
            events: EventHub::new(),
        })
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BreakerTransition> {
        self.events.subscribe()
    }

    /// Current state, applying the open-timeout transition lazily
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.refresh(&mut inner);
        inner.state
    }

    /// Run `op` through the breaker.
    ///
    /// Rejects with [`Error::BreakerOpen`] without invoking `op` while open.
    /// Successes and qualifying failures update the state machine;
    /// non-qualifying failures pass through untouched.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let mut inner = self.inner.lock().expect("breaker lock poisoned");
            self.refresh(&mut inner);
            if inner.state == BreakerState::Open {
                return Err(Error::BreakerOpen);
            }
        }

        let outcome = op().await;

        match &outcome {
            Ok(_) => self.record_success(),
            Err(err) => {
                if self.qualifies(err) {
                    self.record_failure();
                }
            }
        }

        outcome
    }

    /// Spawn a task polling `probe` while the breaker is open.
    ///
    /// A successful probe moves the breaker to half-open ahead of the
    /// timeout. Returns a token that stops the task.
    pub fn start_health_probe(
        self: &Arc<Self>,
        probe: HealthProbe,
        interval: Duration,
    ) -> CancellationToken {
        let breaker = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if breaker.state() != BreakerState::Open {
                    continue;
                }
                if probe().await {
                    tracing::debug!("Health probe succeeded; moving breaker to half-open");
                    breaker.force_half_open();
                }
            }
        });

        cancel
    }

    fn qualifies(&self, err: &Error) -> bool {
        match &self.error_filter {
            Some(filter) => filter(err),
            None => true,
        }
    }

    /// While open past the hold time, move to half-open
    fn refresh(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            let expired = inner
                .opened_at
                .map(|at| at.elapsed() >= self.config.timeout())
                .unwrap_or(true);
            if expired {
                self.transition(inner, BreakerState::HalfOpen);
            }
        }
    }

    fn force_half_open(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == BreakerState::Open {
            self.transition(&mut inner, BreakerState::HalfOpen);
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold.max(1) {
                    self.transition(&mut inner, BreakerState::Closed);
                }
            }
            // A call admitted before the breaker opened can settle late;
            // its success carries no signal about the current open period.
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_successes = 0;
            }
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                inner.half_open_successes = 0;
                inner.opened_at = None;
            }
        }
        tracing::info!(from = %from, to = %to, "Circuit breaker state change");
        self.events.emit(BreakerTransition { from, to });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failures: u32, successes: u32, timeout_ms: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: failures,
            success_threshold: successes,
            timeout_ms,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .execute(|| async { Err::<(), _>(Error::ConnectionFailed("refused".into())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<()> {
        breaker.execute(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(config(3, 1, 60_000));

        for _ in 0..2 {
            let _ = fail(&breaker).await;
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // Rejected fast while open
        let result = succeed(&breaker).await;
        assert!(matches!(result, Err(Error::BreakerOpen)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout_then_closes() {
        let breaker = CircuitBreaker::new(config(1, 1, 1000));

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_in_half_open_reopens() {
        let breaker = CircuitBreaker::new(config(1, 1, 1000));

        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_threshold_in_half_open() {
        let breaker = CircuitBreaker::new(config(1, 2, 1000));

        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(1001)).await;

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_error_filter_keeps_breaker_closed() {
        let filter: ErrorFilter = Arc::new(|err| err.is_retriable());
        let breaker = CircuitBreaker::with_error_filter(config(1, 1, 60_000), filter);

        // Authentication failures do not qualify and must not open the breaker.
        let result = breaker
            .execute(|| async { Err::<(), _>(Error::AuthenticationFailed("denied".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), BreakerState::Closed);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(config(2, 1, 60_000));

        let _ = fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_transition_events() {
        let breaker = CircuitBreaker::new(config(1, 1, 60_000));
        let mut rx = breaker.subscribe();

        let _ = fail(&breaker).await;

        let transition = rx.recv().await.unwrap();
        assert_eq!(transition.from, BreakerState::Closed);
        assert_eq!(transition.to, BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_probe_short_circuits_open_period() {
        let breaker = CircuitBreaker::new(config(1, 1, 600_000));
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        let probe: HealthProbe = Arc::new(|| Box::pin(async { true }));
        let cancel = breaker.start_health_probe(probe, Duration::from_millis(100));

        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(150)).await;
        // Let the probe task run
        tokio::task::yield_now().await;

        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        cancel.cancel();
    }
}
