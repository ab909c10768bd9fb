//! Connection manager: retry with exponential backoff around any connect function
//!
//! Wraps a connect closure in attempt counting, exponential backoff, and the
//! circuit breaker. The transport delegates its reconnect loop here so retry
//! policy lives in exactly one place.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::events::EventHub;

/// Connection lifecycle as seen by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none being attempted
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// Connected and serving traffic
    Connected,
    /// Connection lost; retry loop running
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A retry is scheduled after a failed attempt
    Retry {
        /// 1-based attempt number that just failed
        attempt: u32,
        /// Backoff before the next attempt
        delay_ms: u64,
    },
    /// Lifecycle state changed
    StateChange {
        /// State before
        from: ConnectionState,
        /// State after
        to: ConnectionState,
    },
    /// Periodic health evaluation
    HealthCheck {
        /// Connected, zero consecutive failures, breaker closed
        healthy: bool,
    },
}

/// Backoff policy for connect retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
    /// Attempts before giving up
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Delay before retrying after the given 1-based attempt:
    /// `min(initial * 2^(attempt-1), max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self
            .initial_delay
            .saturating_mul(multiplier.min(u32::MAX as u64) as u32);
        delay.min(self.max_delay)
    }
}

impl From<&TransportConfig> for RetryPolicy {
    fn from(config: &TransportConfig) -> Self {
        Self {
            initial_delay: config.reconnect_interval(),
            max_delay: config.reconnect_interval().saturating_mul(16),
            max_attempts: config.max_reconnect_attempts,
        }
    }
}

/// Retry/backoff/breaker wrapper around a connect function
pub struct ConnectionManager {
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    state: Mutex<ConnectionState>,
    consecutive_failures: AtomicU32,
    retry_cancel: Mutex<Option<CancellationToken>>,
    events: EventHub<ConnectionEvent>,
}

impl ConnectionManager {
    /// Manager with the given policy and breaker
    pub fn new(policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Arc<Self> {
        Arc::new(Self {
            policy,
            breaker,
            state: Mutex::new(ConnectionState::Disconnected),
            consecutive_failures: AtomicU32::new(0),
            retry_cancel: Mutex::new(None),
            events: EventHub::new(),
        })
    }

    /// Subscribe to manager events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state lock poisoned")
    }

    /// Healthy = connected, no consecutive failures, breaker closed
    pub fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Connected
            && self.consecutive_failures.load(Ordering::Relaxed) == 0
            && self.breaker.state() == BreakerState::Closed
    }

    /// The breaker gating connect attempts
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run `connect` until it succeeds, backing off exponentially between
    /// attempts.
    ///
    /// Gives up after `max_attempts` failures, immediately on a
    /// non-retriable error (authentication, validation), or when
    /// [`disconnect`](Self::disconnect) cancels the in-flight retry timer.
    /// A breaker-open rejection counts as a retriable failure: the breaker
    /// will move to half-open while we wait.
    pub async fn connect_with_retry<T, F, Fut>(&self, mut connect: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let cancel = CancellationToken::new();
        {
            let mut slot = self.retry_cancel.lock().expect("retry cancel lock poisoned");
            if let Some(previous) = slot.take() {
                previous.cancel();
            }
            *slot = Some(cancel.clone());
        }

        let initial = if self.state() == ConnectionState::Disconnected {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        };
        self.set_state(initial);

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            match self.breaker.execute(|| connect()).await {
                Ok(value) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    self.set_state(ConnectionState::Connected);
                    if attempt > 1 {
                        tracing::info!("Connection established after {} attempt(s)", attempt);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let breaker_open = matches!(err, Error::BreakerOpen);
                    if !breaker_open && !err.is_retriable() {
                        tracing::error!("Connection attempt failed permanently: {}", err);
                        self.set_state(ConnectionState::Disconnected);
                        return Err(err);
                    }

                    self.consecutive_failures.fetch_add(1, Ordering::Relaxed);

                    if attempt >= self.policy.max_attempts {
                        tracing::error!(
                            "Failed to connect after {} attempts: {}",
                            attempt,
                            err
                        );
                        self.set_state(ConnectionState::Disconnected);
                        return Err(err);
                    }

                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        "Connection attempt {} failed: {}. Retrying in {:?}...",
                        attempt,
                        err,
                        delay
                    );
                    self.events.emit(ConnectionEvent::Retry {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    });

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.set_state(ConnectionState::Disconnected);
                            return Err(Error::ConnectionClosed(
                                "connect cancelled by disconnect".to_string(),
                            ));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Cancel any in-flight retry timer and mark the manager disconnected
    pub fn disconnect(&self) {
        let token = self
            .retry_cancel
            .lock()
            .expect("retry cancel lock poisoned")
            .take();
        if let Some(token) = token {
            token.cancel();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Record an unsolicited connection loss observed by the transport
    pub fn note_disconnected(&self) {
        self.set_state(ConnectionState::Disconnected);
    }

    /// Spawn a periodic health evaluation, emitting `HealthCheck` events
    pub fn start_health_checks(self: &Arc<Self>, interval: Duration) -> CancellationToken {
        let manager = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick carries no signal
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let healthy = manager.is_healthy();
                        manager.events.emit(ConnectionEvent::HealthCheck { healthy });
                    }
                }
            }
        });

        cancel
    }

    fn set_state(&self, to: ConnectionState) {
        let from = {
            let mut state = self.state.lock().expect("connection state lock poisoned");
            let from = *state;
            *state = to;
            from
        };
        if from != to {
            tracing::info!(from = %from, to = %to, "Connection state change");
            self.events.emit(ConnectionEvent::StateChange { from, to });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use std::sync::atomic::AtomicUsize;

    fn manager(max_attempts: u32) -> Arc<ConnectionManager> {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            max_attempts,
        };
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 100,
            success_threshold: 1,
            timeout_ms: 60_000,
        });
        ConnectionManager::new(policy, breaker)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_attempts: 10,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(10), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let manager = manager(5);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let result = manager
            .connect_with_retry(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::ConnectionFailed("refused".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(manager.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let manager = manager(3);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let result: Result<()> = manager
            .connect_with_retry(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::ConnectionFailed("refused".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_non_retriable_error_fails_fast() {
        let manager = manager(5);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);

        let result: Result<()> = manager
            .connect_with_retry(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::AuthenticationFailed("bad password".into())) }
            })
            .await;

        assert!(matches!(result, Err(Error::AuthenticationFailed(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_events_carry_attempt_and_delay() {
        let manager = manager(3);
        let mut rx = manager.subscribe();

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let result = manager
            .connect_with_retry(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::ConnectionFailed("refused".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;
        result.unwrap();

        let mut saw_retry = false;
        while let Ok(event) = rx.try_recv() {
            if let ConnectionEvent::Retry { attempt, delay_ms } = event {
                assert_eq!(attempt, 1);
                assert_eq!(delay_ms, 100);
                saw_retry = true;
            }
        }
        assert!(saw_retry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_retry_timer() {
        let manager = manager(10);
        let task_manager = Arc::clone(&manager);

        let handle = tokio::spawn(async move {
            task_manager
                .connect_with_retry(|| async {
                    Err::<(), _>(Error::ConnectionFailed("refused".into()))
                })
                .await
        });

        // Let the first attempt fail and the retry sleep begin.
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;

        manager.disconnect();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed(_))));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
