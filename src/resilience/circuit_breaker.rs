//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: backend assumed down, requests fail fast
//! - Half-Open: one trial request is testing whether the backend recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= max_failures
//! Open → Half-Open: on the first call after open_timeout has elapsed since the last failure
//! Half-Open → Closed: trial succeeds
//! Half-Open → Open: trial fails (last failure time refreshed)
//! any → Closed: manual reset
//! ```
//!
//! # Design Decisions
//! - Per-backend circuit breaker (not global), kept in a [`CircuitBreakerRegistry`]
//! - Fail fast in Open state: the wrapped operation is never invoked
//! - Open → Half-Open is evaluated lazily on the next call, there is no timer task
//! - Single trial in Half-Open; concurrent callers fail fast until it completes
//! - Every reset and every trial admission starts a new generation; outcomes from
//!   permits of an older generation never move the Half-Open state or its slot
//! - The lock is never held across the wrapped operation

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::config::CircuitBreakerConfig;
use crate::observability::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the operation was not invoked.
    #[error("circuit breaker is open")]
    Open,
    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    generation: u64,
}

/// Failure-isolation state machine for one backend.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    max_failures: u32,
    open_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, max_failures: u32, open_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            max_failures: max_failures.max(1),
            open_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trial_in_flight: false,
                generation: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn last_failure_time(&self) -> Option<Instant> {
        self.lock().last_failure
    }

    /// Run `op` under the breaker.
    ///
    /// Returns [`BreakerError::Open`] without invoking `op` while the circuit is
    /// open and the open timeout has not elapsed (or while another trial is in
    /// flight). Any `Err` from `op` counts as a failure; callers decide what an
    /// error is by what they return.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = match self.acquire() {
            Some(permit) => permit,
            None => {
                metrics::record_circuit_rejected(&self.name);
                return Err(BreakerError::Open);
            }
        };

        match op().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(e) => {
                permit.fail();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Force the circuit closed and clear failure state.
    pub fn reset(&self) {
        let mut s = self.lock();
        let previous = s.state;
        s.state = CircuitState::Closed;
        s.consecutive_failures = 0;
        s.last_failure = None;
        s.trial_in_flight = false;
        s.generation = s.generation.wrapping_add(1);
        drop(s);

        if previous != CircuitState::Closed {
            tracing::info!(service = %self.name, from = %previous, "Circuit breaker reset");
        }
        metrics::record_circuit_state(&self.name, CircuitState::Closed);
    }

    /// Record a failure observed after the call itself completed
    /// (e.g. the response body failed while streaming).
    pub fn record_failure(&self) {
        self.on_failure(None);
    }

    fn acquire(&self) -> Option<CallPermit<'_>> {
        let mut s = self.lock();
        match s.state {
            CircuitState::Closed => Some(CallPermit::new(self, s.generation, false)),
            CircuitState::HalfOpen => {
                if s.trial_in_flight {
                    return None;
                }
                s.trial_in_flight = true;
                s.generation = s.generation.wrapping_add(1);
                Some(CallPermit::new(self, s.generation, true))
            }
            CircuitState::Open => {
                let elapsed = s
                    .last_failure
                    .map(|at| at.elapsed() >= self.open_timeout)
                    .unwrap_or(true);
                if !elapsed {
                    return None;
                }
                s.state = CircuitState::HalfOpen;
                s.consecutive_failures = 0;
                s.trial_in_flight = true;
                s.generation = s.generation.wrapping_add(1);
                let generation = s.generation;
                drop(s);

                tracing::info!(service = %self.name, "Circuit breaker half-open, admitting trial request");
                metrics::record_circuit_state(&self.name, CircuitState::HalfOpen);
                Some(CallPermit::new(self, generation, true))
            }
        }
    }

    fn on_success(&self, generation: u64) {
        let mut s = self.lock();
        if generation != s.generation {
            return;
        }
        s.consecutive_failures = 0;
        if s.state == CircuitState::HalfOpen {
            s.state = CircuitState::Closed;
            s.trial_in_flight = false;
            drop(s);

            tracing::info!(service = %self.name, "Circuit breaker closed after successful trial");
            metrics::record_circuit_state(&self.name, CircuitState::Closed);
        }
    }

    /// `permit` is the `(generation, trial)` of the failing call, `None` for a
    /// failure reported after the call completed. Only the current trial may
    /// decide a Half-Open circuit.
    fn on_failure(&self, permit: Option<(u64, bool)>) {
        let mut s = self.lock();
        let current_trial = matches!(permit, Some((g, true)) if g == s.generation);
        if s.state == CircuitState::HalfOpen && !current_trial {
            return;
        }
        s.consecutive_failures = s.consecutive_failures.saturating_add(1);
        s.last_failure = Some(Instant::now());

        let opened = match s.state {
            CircuitState::HalfOpen => {
                s.state = CircuitState::Open;
                s.trial_in_flight = false;
                true
            }
            CircuitState::Closed if s.consecutive_failures >= self.max_failures => {
                s.state = CircuitState::Open;
                true
            }
            _ => false,
        };
        let failures = s.consecutive_failures;
        drop(s);

        if opened {
            tracing::warn!(
                service = %self.name,
                consecutive_failures = failures,
                open_timeout_secs = self.open_timeout.as_secs_f64(),
                "Circuit breaker opened"
            );
            metrics::record_circuit_state(&self.name, CircuitState::Open);
        }
    }

    /// A trial that never completed (its future was dropped) gives the slot back
    /// without counting as a failure.
    fn on_abandoned_trial(&self, generation: u64) {
        let mut s = self.lock();
        if s.state == CircuitState::HalfOpen && s.trial_in_flight && s.generation == generation {
            s.state = CircuitState::Open;
            s.trial_in_flight = false;
            drop(s);

            tracing::debug!(service = %self.name, "Trial request abandoned, circuit back to open");
            metrics::record_circuit_state(&self.name, CircuitState::Open);
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Admission for one call; reports the outcome exactly once.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, generation: u64, trial: bool) -> Self {
        Self {
            breaker,
            generation,
            trial,
            settled: false,
        }
    }

    fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.generation);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(Some((self.generation, self.trial)));
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.on_abandoned_trial(self.generation);
        }
    }
}

/// One circuit breaker per backend, created on first use.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    max_failures: u32,
    open_timeout: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(max_failures: u32, open_timeout: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            max_failures,
            open_timeout,
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.max_failures, config.open_timeout())
    }

    /// Get or create the breaker for `service`.
    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(service) {
            return existing.clone();
        }
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    service,
                    self.max_failures,
                    self.open_timeout,
                ))
            })
            .clone()
    }

    pub fn state(&self, service: &str) -> CircuitState {
        self.get(service).state()
    }

    pub fn reset(&self, service: &str) {
        self.get(service).reset();
    }

    /// States of every breaker created so far, ordered by service name.
    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn fail(cb: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        cb.call(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        cb.call(|| async { Ok::<(), &'static str>(()) }).await
    }

    #[tokio::test]
    async fn test_opens_after_max_failures() {
        let cb = CircuitBreaker::new("agent", 3, Duration::from_secs(30));

        for i in 0..2 {
            assert!(matches!(fail(&cb).await, Err(BreakerError::Inner("boom"))));
            assert_eq!(cb.state(), CircuitState::Closed, "still closed after {} failures", i + 1);
        }
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.consecutive_failures(), 3);
    }

    #[tokio::test]
    async fn test_success_fully_resets_failure_count() {
        let cb = CircuitBreaker::new("agent", 3, Duration::from_secs(30));
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.consecutive_failures(), 0);

        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_circuit_does_not_invoke_operation() {
        let cb = CircuitBreaker::new("agent", 1, Duration::from_secs(30));
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        let invocations = AtomicU32::new(0);
        for _ in 0..5 {
            let result = cb
                .call(|| async {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), &'static str>(())
                })
                .await;
            assert!(matches!(result, Err(BreakerError::Open)));
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_trial_runs_once_after_timeout_and_closes() {
        let cb = CircuitBreaker::new("agent", 2, Duration::from_millis(50));
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let invocations = AtomicU32::new(0);
        cb.call(|| async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok::<(), &'static str>(())
        })
        .await
        .unwrap();

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_failed_trial_reopens_with_new_timestamp() {
        let cb = CircuitBreaker::new("agent", 1, Duration::from_millis(50));
        fail(&cb).await.unwrap_err();
        let first_failure = cb.last_failure_time().unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        let invocations = AtomicU32::new(0);
        let result = cb
            .call(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("still down")
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Inner("still down"))));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.last_failure_time().unwrap() > first_failure);

        // The refreshed timestamp restarts the cooldown.
        assert!(matches!(succeed(&cb).await, Err(BreakerError::Open)));
    }

    #[tokio::test]
    async fn test_single_trial_in_half_open() {
        let cb = Arc::new(CircuitBreaker::new("agent", 1, Duration::from_millis(20)));
        fail(&cb).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_cb = cb.clone();
        let trial = tokio::spawn(async move {
            trial_cb
                .call(|| async move {
                    let _ = release_rx.await;
                    Ok::<(), &'static str>(())
                })
                .await
        });

        // Let the trial get admitted.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(matches!(succeed(&cb).await, Err(BreakerError::Open)));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_abandoned_trial_releases_slot() {
        let cb = Arc::new(CircuitBreaker::new("agent", 1, Duration::from_millis(20)));
        fail(&cb).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let trial_cb = cb.clone();
        let trial = tokio::spawn(async move {
            trial_cb
                .call(|| std::future::pending::<Result<(), &'static str>>())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        trial.abort();
        let _ = trial.await;

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.consecutive_failures(), 0);
        // Timeout already elapsed, so the next call becomes the new trial.
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    /// Open the circuit, wait out the cooldown and park a trial until `release` fires.
    async fn admit_parked_trial(
        cb: &Arc<CircuitBreaker>,
        release: tokio::sync::oneshot::Receiver<()>,
    ) -> tokio::task::JoinHandle<Result<(), BreakerError<&'static str>>> {
        fail(cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let trial_cb = cb.clone();
        let trial = tokio::spawn(async move {
            trial_cb
                .call(|| async move {
                    let _ = release.await;
                    Ok::<(), &'static str>(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        trial
    }

    #[tokio::test]
    async fn test_trial_from_before_reset_cannot_free_current_slot() {
        let cb = Arc::new(CircuitBreaker::new("agent", 1, Duration::from_millis(20)));

        let (_keep_old, old_rx) = tokio::sync::oneshot::channel::<()>();
        let old_trial = admit_parked_trial(&cb, old_rx).await;
        cb.reset();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = admit_parked_trial(&cb, release_rx).await;

        old_trial.abort();
        let _ = old_trial.await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let invocations = AtomicU32::new(0);
        let result = cb
            .call(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &'static str>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open)));
        assert_eq!(invocations.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_outcome_from_before_reset_does_not_decide_trial() {
        let cb = Arc::new(CircuitBreaker::new("agent", 1, Duration::from_millis(20)));

        let (old_tx, old_rx) = tokio::sync::oneshot::channel::<()>();
        let old_trial = admit_parked_trial(&cb, old_rx).await;
        cb.reset();
        let (_keep, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = admit_parked_trial(&cb, release_rx).await;

        old_tx.send(()).unwrap();
        old_trial.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen, "stale success must not close");

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::HalfOpen, "late failure must not reopen");
        assert!(matches!(succeed(&cb).await, Err(BreakerError::Open)));

        trial.abort();
        let _ = trial.await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_manual_reset_closes() {
        let cb = CircuitBreaker::new("agent", 1, Duration::from_secs(300));
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
        assert!(cb.last_failure_time().is_none());
        succeed(&cb).await.unwrap();
    }

    #[tokio::test]
    async fn test_late_failure_counts() {
        let cb = CircuitBreaker::new("agent", 2, Duration::from_secs(30));
        succeed(&cb).await.unwrap();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_registry_isolates_services() {
        let registry = CircuitBreakerRegistry::new(2, Duration::from_secs(1));

        let agent = registry.get("agent");
        fail(&agent).await.unwrap_err();
        fail(&agent).await.unwrap_err();

        assert_eq!(registry.state("agent"), CircuitState::Open);
        assert_eq!(registry.state("rag"), CircuitState::Closed);
        assert!(Arc::ptr_eq(&agent, &registry.get("agent")));

        let states = registry.states();
        assert_eq!(states.len(), 2);
        assert_eq!(states["agent"], CircuitState::Open);

        registry.reset("agent");
        assert_eq!(registry.state("agent"), CircuitState::Closed);
    }

    #[test]
    fn test_state_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&CircuitState::HalfOpen).unwrap(),
            "\"half-open\""
        );
        assert_eq!(CircuitState::Open.to_string(), "open");
    }
}
