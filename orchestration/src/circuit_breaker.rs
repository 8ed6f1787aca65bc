//! Per-dependency circuit breakers.
//!
//! Each external dependency (tracker, code host, language model) gets its
//! own breaker, shared by every ticket:
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open
//!     ▲                                │ reset timeout elapsed,
//!     │ trial succeeds                 │ next call becomes the trial
//!     │                                ▼
//!     └──────────────────────────── HalfOpen
//!                trial fails: back to Open, clock restarts
//! ```
//!
//! While open, calls fail fast with [`StageError::CircuitOpen`] instead of
//! reaching the dependency. In half-open exactly one trial call is in
//! flight; concurrent callers are rejected as if the breaker were open.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::StageError;
use crate::events::{AlertSeverity, PipelineEvent, SharedEventBroadcaster};

/// External dependency guarded by a breaker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    Tracker,
    CodeHost,
    LanguageModel,
}

impl Dependency {
    pub fn all() -> &'static [Dependency] {
        &[Self::Tracker, Self::CodeHost, Self::LanguageModel]
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tracker => write!(f, "tracker"),
            Self::CodeHost => write!(f, "code_host"),
            Self::LanguageModel => write!(f, "language_model"),
        }
    }
}

/// Breaker state for a single dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy; calls pass through.
    Closed,
    /// Tripped; calls fail fast until the reset timeout expires.
    Open,
    /// Reset timeout expired; one trial call allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Milliseconds after opening before a trial call is allowed.
    pub reset_timeout_ms: u64,
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

/// Point-in-time view of a breaker, for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerState {
    pub dependency: Dependency,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_transition_at: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    last_transition_at: DateTime<Utc>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerInner {
    fn transition(&mut self, to: CircuitState) -> Option<(CircuitState, CircuitState)> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        self.last_transition_at = Utc::now();
        Some((from, to))
    }
}

/// Circuit breaker for one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: Dependency,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    events: Option<SharedEventBroadcaster>,
}

/// Admission to call the dependency. Settle it with
/// [`CircuitBreaker::record_success`] or [`CircuitBreaker::record_failure`];
/// dropping an unsettled trial permit frees the half-open slot.
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this permit is the half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(dependency: Dependency, config: BreakerConfig) -> Self {
        Self {
            dependency,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                last_transition_at: Utc::now(),
                opened_at: None,
                trial_in_flight: false,
            }),
            events: None,
        }
    }

    /// Publish `agent_status` events on every state change.
    pub fn with_events(mut self, events: SharedEventBroadcaster) -> Self {
        self.events = Some(events);
        self
    }

    pub fn dependency(&self) -> Dependency {
        self.dependency
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stored state. An open breaker whose timeout has elapsed reports
    /// `Open` until the next call turns it half-open.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Whether a half-open trial call is still running.
    pub fn trial_in_flight(&self) -> bool {
        let inner = self.lock();
        inner.state == CircuitState::HalfOpen && inner.trial_in_flight
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.lock();
        CircuitBreakerState {
            dependency: self.dependency,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            last_transition_at: inner.last_transition_at,
        }
    }

    fn open_remaining(&self, inner: &BreakerInner) -> Duration {
        let timeout = self.config.reset_timeout();
        inner
            .opened_at
            .map(|at| timeout.saturating_sub(at.elapsed()))
            .unwrap_or(timeout)
    }

    fn rejection(&self, retry_after: Duration) -> StageError {
        StageError::CircuitOpen {
            dependency: self.dependency,
            retry_after,
        }
    }

    /// Ask to call the dependency.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, StageError> {
        let (permit, change) = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::Closed => (Ok(false), None),
                CircuitState::Open => {
                    let remaining = self.open_remaining(&inner);
                    if remaining.is_zero() {
                        inner.trial_in_flight = true;
                        (Ok(true), inner.transition(CircuitState::HalfOpen))
                    } else {
                        (Err(self.rejection(remaining)), None)
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.trial_in_flight {
                        (Err(self.rejection(self.config.reset_timeout())), None)
                    } else {
                        inner.trial_in_flight = true;
                        (Ok(true), None)
                    }
                }
            }
        };

        if let Some((from, to)) = change {
            self.announce(from, to);
        }

        permit.map(|trial| CallPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// Record a successful call. Resets the failure count; a successful
    /// trial closes the circuit.
    pub fn record_success(&self, mut permit: CallPermit<'_>) {
        permit.settled = true;
        let change = {
            let mut inner = self.lock();
            match inner.state {
                CircuitState::HalfOpen if permit.trial => {
                    inner.trial_in_flight = false;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    inner.transition(CircuitState::Closed)
                }
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                // A slow call admitted before the circuit opened.
                _ => None,
            }
        };
        if let Some((from, to)) = change {
            self.announce(from, to);
        }
    }

    /// Record a failed call. May open the circuit; a failed trial reopens it
    /// and restarts the reset clock.
    pub fn record_failure(&self, mut permit: CallPermit<'_>) {
        permit.settled = true;
        let change = {
            let mut inner = self.lock();
            inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            inner.last_failure_at = Some(Utc::now());
            match inner.state {
                CircuitState::HalfOpen if permit.trial => {
                    inner.trial_in_flight = false;
                    inner.opened_at = Some(Instant::now());
                    inner.transition(CircuitState::Open)
                }
                CircuitState::Closed
                    if inner.consecutive_failures >= self.config.failure_threshold =>
                {
                    inner.opened_at = Some(Instant::now());
                    inner.transition(CircuitState::Open)
                }
                _ => None,
            }
        };
        if let Some((from, to)) = change {
            self.announce(from, to);
        }
    }

    /// Run `f` under the breaker.
    ///
    /// Rejected calls return `CircuitOpen` without invoking `f`. Only
    /// dependency failures count against the breaker; other errors (and
    /// successes) settle the permit as a success.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, StageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let permit = self.try_acquire()?;
        let result = f().await;
        match &result {
            Err(e) if e.is_dependency_failure() => self.record_failure(permit),
            _ => self.record_success(permit),
        }
        result
    }

    fn announce(&self, from: CircuitState, to: CircuitState) {
        if to == CircuitState::Open {
            warn!(dependency = %self.dependency, from = %from, to = %to, "Circuit breaker opened");
        } else {
            debug!(dependency = %self.dependency, from = %from, to = %to, "Circuit breaker transition");
        }

        let Some(events) = &self.events else {
            return;
        };
        events.publish(PipelineEvent::agent_status(
            self.dependency.to_string(),
            to.to_string(),
            Some(format!("{from} → {to}")),
        ));
        if to == CircuitState::Open {
            events.publish(PipelineEvent::system_alert(
                AlertSeverity::Warning,
                None,
                format!(
                    "Dependency {} isolated after {} consecutive failures",
                    self.dependency,
                    self.failure_count()
                ),
            ));
        }
    }
}

/// One breaker per dependency, constructed up front.
#[derive(Debug)]
pub struct CircuitBreakers {
    breakers: HashMap<Dependency, CircuitBreaker>,
    config: BreakerConfig,
}

/// Shared reference to the breaker set
pub type SharedBreakers = Arc<CircuitBreakers>;

impl CircuitBreakers {
    pub fn new(config: BreakerConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_events(config: BreakerConfig, events: SharedEventBroadcaster) -> Self {
        Self::build(config, Some(events))
    }

    fn build(config: BreakerConfig, events: Option<SharedEventBroadcaster>) -> Self {
        let breakers = Dependency::all()
            .iter()
            .map(|&dep| {
                let breaker = CircuitBreaker::new(dep, config.clone());
                let breaker = match &events {
                    Some(bus) => breaker.with_events(bus.clone()),
                    None => breaker,
                };
                (dep, breaker)
            })
            .collect();
        Self { breakers, config }
    }

    pub fn shared(self) -> SharedBreakers {
        Arc::new(self)
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Breaker for `dependency`. Every dependency has one.
    pub fn get(&self, dependency: Dependency) -> Option<&CircuitBreaker> {
        self.breakers.get(&dependency)
    }

    /// Snapshots ordered by dependency.
    pub fn snapshots(&self) -> Vec<CircuitBreakerState> {
        let mut states: Vec<_> = self.breakers.values().map(|b| b.snapshot()).collect();
        states.sort_by_key(|s| s.dependency);
        states
    }
}
