//! Health Supervisor.
//!
//! Polls the tunnel daemon's readiness endpoint on a fixed period and drives
//! the state machine `up -> degraded -> down -> restarting -> up`:
//!
//! - one failed check moves `up` to `degraded`
//! - the third consecutive failure moves to `down` and triggers a restart,
//!   after which the daemon is `restarting`
//! - while `restarting`, every failed check re-triggers the controller
//! - any success returns to `up` and clears the failure counter; leaving
//!   `restarting` also bumps the lifetime restart count
//!
//! Once the daemon has been `up` for the sustained period, the restart
//! backoff schedule is reset.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::restart::RestartController;
use crate::state::{HealthSample, SampleState, StateStore};

/// Consecutive failures that take the daemon down.
pub const DOWN_THRESHOLD: u32 = 3;

/// Supervisor view of the tunnel daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Up,
    Degraded,
    Down,
    Restarting,
}

impl TunnelState {
    /// State as written to health samples; a restarting daemon is not serving.
    pub fn sample_state(self) -> SampleState {
        match self {
            Self::Up => SampleState::Up,
            Self::Degraded => SampleState::Degraded,
            Self::Down | Self::Restarting => SampleState::Down,
        }
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Up => "up",
            Self::Degraded => "degraded",
            Self::Down => "down",
            Self::Restarting => "restarting",
        };
        f.write_str(s)
    }
}

/// Published snapshot of the supervisor state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub state: TunnelState,
    pub consecutive_failures: u32,
    pub restart_count: u64,
    pub last_check: Option<DateTime<Utc>>,
    /// Start of the current `up` period.
    pub up_since: Option<DateTime<Utc>>,
}

/// Result of feeding one check into the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOutcome {
    pub previous: TunnelState,
    /// State to record for this check.
    pub observed: TunnelState,
    pub restart_requested: bool,
}

/// Pure state machine behind the supervisor.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    state: TunnelState,
    consecutive_failures: u32,
    restart_count: u64,
    last_check: Option<DateTime<Utc>>,
    up_since: Option<(Instant, DateTime<Utc>)>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    /// Optimistic start: `up` with zero counters.
    pub fn new() -> Self {
        Self {
            state: TunnelState::Up,
            consecutive_failures: 0,
            restart_count: 0,
            last_check: None,
            up_since: None,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn restart_count(&self) -> u64 {
        self.restart_count
    }

    /// `restarted` tells whether a restart attempt actually completed since
    /// the daemon went down; recovering on its own is not a restart.
    pub fn record_success(
        &mut self,
        now: Instant,
        wall: DateTime<Utc>,
        restarted: bool,
    ) -> CheckOutcome {
        let previous = self.state;
        self.last_check = Some(wall);
        self.consecutive_failures = 0;

        if restarted && matches!(previous, TunnelState::Restarting | TunnelState::Down) {
            self.restart_count += 1;
        }
        if previous != TunnelState::Up || self.up_since.is_none() {
            self.up_since = Some((now, wall));
        }
        self.state = TunnelState::Up;

        CheckOutcome {
            previous,
            observed: TunnelState::Up,
            restart_requested: false,
        }
    }

    pub fn record_failure(&mut self, wall: DateTime<Utc>) -> CheckOutcome {
        let previous = self.state;
        self.last_check = Some(wall);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.up_since = None;

        let (observed, restart_requested) = match previous {
            TunnelState::Up | TunnelState::Degraded
                if self.consecutive_failures < DOWN_THRESHOLD =>
            {
                (TunnelState::Degraded, false)
            }
            TunnelState::Up | TunnelState::Degraded => (TunnelState::Down, true),
            TunnelState::Down | TunnelState::Restarting => (TunnelState::Restarting, true),
        };

        self.state = if restart_requested {
            TunnelState::Restarting
        } else {
            observed
        };

        CheckOutcome {
            previous,
            observed,
            restart_requested,
        }
    }

    /// How long the daemon has been continuously `up`.
    pub fn up_for(&self, now: Instant) -> Option<Duration> {
        match (self.state, self.up_since) {
            (TunnelState::Up, Some((since, _))) => Some(now.saturating_duration_since(since)),
            _ => None,
        }
    }

    pub fn status(&self) -> HealthStatus {
        HealthStatus {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            restart_count: self.restart_count,
            last_check: self.last_check,
            up_since: match self.state {
                TunnelState::Up => self.up_since.map(|(_, wall)| wall),
                _ => None,
            },
        }
    }
}

/// Liveness check against the tunnel daemon.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// `Err` carries a short reason for the log.
    async fn check(&self) -> Result<(), String>;
}

/// HTTP GET against the daemon's readiness endpoint.
pub struct HttpLivenessProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpLivenessProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl LivenessProbe for HttpLivenessProbe {
    async fn check(&self) -> Result<(), String> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("readiness endpoint returned {}", response.status()))
        }
    }
}

/// Health Supervisor.
pub struct HealthSupervisor {
    probe: Arc<dyn LivenessProbe>,
    restart: Arc<RestartController>,
    store: Arc<StateStore>,
    interval: Duration,
    sustained_up: Duration,
    tracker: tokio::sync::Mutex<HealthTracker>,
    status_tx: watch::Sender<HealthStatus>,
}

impl HealthSupervisor {
    pub fn new(
        probe: Arc<dyn LivenessProbe>,
        restart: Arc<RestartController>,
        store: Arc<StateStore>,
        interval: Duration,
        sustained_up: Duration,
    ) -> Self {
        let tracker = HealthTracker::new();
        let (status_tx, _) = watch::channel(tracker.status());
        Self {
            probe,
            restart,
            store,
            interval,
            sustained_up,
            tracker: tokio::sync::Mutex::new(tracker),
            status_tx,
        }
    }

    /// Receiver for the latest published status.
    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.status_tx.subscribe()
    }

    /// Run one liveness check and apply its outcome.
    pub async fn check_once(&self) -> CheckOutcome {
        let result = self.probe.check().await;
        self.restart.observe(result.is_ok());

        let mut tracker = self.tracker.lock().await;
        let now = Instant::now();
        let wall = Utc::now();

        let outcome = match &result {
            Ok(()) => tracker.record_success(now, wall, self.restart.take_completed()),
            Err(reason) => {
                debug!(reason = %reason, "Liveness check failed");
                tracker.record_failure(wall)
            }
        };

        if outcome.previous != tracker.state() {
            info!(
                from = %outcome.previous,
                to = %tracker.state(),
                consecutive_failures = tracker.consecutive_failures(),
                "Tunnel state changed"
            );
        }

        if outcome.restart_requested {
            if self.restart.trigger() {
                warn!(
                    consecutive_failures = tracker.consecutive_failures(),
                    delay_secs = self.restart.next_delay().as_secs(),
                    "Tunnel daemon down, restart triggered"
                );
            }
        } else if tracker
            .up_for(now)
            .is_some_and(|up| up >= self.sustained_up)
        {
            self.restart.reset_backoff();
        }

        let sample = HealthSample {
            timestamp: wall,
            state: outcome.observed.sample_state(),
            consecutive_failures: tracker.consecutive_failures(),
            restart_count: tracker.restart_count(),
        };
        if let Err(e) = self.store.append_health_sample(&sample) {
            warn!(error = %e, "Failed to record health sample");
        }

        self.status_tx.send_replace(tracker.status());
        outcome
    }

    /// Poll until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Health supervisor starting");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_once().await;
                }
                _ = shutdown.changed() => {
                    info!("Health supervisor shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fail(tracker: &mut HealthTracker) -> CheckOutcome {
        tracker.record_failure(Utc::now())
    }

    fn succeed(tracker: &mut HealthTracker) -> CheckOutcome {
        tracker.record_success(Instant::now(), Utc::now(), true)
    }

    #[test]
    fn test_initial_state_is_up() {
        let tracker = HealthTracker::new();
        let status = tracker.status();
        assert_eq!(status.state, TunnelState::Up);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.restart_count, 0);
        assert!(status.last_check.is_none());
    }

    #[test]
    fn test_two_failures_then_success_never_restarts() {
        let mut tracker = HealthTracker::new();

        assert_eq!(fail(&mut tracker).observed, TunnelState::Degraded);
        let second = fail(&mut tracker);
        assert_eq!(second.observed, TunnelState::Degraded);
        assert!(!second.restart_requested);

        let recovered = succeed(&mut tracker);
        assert_eq!(recovered.previous, TunnelState::Degraded);
        assert_eq!(tracker.state(), TunnelState::Up);
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.restart_count(), 0);
    }

    #[test]
    fn test_failures_do_not_accumulate_across_success() {
        let mut tracker = HealthTracker::new();
        fail(&mut tracker);
        fail(&mut tracker);
        succeed(&mut tracker);
        fail(&mut tracker);
        let outcome = fail(&mut tracker);

        assert!(!outcome.restart_requested);
        assert_eq!(tracker.state(), TunnelState::Degraded);
    }

    #[test]
    fn test_third_failure_goes_down_and_restarts() {
        let mut tracker = HealthTracker::new();
        fail(&mut tracker);
        fail(&mut tracker);
        let third = fail(&mut tracker);

        assert_eq!(third.observed, TunnelState::Down);
        assert!(third.restart_requested);
        assert_eq!(tracker.state(), TunnelState::Restarting);
        assert_eq!(tracker.consecutive_failures(), 3);
    }

    #[test]
    fn test_failure_while_restarting_retriggers() {
        let mut tracker = HealthTracker::new();
        for _ in 0..3 {
            fail(&mut tracker);
        }
        let fourth = fail(&mut tracker);

        assert_eq!(fourth.previous, TunnelState::Restarting);
        assert!(fourth.restart_requested);
        assert_eq!(fourth.observed.sample_state(), SampleState::Down);
    }

    #[test]
    fn test_recovery_from_restarting_counts_restart() {
        let mut tracker = HealthTracker::new();
        for _ in 0..3 {
            fail(&mut tracker);
        }
        succeed(&mut tracker);

        let status = tracker.status();
        assert_eq!(status.state, TunnelState::Up);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.restart_count, 1);
        assert!(status.up_since.is_some());
    }

    #[test]
    fn test_recovery_without_restart_is_not_counted() {
        let mut tracker = HealthTracker::new();
        for _ in 0..3 {
            fail(&mut tracker);
        }
        tracker.record_success(Instant::now(), Utc::now(), false);

        assert_eq!(tracker.state(), TunnelState::Up);
        assert_eq!(tracker.restart_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_up_for_tracks_continuous_up_period() {
        let mut tracker = HealthTracker::new();
        succeed(&mut tracker);

        tokio::time::advance(Duration::from_secs(120)).await;
        succeed(&mut tracker);
        assert_eq!(tracker.up_for(Instant::now()), Some(Duration::from_secs(120)));

        fail(&mut tracker);
        assert_eq!(tracker.up_for(Instant::now()), None);
    }
}
