//! Health Supervisor and Restart Controller on a paused clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use edgeward_control::health::{HealthSupervisor, LivenessProbe, TunnelState};
use edgeward_control::restart::{DaemonControl, RestartController, RestartError};
use edgeward_control::state::{SampleState, StateStore};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

#[derive(Default)]
struct SwitchProbe {
    healthy: AtomicBool,
}

impl SwitchProbe {
    fn set(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl LivenessProbe for SwitchProbe {
    async fn check(&self) -> Result<(), String> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err("connection refused".to_string())
        }
    }
}

/// A daemon that is never found running, so each attempt is a bare start.
#[derive(Default)]
struct RecordingDaemon {
    starts: Mutex<Vec<Instant>>,
}

impl RecordingDaemon {
    fn starts(&self) -> Vec<Instant> {
        self.starts.lock().unwrap().clone()
    }
}

#[async_trait]
impl DaemonControl for RecordingDaemon {
    async fn stop(&self) -> Result<(), RestartError> {
        Ok(())
    }

    async fn kill(&self) -> Result<(), RestartError> {
        Ok(())
    }

    async fn start(&self) -> Result<(), RestartError> {
        self.starts.lock().unwrap().push(Instant::now());
        Ok(())
    }

    async fn is_running(&self) -> Result<bool, RestartError> {
        Ok(false)
    }
}

struct Fixture {
    probe: Arc<SwitchProbe>,
    daemon: Arc<RecordingDaemon>,
    restart: Arc<RestartController>,
    store: Arc<StateStore>,
    supervisor: Arc<HealthSupervisor>,
}

fn fixture(interval: Duration) -> Fixture {
    let probe = Arc::new(SwitchProbe::default());
    let daemon = Arc::new(RecordingDaemon::default());
    let restart = Arc::new(RestartController::new(
        daemon.clone(),
        Duration::from_secs(10),
        Duration::from_secs(10),
    ));
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    let supervisor = Arc::new(HealthSupervisor::new(
        probe.clone(),
        restart.clone(),
        store.clone(),
        interval,
        Duration::from_secs(300),
    ));

    Fixture {
        probe,
        daemon,
        restart,
        store,
        supervisor,
    }
}

fn between(actual: Duration, low_secs: u64, high_secs: u64) -> bool {
    actual >= Duration::from_secs(low_secs) && actual <= Duration::from_secs(high_secs)
}

#[tokio::test(start_paused = true)]
async fn three_failures_restart_and_recovery_resets_counters() {
    let f = fixture(Duration::from_secs(30));
    let status = f.supervisor.subscribe();
    let t0 = Instant::now();

    // t=0 and t=30
    assert!(!f.supervisor.check_once().await.restart_requested);
    sleep(Duration::from_secs(30)).await;
    assert!(!f.supervisor.check_once().await.restart_requested);
    assert_eq!(status.borrow().state, TunnelState::Degraded);
    assert_eq!(status.borrow().consecutive_failures, 2);

    // t=60: third failure
    sleep(Duration::from_secs(30)).await;
    let outcome = f.supervisor.check_once().await;
    assert!(outcome.restart_requested);
    assert_eq!(outcome.observed, TunnelState::Down);
    assert_eq!(status.borrow().state, TunnelState::Restarting);
    assert!(f.restart.in_flight());

    // t=95: the daemon answers again
    sleep(Duration::from_secs(35)).await;
    let starts = f.daemon.starts();
    assert_eq!(starts.len(), 1);
    assert!(between(starts[0] - t0, 65, 66));

    f.probe.set(true);
    f.supervisor.check_once().await;

    let current = status.borrow().clone();
    assert_eq!(current.state, TunnelState::Up);
    assert_eq!(current.consecutive_failures, 0);
    assert_eq!(current.restart_count, 1);

    let samples = f.store.recent_health_samples(10).unwrap();
    assert_eq!(samples.len(), 4);
    assert_eq!(samples[0].state, SampleState::Up);
    assert_eq!(samples[1].state, SampleState::Down);
    assert_eq!(samples[1].consecutive_failures, 3);
    assert_eq!(samples[2].state, SampleState::Degraded);
}

#[tokio::test(start_paused = true)]
async fn two_failures_then_success_never_restarts() {
    let f = fixture(Duration::from_secs(30));

    f.supervisor.check_once().await;
    f.supervisor.check_once().await;
    f.probe.set(true);
    f.supervisor.check_once().await;
    f.probe.set(false);
    f.supervisor.check_once().await;
    f.supervisor.check_once().await;

    sleep(Duration::from_secs(600)).await;
    assert_eq!(f.restart.attempt_count(), 0);
    assert!(f.daemon.starts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn restarts_without_recovery_follow_the_backoff_schedule() {
    let f = fixture(Duration::from_secs(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(f.supervisor.clone().run(shutdown_rx));

    sleep(Duration::from_secs(5 + 15 + 30 + 60 + 300 + 300 + 30)).await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    let starts = f.daemon.starts();
    assert!(starts.len() >= 6, "only {} restarts", starts.len());

    // Each gap is the next delay plus at most one check interval
    let expected = [15, 30, 60, 300, 300];
    for (i, delay) in expected.iter().enumerate() {
        let gap = starts[i + 1] - starts[i];
        assert!(
            between(gap, *delay, delay + 1),
            "gap {i} was {gap:?}, expected about {delay}s"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn sustained_up_period_resets_backoff() {
    let f = fixture(Duration::from_secs(30));

    for _ in 0..3 {
        f.supervisor.check_once().await;
    }
    sleep(Duration::from_secs(10)).await;
    assert_eq!(f.restart.backoff_index(), 1);

    f.probe.set(true);
    f.supervisor.check_once().await;
    sleep(Duration::from_secs(150)).await;
    f.supervisor.check_once().await;
    assert_eq!(f.restart.backoff_index(), 1);

    sleep(Duration::from_secs(150)).await;
    f.supervisor.check_once().await;
    assert_eq!(f.restart.backoff_index(), 0);
    assert_eq!(f.restart.next_delay(), Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn recovery_during_backoff_cancels_the_pending_restart() {
    let f = fixture(Duration::from_secs(30));
    let status = f.supervisor.subscribe();

    for _ in 0..3 {
        f.supervisor.check_once().await;
    }
    assert!(f.restart.in_flight());

    // The daemon answers before the 5s backoff runs out
    sleep(Duration::from_secs(2)).await;
    f.probe.set(true);
    f.supervisor.check_once().await;
    assert_eq!(status.borrow().state, TunnelState::Up);
    assert_eq!(status.borrow().restart_count, 0);

    sleep(Duration::from_secs(10)).await;
    assert!(f.daemon.starts().is_empty());
    assert!(!f.restart.in_flight());
    assert_eq!(f.restart.backoff_index(), 0);

    // A later outage still restarts and is counted once recovered
    f.probe.set(false);
    for _ in 0..3 {
        f.supervisor.check_once().await;
    }
    sleep(Duration::from_secs(10)).await;
    assert_eq!(f.daemon.starts().len(), 1);

    f.probe.set(true);
    f.supervisor.check_once().await;
    assert_eq!(status.borrow().restart_count, 1);
}
