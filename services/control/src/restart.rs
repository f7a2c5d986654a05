//! Restart Controller.
//!
//! Restarts the tunnel daemon on demand from the Health Supervisor. Attempts
//! are spaced by a fixed backoff schedule (5s, 15s, 30s, 60s, then 300s
//! forever) and never give up. At most one attempt runs at a time; triggers
//! arriving while one is in flight are dropped.
//!
//! An attempt is: wait the backoff delay, send a graceful stop, wait up to
//! the grace window for the daemon to exit, force-kill it if it did not,
//! then start a new instance. If the last liveness check before the signals
//! saw the daemon up, the attempt is cancelled instead.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::docker::{DockerClient, DockerError};

/// Backoff schedule in seconds; the last entry repeats.
pub const BACKOFF_SCHEDULE_SECS: [u64; 5] = [5, 15, 30, 60, 300];

const GRACE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Delay before the attempt at `index` in the schedule.
pub fn backoff_delay(index: usize) -> Duration {
    let last = BACKOFF_SCHEDULE_SECS.len() - 1;
    Duration::from_secs(BACKOFF_SCHEDULE_SECS[index.min(last)])
}

/// Errors from signalling the tunnel daemon.
#[derive(Debug, Error)]
pub enum RestartError {
    #[error("container runtime error: {0}")]
    Docker(#[from] DockerError),

    #[error("failed to read pid file {path}: {reason}")]
    PidFile { path: PathBuf, reason: String },

    #[error("failed to signal pid {pid}: {source}")]
    Signal { pid: i32, source: std::io::Error },

    #[error("start command failed: {0}")]
    StartCommand(String),

    #[error("daemon control call '{operation}' timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

/// A restart attempt that did not bring up a new instance.
#[derive(Debug, Error)]
#[error("restart attempt {attempt} failed: {cause}")]
pub struct RestartAttemptFailed {
    pub attempt: u64,
    #[source]
    pub cause: RestartError,
}

/// How an attempt ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    Restarted,
    /// The daemon recovered while the attempt waited out its backoff.
    Cancelled,
}

/// Signals the tunnel daemon.
#[async_trait]
pub trait DaemonControl: Send + Sync {
    /// Ask the daemon to exit gracefully.
    async fn stop(&self) -> Result<(), RestartError>;

    /// Force-terminate the daemon.
    async fn kill(&self) -> Result<(), RestartError>;

    /// Start a new instance.
    async fn start(&self) -> Result<(), RestartError>;

    async fn is_running(&self) -> Result<bool, RestartError>;
}

// =============================================================================
// Container daemon
// =============================================================================

/// Daemon running as a Docker container.
pub struct ContainerDaemon {
    docker: Arc<DockerClient>,
    name: String,
}

impl ContainerDaemon {
    pub fn new(docker: Arc<DockerClient>, name: impl Into<String>) -> Self {
        Self {
            docker,
            name: name.into(),
        }
    }
}

#[async_trait]
impl DaemonControl for ContainerDaemon {
    async fn stop(&self) -> Result<(), RestartError> {
        self.docker.signal_container(&self.name, "SIGTERM").await?;
        Ok(())
    }

    async fn kill(&self) -> Result<(), RestartError> {
        self.docker.signal_container(&self.name, "SIGKILL").await?;
        Ok(())
    }

    async fn start(&self) -> Result<(), RestartError> {
        self.docker.start_container(&self.name).await?;
        Ok(())
    }

    async fn is_running(&self) -> Result<bool, RestartError> {
        Ok(self.docker.inspect_container(&self.name).await?.state.running)
    }
}

// =============================================================================
// Process daemon
// =============================================================================

/// Daemon running as a host process tracked by a pid file.
///
/// Starting is handed to the host's process supervisor through a configured
/// command (e.g. `systemctl start cloudflared`).
pub struct ProcessDaemon {
    pid_file: PathBuf,
    start_command: Vec<String>,
}

impl ProcessDaemon {
    pub fn new(pid_file: impl Into<PathBuf>, start_command: Vec<String>) -> Self {
        Self {
            pid_file: pid_file.into(),
            start_command,
        }
    }

    /// Current pid, or `None` if there is no pid file.
    fn read_pid(&self) -> Result<Option<i32>, RestartError> {
        let content = match std::fs::read_to_string(&self.pid_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RestartError::PidFile {
                    path: self.pid_file.clone(),
                    reason: e.to_string(),
                })
            }
        };

        let pid: i32 = content.trim().parse().map_err(|_| RestartError::PidFile {
            path: self.pid_file.clone(),
            reason: format!("not a pid: {:?}", content.trim()),
        })?;

        if pid <= 0 {
            return Err(RestartError::PidFile {
                path: self.pid_file.clone(),
                reason: format!("invalid pid {pid}"),
            });
        }
        Ok(Some(pid))
    }

    /// Send `signal`; a process that no longer exists counts as delivered.
    fn signal(&self, signal: libc::c_int) -> Result<(), RestartError> {
        let Some(pid) = self.read_pid()? else {
            return Ok(());
        };

        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(pid, signal) };
        if rc == 0 {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(RestartError::Signal { pid, source: err })
    }
}

#[async_trait]
impl DaemonControl for ProcessDaemon {
    async fn stop(&self) -> Result<(), RestartError> {
        self.signal(libc::SIGTERM)
    }

    async fn kill(&self) -> Result<(), RestartError> {
        self.signal(libc::SIGKILL)
    }

    async fn start(&self) -> Result<(), RestartError> {
        let Some((program, args)) = self.start_command.split_first() else {
            return Err(RestartError::StartCommand("no start command configured".to_string()));
        };

        let status = tokio::process::Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| RestartError::StartCommand(format!("{program}: {e}")))?;

        if !status.success() {
            return Err(RestartError::StartCommand(format!(
                "{} exited with {status}",
                self.start_command.join(" ")
            )));
        }
        Ok(())
    }

    async fn is_running(&self) -> Result<bool, RestartError> {
        let Some(pid) = self.read_pid()? else {
            return Ok(false);
        };

        // SAFETY: signal 0 only checks for existence and permission
        let rc = unsafe { libc::kill(pid, 0) };
        if rc == 0 {
            return Ok(true);
        }
        // EPERM means the process exists but belongs to someone else
        Ok(std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM))
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Clears the in-flight flag when an attempt ends, however it ends.
struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Restart Controller.
pub struct RestartController {
    daemon: Arc<dyn DaemonControl>,
    grace_window: Duration,
    call_timeout: Duration,
    in_flight: Arc<AtomicBool>,
    backoff_index: AtomicUsize,
    attempts: AtomicU64,
    daemon_up: AtomicBool,
    completed: AtomicBool,
}

impl RestartController {
    pub fn new(daemon: Arc<dyn DaemonControl>, grace_window: Duration, call_timeout: Duration) -> Self {
        Self {
            daemon,
            grace_window,
            call_timeout,
            in_flight: Arc::new(AtomicBool::new(false)),
            backoff_index: AtomicUsize::new(0),
            attempts: AtomicU64::new(0),
            daemon_up: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        }
    }

    /// Start a restart attempt in the background.
    ///
    /// Returns `false` if an attempt is already in flight.
    pub fn trigger(self: &Arc<Self>) -> bool {
        let Some(guard) = self.begin() else {
            debug!("Restart already in flight, ignoring trigger");
            return false;
        };

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            // Failures are logged inside; the supervisor re-triggers on the next failed check
            let _ = controller.run_attempt(attempt).await;
        });
        true
    }

    /// Run an attempt inline, or return `None` if one is already in flight.
    pub async fn restart_now(&self) -> Option<Result<RestartOutcome, RestartAttemptFailed>> {
        let _guard = self.begin()?;
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        Some(self.run_attempt(attempt).await)
    }

    /// Record the result of the latest liveness check.
    pub fn observe(&self, up: bool) {
        self.daemon_up.store(up, Ordering::SeqCst);
    }

    /// Whether an attempt restarted the daemon since the last call.
    pub fn take_completed(&self) -> bool {
        self.completed.swap(false, Ordering::SeqCst)
    }

    /// Reset the schedule after the daemon stayed up long enough.
    pub fn reset_backoff(&self) {
        let previous = self.backoff_index.swap(0, Ordering::SeqCst);
        if previous != 0 {
            info!(previous_index = previous, "Daemon stable, restart backoff reset");
        }
    }

    pub fn backoff_index(&self) -> usize {
        self.backoff_index.load(Ordering::SeqCst)
    }

    /// Delay the next attempt will wait before signalling the daemon.
    pub fn next_delay(&self) -> Duration {
        backoff_delay(self.backoff_index())
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Attempts started since the controller was created.
    pub fn attempt_count(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Option<InFlightGuard> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.completed.store(false, Ordering::SeqCst);
        Some(InFlightGuard {
            flag: Arc::clone(&self.in_flight),
        })
    }

    async fn run_attempt(&self, attempt: u64) -> Result<RestartOutcome, RestartAttemptFailed> {
        let index = self.backoff_index();
        let delay = backoff_delay(index);

        info!(attempt, delay_secs = delay.as_secs(), "Restarting tunnel daemon after backoff");
        tokio::time::sleep(delay).await;

        if self.daemon_up.load(Ordering::SeqCst) {
            info!(attempt, "Daemon recovered during backoff, restart cancelled");
            return Ok(RestartOutcome::Cancelled);
        }

        let result = self.restart_daemon().await;

        // The schedule advances whether or not the attempt worked
        let last = BACKOFF_SCHEDULE_SECS.len() - 1;
        let _ = self
            .backoff_index
            .compare_exchange(index, (index + 1).min(last), Ordering::SeqCst, Ordering::SeqCst);

        match result {
            Ok(()) => {
                self.completed.store(true, Ordering::SeqCst);
                info!(attempt, "Tunnel daemon restarted");
                Ok(RestartOutcome::Restarted)
            }
            Err(cause) => {
                warn!(attempt, error = %cause, "Restart attempt failed");
                Err(RestartAttemptFailed { attempt, cause })
            }
        }
    }

    async fn restart_daemon(&self) -> Result<(), RestartError> {
        if self.bounded("is_running", self.daemon.is_running()).await? {
            self.bounded("stop", self.daemon.stop()).await?;

            let deadline = Instant::now() + self.grace_window;
            loop {
                if !self.bounded("is_running", self.daemon.is_running()).await? {
                    debug!("Daemon exited within grace window");
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    warn!(
                        grace_secs = self.grace_window.as_secs(),
                        "Daemon still running after grace window, killing"
                    );
                    self.bounded("kill", self.daemon.kill()).await?;
                    break;
                }
                tokio::time::sleep(GRACE_POLL_INTERVAL.min(deadline - now)).await;
            }
        }

        self.bounded("start", self.daemon.start()).await
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl std::future::Future<Output = Result<T, RestartError>>,
    ) -> Result<T, RestartError> {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| RestartError::Timeout {
                operation,
                after: self.call_timeout,
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Daemon that ignores SIGTERM for a configurable time.
    #[derive(Default)]
    struct FakeDaemon {
        running: AtomicBool,
        ignore_stop: AtomicBool,
        fail_start: AtomicBool,
        log: Mutex<Vec<&'static str>>,
    }

    impl FakeDaemon {
        fn log(&self) -> Vec<&'static str> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DaemonControl for FakeDaemon {
        async fn stop(&self) -> Result<(), RestartError> {
            self.log.lock().unwrap().push("stop");
            if !self.ignore_stop.load(Ordering::SeqCst) {
                self.running.store(false, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn kill(&self) -> Result<(), RestartError> {
            self.log.lock().unwrap().push("kill");
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn start(&self) -> Result<(), RestartError> {
            self.log.lock().unwrap().push("start");
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(RestartError::StartCommand("boom".to_string()));
            }
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn is_running(&self) -> Result<bool, RestartError> {
            Ok(self.running.load(Ordering::SeqCst))
        }
    }

    fn controller(daemon: Arc<FakeDaemon>) -> RestartController {
        RestartController::new(daemon, Duration::from_secs(10), Duration::from_secs(10))
    }

    #[test]
    fn test_backoff_schedule_holds_at_last() {
        let delays: Vec<u64> = (0..7).map(|i| backoff_delay(i).as_secs()).collect();
        assert_eq!(delays, [5, 15, 30, 60, 300, 300, 300]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_stop_then_start() {
        let daemon = Arc::new(FakeDaemon::default());
        daemon.running.store(true, Ordering::SeqCst);
        let controller = controller(daemon.clone());

        let started = Instant::now();
        controller.restart_now().await.unwrap().unwrap();

        assert_eq!(daemon.log(), ["stop", "start"]);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
        assert_eq!(controller.backoff_index(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_kill_after_grace_window() {
        let daemon = Arc::new(FakeDaemon::default());
        daemon.running.store(true, Ordering::SeqCst);
        daemon.ignore_stop.store(true, Ordering::SeqCst);
        let controller = controller(daemon.clone());

        let started = Instant::now();
        controller.restart_now().await.unwrap().unwrap();

        assert_eq!(daemon.log(), ["stop", "kill", "start"]);
        // backoff delay plus the full grace window
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_daemon_is_just_started() {
        let daemon = Arc::new(FakeDaemon::default());
        let controller = controller(daemon.clone());

        controller.restart_now().await.unwrap().unwrap();
        assert_eq!(daemon.log(), ["start"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_still_advances_backoff() {
        let daemon = Arc::new(FakeDaemon::default());
        daemon.fail_start.store(true, Ordering::SeqCst);
        let controller = controller(daemon);

        let err = controller.restart_now().await.unwrap().unwrap_err();
        assert_eq!(err.attempt, 1);
        assert!(matches!(err.cause, RestartError::StartCommand(_)));
        assert_eq!(controller.backoff_index(), 1);
        assert_eq!(controller.next_delay(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_triggers_collapse() {
        let daemon = Arc::new(FakeDaemon::default());
        let controller = Arc::new(controller(daemon.clone()));

        assert!(controller.trigger());
        assert!(!controller.trigger());
        assert!(controller.restart_now().await.is_none());
        assert!(controller.in_flight());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!controller.in_flight());
        assert_eq!(controller.attempt_count(), 1);
        assert_eq!(daemon.log(), ["start"]);

        assert!(controller.trigger());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_backoff() {
        let daemon = Arc::new(FakeDaemon::default());
        let controller = controller(daemon);

        controller.restart_now().await.unwrap().unwrap();
        controller.restart_now().await.unwrap().unwrap();
        assert_eq!(controller.backoff_index(), 2);

        controller.reset_backoff();
        assert_eq!(controller.next_delay(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_during_backoff_cancels_attempt() {
        let daemon = Arc::new(FakeDaemon::default());
        daemon.running.store(true, Ordering::SeqCst);
        let controller = Arc::new(controller(daemon.clone()));

        controller.observe(false);
        assert!(controller.trigger());
        tokio::time::sleep(Duration::from_secs(2)).await;
        controller.observe(true);
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert!(!controller.in_flight());
        assert!(daemon.log().is_empty());
        assert_eq!(controller.backoff_index(), 0);
        assert!(!controller.take_completed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_restart_is_reported_once() {
        let daemon = Arc::new(FakeDaemon::default());
        let controller = controller(daemon);

        let outcome = controller.restart_now().await.unwrap().unwrap();
        assert_eq!(outcome, RestartOutcome::Restarted);
        assert!(controller.take_completed());
        assert!(!controller.take_completed());
    }

    #[test]
    fn test_process_daemon_missing_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = ProcessDaemon::new(dir.path().join("missing.pid"), vec![]);
        assert_eq!(daemon.read_pid().unwrap(), None);
        assert!(daemon.signal(libc::SIGTERM).is_ok());
    }

    #[test]
    fn test_process_daemon_rejects_garbage_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, "abc\n").unwrap();

        let daemon = ProcessDaemon::new(&path, vec![]);
        assert!(matches!(daemon.read_pid(), Err(RestartError::PidFile { .. })));
    }

    #[tokio::test]
    async fn test_process_daemon_sees_own_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        let daemon = ProcessDaemon::new(&path, vec![]);
        assert!(daemon.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn test_process_daemon_start_command() {
        let dir = tempfile::tempdir().unwrap();
        let ok = ProcessDaemon::new(dir.path().join("d.pid"), vec!["true".to_string()]);
        assert!(ok.start().await.is_ok());

        let failing = ProcessDaemon::new(dir.path().join("d.pid"), vec!["false".to_string()]);
        assert!(matches!(
            failing.start().await,
            Err(RestartError::StartCommand(_))
        ));

        let empty = ProcessDaemon::new(dir.path().join("d.pid"), vec![]);
        assert!(empty.start().await.is_err());
    }
}
