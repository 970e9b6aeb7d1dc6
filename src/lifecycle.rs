use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::notifier::{ChangeKind, ChangeNotifier};
use crate::parser::LOG_EXTENSION;

const CHANNEL_CAPACITY: usize = 256;
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Starting,
    Active,
    Idle,
    GracePeriod,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    pub idle_timeout: Duration,
    pub grace_period: Duration,
    pub shutdown_disabled: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub project_id: String,
    pub session_id: String,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleStatus {
    pub state: LifecycleState,
    pub active_sessions: Vec<ActiveSession>,
    pub grace_timer_remaining_ms: Option<u64>,
    pub shutdown_disabled: bool,
}

pub fn session_key(root: &Path, path: &Path) -> Option<(String, String)> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = relative.components();
    let project = parts.next()?.as_os_str().to_str()?;
    let file = Path::new(parts.next()?.as_os_str());
    if parts.next().is_some() || file.extension().and_then(|ext| ext.to_str()) != Some(LOG_EXTENSION) {
        return None;
    }
    let session = file.file_stem()?.to_str()?;
    Some((project.to_string(), session.to_string()))
}

/// Activity state machine. Time is passed in, so it can be driven from
/// tests without a runtime.
#[derive(Debug)]
pub struct LifecycleMachine {
    config: LifecycleConfig,
    state: LifecycleState,
    sessions: BTreeMap<(String, String), Instant>,
    started_at: Instant,
    grace_deadline: Option<Instant>,
}

impl LifecycleMachine {
    pub fn new(config: LifecycleConfig, now: Instant) -> Self {
        Self {
            config,
            state: LifecycleState::Starting,
            sessions: BTreeMap::new(),
            started_at: now,
            grace_deadline: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn should_exit(&self) -> bool {
        self.state == LifecycleState::ShuttingDown && !self.config.shutdown_disabled
    }

    pub fn grace_deadline(&self) -> Option<Instant> {
        self.grace_deadline
    }

    pub fn record_write(&mut self, project_id: &str, session_id: &str, now: Instant) -> Vec<LifecycleState> {
        let mut entered = Vec::new();
        if self.should_exit() {
            return entered;
        }
        self.sessions
            .insert((project_id.to_string(), session_id.to_string()), now);
        self.grace_deadline = None;
        if self.state != LifecycleState::Active {
            self.enter(LifecycleState::Active, &mut entered);
        }
        entered
    }

    pub fn tick(&mut self, now: Instant) -> Vec<LifecycleState> {
        let mut entered = Vec::new();
        let idle_timeout = self.config.idle_timeout;
        self.sessions
            .retain(|_, last| now.saturating_duration_since(*last) < idle_timeout);

        match self.state {
            LifecycleState::Starting => {
                if now.saturating_duration_since(self.started_at) >= idle_timeout {
                    self.begin_grace(now, &mut entered);
                }
            }
            LifecycleState::Active | LifecycleState::Idle => {
                if self.sessions.is_empty() {
                    self.begin_grace(now, &mut entered);
                }
            }
            LifecycleState::GracePeriod => {
                if self.grace_deadline.is_some_and(|deadline| now >= deadline) {
                    self.grace_deadline = None;
                    self.enter(LifecycleState::ShuttingDown, &mut entered);
                }
            }
            LifecycleState::ShuttingDown => {}
        }
        entered
    }

    pub fn status(&self, now: Instant) -> LifecycleStatus {
        LifecycleStatus {
            state: self.state,
            active_sessions: self
                .sessions
                .iter()
                .map(|((project_id, session_id), last)| ActiveSession {
                    project_id: project_id.clone(),
                    session_id: session_id.clone(),
                    idle_ms: now.saturating_duration_since(*last).as_millis() as u64,
                })
                .collect(),
            grace_timer_remaining_ms: self
                .grace_deadline
                .map(|deadline| deadline.saturating_duration_since(now).as_millis() as u64),
            shutdown_disabled: self.config.shutdown_disabled,
        }
    }

    fn begin_grace(&mut self, now: Instant, entered: &mut Vec<LifecycleState>) {
        self.enter(LifecycleState::Idle, entered);
        self.grace_deadline = Some(later(now, self.config.grace_period));
        self.enter(LifecycleState::GracePeriod, entered);
    }

    fn enter(&mut self, state: LifecycleState, entered: &mut Vec<LifecycleState>) {
        self.state = state;
        entered.push(state);
    }
}

pub struct LifecycleTracker {
    machine: Arc<Mutex<LifecycleMachine>>,
    paths: mpsc::Sender<PathBuf>,
    exit: watch::Receiver<bool>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LifecycleTracker {
    pub fn spawn(
        root: PathBuf,
        config: LifecycleConfig,
        sweep_interval: Duration,
        notifier: Arc<ChangeNotifier>,
    ) -> Self {
        let machine = Arc::new(Mutex::new(LifecycleMachine::new(config, now())));
        let (paths_tx, paths_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(drive(
            Arc::clone(&machine),
            root,
            sweep_interval,
            paths_rx,
            stop_rx,
            exit_tx,
            notifier,
        ));

        Self {
            machine,
            paths: paths_tx,
            exit: exit_rx,
            stop: stop_tx,
            task,
        }
    }

    pub async fn observe(&self, path: PathBuf) {
        if self.paths.send(path).await.is_err() {
            debug!("lifecycle tracker no longer accepting paths");
        }
    }

    pub fn status(&self) -> LifecycleStatus {
        lock(&self.machine).status(now())
    }

    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exit.clone()
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "lifecycle tracker task failed");
        }
    }
}

fn later(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait.min(FAR_FUTURE))
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

fn lock(machine: &Mutex<LifecycleMachine>) -> std::sync::MutexGuard<'_, LifecycleMachine> {
    machine.lock().unwrap_or_else(PoisonError::into_inner)
}

fn log_transitions(entered: &[LifecycleState]) {
    for state in entered {
        info!(state = ?state, "lifecycle transition");
    }
}

async fn drive(
    machine: Arc<Mutex<LifecycleMachine>>,
    root: PathBuf,
    sweep_interval: Duration,
    mut paths: mpsc::Receiver<PathBuf>,
    mut stop: watch::Receiver<bool>,
    exit: watch::Sender<bool>,
    notifier: Arc<ChangeNotifier>,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let deadline = lock(&machine).grace_deadline();
        let wake_at = tokio::time::Instant::from_std(deadline.unwrap_or_else(|| later(now(), FAR_FUTURE)));

        let entered = tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    debug!("lifecycle tracker stopped");
                    return;
                }
                Vec::new()
            }
            Some(path) = paths.recv() => {
                match session_key(&root, &path) {
                    Some((project, session)) => lock(&machine).record_write(&project, &session, now()),
                    None => Vec::new(),
                }
            }
            _ = sweep.tick() => lock(&machine).tick(now()),
            _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => lock(&machine).tick(now()),
        };
        log_transitions(&entered);

        if entered.contains(&LifecycleState::ShuttingDown) {
            if lock(&machine).should_exit() {
                info!("no session activity through the grace period; shutting down");
                notifier.publish(ChangeKind::Shutdown);
                let _ = exit.send(true);
                return;
            }
            info!("shutdown disabled; staying up until new activity");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_secs(600);
    const GRACE: Duration = Duration::from_secs(300);

    fn config(shutdown_disabled: bool) -> LifecycleConfig {
        LifecycleConfig {
            idle_timeout: IDLE,
            grace_period: GRACE,
            shutdown_disabled,
        }
    }

    #[test]
    fn full_idle_sequence_ends_in_shutdown() {
        let t0 = Instant::now();
        let mut machine = LifecycleMachine::new(config(false), t0);
        assert_eq!(machine.state(), LifecycleState::Starting);

        let t1 = t0 + Duration::from_secs(1);
        assert_eq!(machine.record_write("p", "s", t1), vec![LifecycleState::Active]);
        assert!(machine.tick(t1 + IDLE / 2).is_empty());

        let idle_at = t1 + IDLE;
        assert_eq!(
            machine.tick(idle_at),
            vec![LifecycleState::Idle, LifecycleState::GracePeriod]
        );
        assert!(machine.tick(idle_at + GRACE / 2).is_empty());
        assert_eq!(machine.tick(idle_at + GRACE), vec![LifecycleState::ShuttingDown]);
        assert!(machine.should_exit());
    }

    #[test]
    fn write_during_grace_returns_to_active_and_restarts() {
        let t0 = Instant::now();
        let mut machine = LifecycleMachine::new(config(false), t0);
        machine.record_write("p", "s", t0);
        machine.tick(t0 + IDLE);
        assert_eq!(machine.state(), LifecycleState::GracePeriod);

        let resumed = t0 + IDLE + GRACE - Duration::from_secs(1);
        assert_eq!(machine.record_write("p", "s2", resumed), vec![LifecycleState::Active]);
        assert_eq!(machine.grace_deadline(), None);

        assert!(machine.tick(t0 + IDLE + GRACE).is_empty());
        assert_eq!(machine.state(), LifecycleState::Active);
        assert_eq!(
            machine.tick(resumed + IDLE),
            vec![LifecycleState::Idle, LifecycleState::GracePeriod]
        );
    }

    #[test]
    fn huge_grace_period_does_not_overflow() {
        let t0 = Instant::now();
        let mut machine = LifecycleMachine::new(
            LifecycleConfig {
                idle_timeout: Duration::from_secs(1),
                grace_period: Duration::MAX,
                shutdown_disabled: false,
            },
            t0,
        );
        let idle_at = t0 + Duration::from_secs(1);
        assert_eq!(
            machine.tick(idle_at),
            vec![LifecycleState::Idle, LifecycleState::GracePeriod]
        );
        let deadline = machine.grace_deadline().expect("grace deadline");
        assert!(deadline > idle_at);
        assert!(machine.tick(idle_at + Duration::from_secs(86_400)).is_empty());
    }

    #[test]
    fn unused_daemon_still_goes_idle() {
        let t0 = Instant::now();
        let mut machine = LifecycleMachine::new(config(false), t0);
        assert!(machine.tick(t0 + IDLE - Duration::from_secs(1)).is_empty());
        assert_eq!(
            machine.tick(t0 + IDLE),
            vec![LifecycleState::Idle, LifecycleState::GracePeriod]
        );
    }

    #[test]
    fn disabled_shutdown_reports_state_but_recovers_on_activity() {
        let t0 = Instant::now();
        let mut machine = LifecycleMachine::new(config(true), t0);
        machine.tick(t0 + IDLE);
        machine.tick(t0 + IDLE + GRACE);
        assert_eq!(machine.state(), LifecycleState::ShuttingDown);
        assert!(!machine.should_exit());

        let later = t0 + IDLE * 3;
        assert_eq!(machine.record_write("p", "s", later), vec![LifecycleState::Active]);
    }

    #[test]
    fn sweep_expires_only_idle_sessions() {
        let t0 = Instant::now();
        let mut machine = LifecycleMachine::new(config(false), t0);
        machine.record_write("p", "old", t0);
        machine.record_write("p", "new", t0 + IDLE / 2);

        assert!(machine.tick(t0 + IDLE).is_empty());
        let status = machine.status(t0 + IDLE);
        assert_eq!(status.state, LifecycleState::Active);
        assert_eq!(status.active_sessions.len(), 1);
        assert_eq!(status.active_sessions[0].session_id, "new");
        assert_eq!(status.grace_timer_remaining_ms, None);
    }

    #[test]
    fn status_reports_grace_remaining() {
        let t0 = Instant::now();
        let mut machine = LifecycleMachine::new(config(false), t0);
        machine.tick(t0 + IDLE);
        let status = machine.status(t0 + IDLE + Duration::from_secs(100));
        assert_eq!(status.state, LifecycleState::GracePeriod);
        assert_eq!(status.grace_timer_remaining_ms, Some(200_000));

        let value = serde_json::to_value(&status).expect("json");
        assert_eq!(value["state"], "GRACE_PERIOD");
        assert_eq!(value["graceTimerRemainingMs"], 200_000);
    }

    #[test]
    fn only_session_logs_count_as_activity() {
        let root = Path::new("/home/u/.claude/projects");
        assert_eq!(
            session_key(root, &root.join("-repo/abc.jsonl")),
            Some(("-repo".to_string(), "abc".to_string()))
        );
        assert_eq!(session_key(root, &root.join("-repo/sessions-index.json")), None);
        assert_eq!(session_key(root, &root.join("-repo/sub/abc.jsonl")), None);
        assert_eq!(session_key(root, &root.join("abc.jsonl")), None);
        assert_eq!(session_key(root, Path::new("/tmp/-repo/abc.jsonl")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_signals_exit_after_grace() {
        let notifier = Arc::new(ChangeNotifier::default());
        let mut events = notifier.subscribe();
        let root = PathBuf::from("/projects");
        let tracker = LifecycleTracker::spawn(
            root.clone(),
            LifecycleConfig {
                idle_timeout: Duration::from_secs(10),
                grace_period: Duration::from_secs(5),
                shutdown_disabled: false,
            },
            Duration::from_secs(1),
            Arc::clone(&notifier),
        );

        tracker.observe(root.join("-repo/s1.jsonl")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tracker.status().state, LifecycleState::Active);

        let mut exit = tracker.exit_signal();
        exit.wait_for(|flag| *flag).await.expect("exit signal");
        assert_eq!(tracker.status().state, LifecycleState::ShuttingDown);
        assert_eq!(events.try_recv().map(|e| e.kind), Some(ChangeKind::Shutdown));
        tracker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_stop_ends_the_task() {
        let tracker = LifecycleTracker::spawn(
            PathBuf::from("/projects"),
            config(false),
            Duration::from_secs(15),
            Arc::new(ChangeNotifier::default()),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(tracker.status().state, LifecycleState::Starting);
        tracker.stop().await;
    }
}
