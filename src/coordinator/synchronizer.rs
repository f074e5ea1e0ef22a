//! The synchronizer: one polling loop per run, reconciling the mirror with the remote.
//!
//! ## State machine
//!
//! ```text
//!            start(run)                   DONE/ERROR, window expiry,
//!   Idle ─────────────────▶ Polling ─────────────────────────────▶ Stopped
//!     ▲                        │        non-transient failure
//!     └──────── stop() ────────┘
//! ```
//!
//! - `start` on the run already being polled is a no-op; starting another run stops
//!   the current loop first.
//! - A watch started by a command carries a baseline: the snapshot the command was
//!   checked against. A terminal status that is still the one from the baseline is
//!   left over from before the command and does not end the loop.
//! - Each tick takes the fetch lock, so a tick never overlaps an on-demand refresh.
//! - Cancellation is cooperative. A fetch that completes after `stop()` is discarded.
//! - When the polling window expires, one final fetch decides between a real terminal
//!   status and a timeout. Either way the outcome is published exactly once.

use chrono::{DateTime, Utc};
use reelforge_common::{PipelineRun, RunId, RunStatus, StepKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::mirror::{IngestOutcome, RunMirror};
use crate::errors::RemoteError;
use crate::pipeline::{ReadinessEvaluator, StepDuration, StepRegistry};
use crate::remote::RemotePipeline;

/// Default cadence between polls.
const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// Default cadence while a long-running step is RUNNING.
const DEFAULT_LONG_STEP_INTERVAL_MS: u64 = 5000;

/// Default wall-clock ceiling on one polling window (30 minutes).
const DEFAULT_MAX_WINDOW_SECS: u64 = 1800;

/// Default timeout for a single `get_state` call.
const DEFAULT_TICK_TIMEOUT_SECS: u64 = 15;

/// Polling cadence and limits.
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    /// Cadence while any long-running step is RUNNING
    pub long_step_interval: Duration,
    /// Explicit per-step cadence, taking precedence over the above
    pub step_intervals: HashMap<StepKey, Duration>,
    pub max_window: Duration,
    pub tick_timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            long_step_interval: Duration::from_millis(DEFAULT_LONG_STEP_INTERVAL_MS),
            step_intervals: HashMap::new(),
            max_window: Duration::from_secs(DEFAULT_MAX_WINDOW_SECS),
            tick_timeout: Duration::from_secs(DEFAULT_TICK_TIMEOUT_SECS),
        }
    }
}

impl PollConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_long_step_interval(mut self, interval: Duration) -> Self {
        self.long_step_interval = interval;
        self
    }

    pub fn with_step_interval(mut self, step: StepKey, interval: Duration) -> Self {
        self.step_intervals.insert(step, interval);
        self
    }

    pub fn with_max_window(mut self, window: Duration) -> Self {
        self.max_window = window;
        self
    }

    pub fn with_tick_timeout(mut self, tick_timeout: Duration) -> Self {
        self.tick_timeout = tick_timeout;
        self
    }

    /// Cadence for the next tick: the finest cadence among RUNNING steps, or the
    /// default interval when nothing is running.
    pub fn cadence_for(&self, registry: &StepRegistry, run: Option<&PipelineRun>) -> Duration {
        let Some(run) = run else {
            return self.interval;
        };
        run.steps
            .iter()
            .filter(|(_, state)| state.status == RunStatus::Running)
            .map(|(step, _)| match self.step_intervals.get(step) {
                Some(interval) => *interval,
                None if registry.duration(*step) == StepDuration::Long => self.long_step_interval,
                None => self.interval,
            })
            .min()
            .unwrap_or(self.interval)
    }
}

/// What a polling loop waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchScope {
    /// Stop when the run's top-level status is DONE or ERROR.
    Run,
    /// Stop when this step reaches DONE or ERROR, or the run reaches DONE.
    Step(StepKey),
}

impl WatchScope {
    /// The status this scope follows: the run's, or the watched step's.
    fn watched_status(&self, run: &PipelineRun) -> RunStatus {
        match self {
            WatchScope::Run => run.status,
            WatchScope::Step(step) => run.step_status(*step),
        }
    }

    /// Terminal status that ends a loop with this scope, if the snapshot shows one.
    fn terminal_status(&self, run: &PipelineRun) -> Option<RunStatus> {
        match self {
            WatchScope::Run => run.status.is_terminal().then_some(run.status),
            WatchScope::Step(step) => {
                let status = run.step_status(*step);
                if status.is_terminal() {
                    Some(status)
                } else if run.status == RunStatus::Done {
                    Some(RunStatus::Done)
                } else {
                    None
                }
            }
        }
    }
}

/// What the watched status looked like when the command behind a watch was issued.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WatchBaseline {
    terminal: Option<RunStatus>,
    updated_at: Option<DateTime<Utc>>,
    video_path: Option<String>,
}

impl WatchBaseline {
    fn capture(scope: WatchScope, run: &PipelineRun) -> Self {
        Self {
            terminal: scope.terminal_status(run),
            updated_at: run.updated_at,
            video_path: run.outputs.video_path.clone(),
        }
    }

    /// Whether `snapshot` shows progress made after the baseline was taken: the watched
    /// status was seen RUNNING, the terminal decision changed, the remote stamped a
    /// newer update, or a different video appeared.
    fn moved(
        &self,
        scope: WatchScope,
        snapshot: &PipelineRun,
        terminal: Option<RunStatus>,
    ) -> bool {
        scope.watched_status(snapshot) == RunStatus::Running
            || terminal != self.terminal
            || snapshot
                .updated_at
                .is_some_and(|at| Some(at) != self.updated_at)
            || (snapshot.outputs.video_path.is_some()
                && snapshot.outputs.video_path != self.video_path)
    }
}

/// How a polling loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The watched run (or step) reached this terminal status.
    Finished(RunStatus),
    /// The polling window expired and the final fetch showed no terminal status.
    /// The run may still complete; polling can be resumed.
    TimedOut { elapsed: Duration },
    /// A non-transient remote failure ended polling.
    Failed { error: String },
    Cancelled,
}

/// Observable synchronizer status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncStatus {
    #[default]
    Idle,
    /// `scope` is the scope of the live loop. A `start` that found the run already
    /// polled does not change it.
    Polling {
        run_id: RunId,
        scope: WatchScope,
        generation: u64,
    },
    Stopped {
        run_id: RunId,
        outcome: SyncOutcome,
    },
}

impl SyncStatus {
    pub fn is_polling(&self) -> bool {
        matches!(self, SyncStatus::Polling { .. })
    }
}

struct ActivePoll {
    run_id: RunId,
    cancel: CancellationToken,
    handle: JoinHandle<SyncOutcome>,
}

/// Owns at most one live polling loop.
pub struct Synchronizer {
    remote: Arc<dyn RemotePipeline>,
    mirror: Arc<RunMirror>,
    registry: Arc<StepRegistry>,
    config: PollConfig,
    fetch_lock: Arc<tokio::sync::Mutex<()>>,
    active: Mutex<Option<ActivePoll>>,
    status_tx: Arc<watch::Sender<SyncStatus>>,
    generation: AtomicU64,
}

impl Synchronizer {
    pub fn new(
        remote: Arc<dyn RemotePipeline>,
        mirror: Arc<RunMirror>,
        registry: Arc<StepRegistry>,
        config: PollConfig,
    ) -> Self {
        let (status_tx, _rx) = watch::channel(SyncStatus::Idle);
        Self {
            remote,
            mirror,
            registry,
            config,
            fetch_lock: Arc::new(tokio::sync::Mutex::new(())),
            active: Mutex::new(None),
            status_tx: Arc::new(status_tx),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Start polling `run_id`. Returns `false` when that run is already being polled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, run_id: &RunId, scope: WatchScope) -> bool {
        self.spawn_loop(run_id, scope, None)
    }

    /// Like [`start`](Self::start), for a watch that follows a command issued against
    /// `baseline`. A terminal status the baseline already showed is ignored until the
    /// remote reports movement.
    ///
    /// When the run is already polled the live loop keeps its scope and baseline. It
    /// started earlier, so it has already seen or will see everything this watch would.
    pub fn start_after(&self, run_id: &RunId, scope: WatchScope, baseline: &PipelineRun) -> bool {
        self.spawn_loop(run_id, scope, Some(WatchBaseline::capture(scope, baseline)))
    }

    fn spawn_loop(
        &self,
        run_id: &RunId,
        scope: WatchScope,
        baseline: Option<WatchBaseline>,
    ) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = active.as_ref()
            && current.run_id == *run_id
            && !current.handle.is_finished()
        {
            debug!(run_id = %run_id, "poll loop already active");
            return false;
        }
        if let Some(previous) = active.take() {
            info!(run_id = %previous.run_id, "stopping previous poll loop");
            previous.cancel.cancel();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        self.status_tx.send_replace(SyncStatus::Polling {
            run_id: run_id.clone(),
            scope,
            generation,
        });

        let armed = baseline.as_ref().is_none_or(|b| b.terminal.is_none());
        let task = PollTask {
            run_id: run_id.clone(),
            scope,
            baseline,
            armed,
            generation,
            remote: Arc::clone(&self.remote),
            mirror: Arc::clone(&self.mirror),
            registry: Arc::clone(&self.registry),
            config: self.config.clone(),
            fetch_lock: Arc::clone(&self.fetch_lock),
            cancel: cancel.clone(),
            status_tx: Arc::clone(&self.status_tx),
        };
        info!(
            run_id = %run_id,
            ?scope,
            generation,
            interval_ms = self.config.interval.as_millis() as u64,
            max_window_secs = self.config.max_window.as_secs(),
            "starting poll loop"
        );
        let handle = tokio::spawn(task.run());
        *active = Some(ActivePoll {
            run_id: run_id.clone(),
            cancel,
            handle,
        });
        true
    }

    /// Stop polling. Idempotent.
    pub fn stop(&self) {
        let previous = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(previous) = previous {
            previous.cancel.cancel();
            info!(run_id = %previous.run_id, "poll loop stopped");
        }
        self.status_tx.send_if_modified(|status| {
            if status.is_polling() {
                *status = SyncStatus::Idle;
                true
            } else {
                false
            }
        });
    }

    /// Whether a poll loop is live.
    pub fn is_polling(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|a| !a.handle.is_finished())
    }

    /// Run currently (or most recently) polled.
    pub fn active_run(&self) -> Option<RunId> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|a| a.run_id.clone())
    }

    /// Number of poll loops spawned over the synchronizer's lifetime.
    pub fn loops_started(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SyncStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Wait until the current loop ends. Returns `None` if polling was stopped by the
    /// caller or was never started.
    pub async fn wait(&self) -> Option<SyncOutcome> {
        let mut rx = self.subscribe();
        let status = match rx.wait_for(|s| !s.is_polling()).await {
            Ok(status) => status.clone(),
            Err(_) => return None,
        };
        match status {
            SyncStatus::Stopped { outcome, .. } => Some(outcome),
            _ => None,
        }
    }

    /// Fetch and ingest a snapshot now, outside the poll cadence.
    ///
    /// Serialized with poll ticks through the fetch lock.
    pub async fn refresh(&self, run_id: &RunId) -> Result<Arc<PipelineRun>, RemoteError> {
        let _guard = self.fetch_lock.lock().await;
        let ticket = self.mirror.issue_ticket();
        let snapshot = fetch(self.remote.as_ref(), run_id, self.config.tick_timeout).await?;
        let outcome = self.mirror.ingest(ticket, snapshot.clone());
        debug!(run_id = %run_id, ?outcome, "refreshed run state");
        Ok(self.mirror.current().unwrap_or_else(|| Arc::new(snapshot)))
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        if let Some(active) = self
            .active
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            active.cancel.cancel();
        }
    }
}

async fn fetch(
    remote: &dyn RemotePipeline,
    run_id: &RunId,
    tick_timeout: Duration,
) -> Result<PipelineRun, RemoteError> {
    match timeout(tick_timeout, remote.get_state(run_id)).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout {
            operation: "get_state",
            after: tick_timeout,
        }),
    }
}

enum Tick {
    Continue,
    Terminal(RunStatus),
    Failed(RemoteError),
    Cancelled,
}

struct PollTask {
    run_id: RunId,
    scope: WatchScope,
    baseline: Option<WatchBaseline>,
    /// Set once terminal statuses may end the loop
    armed: bool,
    generation: u64,
    remote: Arc<dyn RemotePipeline>,
    mirror: Arc<RunMirror>,
    registry: Arc<StepRegistry>,
    config: PollConfig,
    fetch_lock: Arc<tokio::sync::Mutex<()>>,
    cancel: CancellationToken,
    status_tx: Arc<watch::Sender<SyncStatus>>,
}

impl PollTask {
    async fn run(mut self) -> SyncOutcome {
        let outcome = self.poll().await;
        match &outcome {
            SyncOutcome::Finished(status) => {
                info!(run_id = %self.run_id, %status, "poll loop finished")
            }
            SyncOutcome::TimedOut { elapsed } => warn!(
                run_id = %self.run_id,
                elapsed_secs = elapsed.as_secs(),
                "polling window expired without a terminal status"
            ),
            SyncOutcome::Failed { error } => {
                error!(run_id = %self.run_id, %error, "poll loop failed")
            }
            SyncOutcome::Cancelled => debug!(run_id = %self.run_id, "poll loop cancelled"),
        }
        if outcome != SyncOutcome::Cancelled {
            self.publish(outcome.clone());
        }
        outcome
    }

    /// Publish the outcome unless a newer loop has taken over the status.
    fn publish(&self, outcome: SyncOutcome) {
        self.status_tx.send_if_modified(|status| match status {
            SyncStatus::Polling { generation, .. } if *generation == self.generation => {
                *status = SyncStatus::Stopped {
                    run_id: self.run_id.clone(),
                    outcome,
                };
                true
            }
            _ => false,
        });
    }

    async fn poll(&mut self) -> SyncOutcome {
        let started = Instant::now();
        let mut failures: u32 = 0;

        loop {
            let elapsed = started.elapsed();
            if elapsed >= self.config.max_window {
                return self.final_check(started).await;
            }

            match self.tick().await {
                Tick::Continue => failures = 0,
                Tick::Terminal(status) => return SyncOutcome::Finished(status),
                Tick::Cancelled => return SyncOutcome::Cancelled,
                Tick::Failed(err) if err.is_transient() => {
                    failures += 1;
                    warn!(
                        run_id = %self.run_id,
                        consecutive_failures = failures,
                        error = %err,
                        "transient poll failure"
                    );
                }
                Tick::Failed(err) => {
                    return SyncOutcome::Failed {
                        error: err.to_string(),
                    };
                }
            }

            let cadence = {
                let current = self.mirror.current();
                self.config.cadence_for(&self.registry, current.as_deref())
            };
            let remaining = self.config.max_window.saturating_sub(started.elapsed());
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SyncOutcome::Cancelled,
                _ = sleep(cadence.min(remaining)) => {}
            }
        }
    }

    /// One final fetch after the window expires. A terminal status observed here wins
    /// over the timeout.
    async fn final_check(&mut self, started: Instant) -> SyncOutcome {
        debug!(run_id = %self.run_id, "polling window expired, issuing final fetch");
        match self.tick().await {
            Tick::Terminal(status) => SyncOutcome::Finished(status),
            Tick::Cancelled => SyncOutcome::Cancelled,
            Tick::Continue | Tick::Failed(_) => SyncOutcome::TimedOut {
                elapsed: started.elapsed(),
            },
        }
    }

    async fn tick(&mut self) -> Tick {
        let fetch_lock = Arc::clone(&self.fetch_lock);
        let _guard = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Tick::Cancelled,
            guard = fetch_lock.lock() => guard,
        };
        let ticket = self.mirror.issue_ticket();
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Tick::Cancelled,
            result = fetch(self.remote.as_ref(), &self.run_id, self.config.tick_timeout) => result,
        };
        if self.cancel.is_cancelled() {
            return Tick::Cancelled;
        }

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(err) => return Tick::Failed(err),
        };
        if snapshot.run_id != self.run_id {
            return Tick::Failed(RemoteError::Decode(format!(
                "snapshot for run {} returned while polling {}",
                snapshot.run_id, self.run_id
            )));
        }

        let terminal = self.terminal_status(&snapshot);
        let evaluator = ReadinessEvaluator::new(&self.registry);
        for (step, reason) in evaluator.running_violations(&snapshot) {
            warn!(run_id = %self.run_id, %step, %reason, "remote reports step RUNNING with unmet prerequisites");
        }
        let outcome = self.mirror.ingest(ticket, snapshot);
        debug!(run_id = %self.run_id, ?outcome, "poll tick");
        if outcome == IngestOutcome::Stale {
            return Tick::Continue;
        }

        match terminal {
            Some(status) => Tick::Terminal(status),
            None => Tick::Continue,
        }
    }

    fn terminal_status(&mut self, snapshot: &PipelineRun) -> Option<RunStatus> {
        let terminal = self.scope.terminal_status(snapshot);
        if !self.armed {
            let moved = self
                .baseline
                .as_ref()
                .is_none_or(|b| b.moved(self.scope, snapshot, terminal));
            if !moved {
                debug!(
                    run_id = %self.run_id,
                    ?terminal,
                    "terminal status predates this watch, still polling"
                );
                return None;
            }
            self.armed = true;
        }
        terminal
    }
}
