//! The run coordinator: the one entry point callers use.
//!
//! Every command is checked against the mirrored snapshot before it reaches the remote
//! system. Commands never mutate the mirror directly; their effect shows up on the
//! next poll.

use chrono::{DateTime, Utc};
use reelforge_common::{
    CompileMode, PipelineRun, RunId, StartRunRequest, StepKey, StepSettings,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::mirror::{MirrorState, RunMirror};
use super::synchronizer::{PollConfig, SyncOutcome, SyncStatus, Synchronizer, WatchScope};
use super::view::RunView;
use crate::errors::{CoordinatorError, RemoteError};
use crate::pipeline::{
    Remediation, RetryManager, RetryTrigger, SettingChange, SettingsSnapshot, StepRegistry,
    compilation_readiness,
};
use crate::remote::{CompileAck, RemotePipeline};

/// Explicit reference to the run a caller is working with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
}

impl RunHandle {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileOutcome {
    /// The remote system accepted a new compilation.
    Started,
    /// A compilation was already underway; the coordinator is now observing it.
    AlreadyRunning,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub start_timeout: Duration,
    /// Timeout for retry and compile commands
    pub command_timeout: Duration,
    pub poll: PollConfig,
    pub max_manual_retries: Option<u32>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(15),
            poll: PollConfig::default(),
            max_manual_retries: None,
        }
    }
}

pub struct RunCoordinator {
    remote: Arc<dyn RemotePipeline>,
    registry: Arc<StepRegistry>,
    mirror: Arc<RunMirror>,
    sync: Synchronizer,
    retries: Mutex<RetryManager>,
    baseline: Mutex<Option<SettingsSnapshot>>,
    config: CoordinatorConfig,
}

impl RunCoordinator {
    pub fn new(
        remote: Arc<dyn RemotePipeline>,
        registry: Arc<StepRegistry>,
        config: CoordinatorConfig,
    ) -> Self {
        let mirror = Arc::new(RunMirror::new());
        let sync = Synchronizer::new(
            Arc::clone(&remote),
            Arc::clone(&mirror),
            Arc::clone(&registry),
            config.poll.clone(),
        );
        let retries = RetryManager::new(Arc::clone(&registry), config.max_manual_retries);
        Self {
            remote,
            registry,
            mirror,
            sync,
            retries: Mutex::new(retries),
            baseline: Mutex::new(None),
            config,
        }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    fn retries(&self) -> MutexGuard<'_, RetryManager> {
        self.retries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn baseline(&self) -> MutexGuard<'_, Option<SettingsSnapshot>> {
        self.baseline.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a new run and begin polling it.
    ///
    /// Start failures are fatal and never retried. On success any previously tracked run
    /// is dropped locally.
    pub async fn start_run(&self, request: StartRunRequest) -> Result<RunHandle, CoordinatorError> {
        info!(topic = %request.topic, language = %request.language, "starting run");
        let run_id = with_timeout(
            "start_run",
            self.config.start_timeout,
            self.remote.start_run(&request),
        )
        .await
        .map_err(CoordinatorError::StartFailed)?;

        self.forget_local_state();
        *self.baseline() = Some(SettingsSnapshot::capture(&request.per_step_configs));
        self.sync.start(&run_id, WatchScope::Run);
        info!(run_id = %run_id, "run started");
        Ok(RunHandle::new(run_id))
    }

    /// Track an existing run, e.g. one started by an earlier process.
    pub async fn attach(&self, handle: &RunHandle) -> Result<Arc<PipelineRun>, CoordinatorError> {
        self.forget_local_state();
        let run = self.refresh(handle).await?;
        if !run.status.is_terminal() {
            self.sync.start(&handle.run_id, WatchScope::Run);
        }
        info!(run_id = %handle.run_id, status = %run.status, "attached to run");
        Ok(run)
    }

    /// Fetch the run's state now and fold remote attempt counts into the local budget.
    pub async fn refresh(&self, handle: &RunHandle) -> Result<Arc<PipelineRun>, CoordinatorError> {
        let run = self
            .sync
            .refresh(&handle.run_id)
            .await
            .map_err(|source| CoordinatorError::Remote {
                operation: "get_state",
                step: None,
                source,
            })?;
        self.retries().observe(&run);
        Ok(run)
    }

    /// Snapshot for `handle`, fetching one if the mirror is still empty.
    async fn current_for(&self, handle: &RunHandle) -> Result<Arc<PipelineRun>, CoordinatorError> {
        if let Some(run) = self.mirror.current() {
            if run.run_id != handle.run_id {
                return Err(CoordinatorError::RunMismatch {
                    requested: handle.run_id.clone(),
                    mirrored: run.run_id.clone(),
                });
            }
            return Ok(run);
        }
        match self.sync.active_run() {
            Some(active) if active != handle.run_id => Err(CoordinatorError::RunMismatch {
                requested: handle.run_id.clone(),
                mirrored: active,
            }),
            Some(_) => self.refresh(handle).await,
            None => Err(CoordinatorError::NoActiveRun),
        }
    }

    /// Retry a failed step.
    ///
    /// Automatic retries must fit the step's budget. Operator retries may go past it as
    /// long as the step is retriable and the manual ceiling (if any) allows. The attempt
    /// is reserved before the remote call and handed back if the call fails, so
    /// concurrent retries cannot overrun the budget.
    pub async fn retry_step(
        &self,
        handle: &RunHandle,
        step: StepKey,
        trigger: RetryTrigger,
    ) -> Result<Remediation, CoordinatorError> {
        let run = self.current_for(handle).await?;
        let (remediation, assessment, counter) = {
            let mut retries = self.retries();
            retries.observe(&run);
            let assessment = retries.assess(step, &run);
            let (remediation, counter) = retries.reserve(step, &run, trigger)?;
            (remediation, assessment, counter)
        };

        debug!(run_id = %handle.run_id, %step, ?trigger, ?remediation, "issuing retry");
        let sent = with_timeout(
            "retry_step",
            self.config.command_timeout,
            self.remote.retry_step(&handle.run_id, step),
        )
        .await;
        if let Err(source) = sent {
            self.retries().release(step, trigger);
            return Err(CoordinatorError::RetryFailed {
                step,
                attempts_remaining: assessment.attempts_remaining(),
                manual_fix_required: assessment.manual_fix_required,
                source,
            });
        }

        info!(
            run_id = %handle.run_id,
            %step,
            ?trigger,
            ?remediation,
            attempt = counter.automatic + counter.operator,
            "retry accepted"
        );
        self.sync.start_after(&handle.run_id, WatchScope::Run, &run);
        Ok(remediation)
    }

    /// Ask the remote system to compile the video.
    ///
    /// Refused locally until a shot plan and narrated audio exist. A remote conflict
    /// means a compilation is already running; the coordinator then observes it.
    pub async fn request_compilation(
        &self,
        handle: &RunHandle,
        mode: CompileMode,
    ) -> Result<CompileOutcome, CoordinatorError> {
        let run = self.current_for(handle).await?;
        let readiness = compilation_readiness(&run);
        if !readiness.ready {
            return Err(CoordinatorError::CompilationNotReady {
                missing: readiness.missing.iter().map(|m| m.to_string()).collect(),
            });
        }

        let ack = with_timeout(
            "compile",
            self.config.command_timeout,
            self.remote.compile(&handle.run_id, mode),
        )
        .await
        .map_err(|source| CoordinatorError::Remote {
            operation: "compile",
            step: Some(StepKey::CompilationBuilder),
            source,
        })?;

        let outcome = match ack {
            CompileAck::Accepted => CompileOutcome::Started,
            CompileAck::Conflict => {
                warn!(run_id = %handle.run_id, "compilation already in progress, observing it");
                CompileOutcome::AlreadyRunning
            }
        };
        self.sync.start_after(
            &handle.run_id,
            WatchScope::Step(StepKey::CompilationBuilder),
            &run,
        );
        info!(run_id = %handle.run_id, %mode, ?outcome, "compilation requested");
        Ok(outcome)
    }

    /// Stop polling and forget the local view. Remote state is untouched.
    pub fn reset(&self) {
        self.forget_local_state();
        info!("local run state reset");
    }

    fn forget_local_state(&self) {
        self.sync.stop();
        self.mirror.clear();
        self.retries().reset();
        *self.baseline() = None;
    }

    pub fn current(&self) -> Option<Arc<PipelineRun>> {
        self.mirror.current()
    }

    pub fn view(&self) -> Option<RunView> {
        let state = self.mirror.state();
        let run = state.run?;
        let retries = self.retries();
        Some(RunView::build(
            &run,
            &self.registry,
            &retries,
            self.sync.status(),
            state.fetched_at,
        ))
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sync.status()
    }

    pub fn is_polling(&self) -> bool {
        self.sync.is_polling()
    }

    /// Resume polling after a timeout.
    pub fn resume(&self, handle: &RunHandle) -> bool {
        self.sync.start(&handle.run_id, WatchScope::Run)
    }

    pub fn stop_polling(&self) {
        self.sync.stop();
    }

    /// Wait for the current polling loop to finish.
    pub async fn wait(&self) -> Option<SyncOutcome> {
        let outcome = self.sync.wait().await;
        if let Some(run) = self.mirror.current() {
            self.retries().observe(&run);
        }
        outcome
    }

    pub fn subscribe(&self) -> watch::Receiver<MirrorState> {
        self.mirror.subscribe()
    }

    pub fn subscribe_sync(&self) -> watch::Receiver<SyncStatus> {
        self.sync.subscribe()
    }

    /// Field-level differences between the settings the run started with and `current`.
    pub fn unsaved_changes(&self, current: &BTreeMap<StepKey, StepSettings>) -> Vec<SettingChange> {
        self.baseline()
            .as_ref()
            .map(|baseline| baseline.diff(current))
            .unwrap_or_default()
    }

    /// Number of poll loops spawned so far.
    pub fn poll_loops_started(&self) -> u64 {
        self.sync.loops_started()
    }
}

async fn with_timeout<T>(
    operation: &'static str,
    after: Duration,
    call: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    match timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout { operation, after }),
    }
}
