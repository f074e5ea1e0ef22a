//! Coordinator behavior against an in-memory remote, on a paused tokio clock.

use async_trait::async_trait;
use reelforge::coordinator::{
    CompileOutcome, CoordinatorConfig, PollConfig, RunCoordinator, RunHandle, RunMirror,
    SyncOutcome, SyncStatus, Synchronizer, WatchScope,
};
use reelforge::errors::{CoordinatorError, RemoteError, RetryRejection};
use reelforge::pipeline::{Remediation, RetryTrigger, StepRegistry};
use reelforge::remote::{CompileAck, RemotePipeline};
use reelforge_common::{
    CompileMode, NarratedAudio, PipelineRun, RunId, RunOutputs, RunStatus, ShotPlan, ShotScene,
    StartRunRequest, StepKey, StepSettings, StepState, StepStatus, ValidationIssue,
    ValidationResult,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, sleep};

type Responder = dyn Fn(usize, Duration) -> Result<PipelineRun, RemoteError> + Send + Sync;

#[derive(Default)]
struct Calls {
    starts: Vec<StartRunRequest>,
    gets: Vec<Instant>,
    retries: Vec<StepKey>,
    compiles: Vec<CompileMode>,
}

/// Remote whose `get_state` answers come from a closure over (call index, time since
/// creation).
struct FakeRemote {
    run_id: RunId,
    responder: Box<Responder>,
    created: Instant,
    get_delay: Duration,
    retry_delay: Duration,
    compile_ack: CompileAck,
    fail_start: bool,
    fail_retries: bool,
    calls: Mutex<Calls>,
}

impl FakeRemote {
    fn new<F>(run_id: &str, responder: F) -> Self
    where
        F: Fn(usize, Duration) -> Result<PipelineRun, RemoteError> + Send + Sync + 'static,
    {
        Self {
            run_id: RunId::new(run_id),
            responder: Box::new(responder),
            created: Instant::now(),
            get_delay: Duration::ZERO,
            retry_delay: Duration::ZERO,
            compile_ack: CompileAck::Accepted,
            fail_start: false,
            fail_retries: false,
            calls: Mutex::new(Calls::default()),
        }
    }

    fn fixed(snapshot: PipelineRun) -> Self {
        let run_id = snapshot.run_id.to_string();
        Self::new(&run_id, move |_, _| Ok(snapshot.clone()))
    }

    fn with_get_delay(mut self, delay: Duration) -> Self {
        self.get_delay = delay;
        self
    }

    fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn with_compile_ack(mut self, ack: CompileAck) -> Self {
        self.compile_ack = ack;
        self
    }

    fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    fn failing_retries(mut self) -> Self {
        self.fail_retries = true;
        self
    }

    fn get_count(&self) -> usize {
        self.calls.lock().unwrap().gets.len()
    }

    fn get_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().gets.clone()
    }

    fn retries(&self) -> Vec<StepKey> {
        self.calls.lock().unwrap().retries.clone()
    }

    fn compiles(&self) -> Vec<CompileMode> {
        self.calls.lock().unwrap().compiles.clone()
    }

    fn starts(&self) -> usize {
        self.calls.lock().unwrap().starts.len()
    }
}

#[async_trait]
impl RemotePipeline for FakeRemote {
    async fn start_run(&self, request: &StartRunRequest) -> Result<RunId, RemoteError> {
        self.calls.lock().unwrap().starts.push(request.clone());
        if self.fail_start {
            return Err(RemoteError::Http {
                status: 422,
                body: "topic rejected".to_string(),
            });
        }
        Ok(self.run_id.clone())
    }

    async fn get_state(&self, _run_id: &RunId) -> Result<PipelineRun, RemoteError> {
        let (index, elapsed) = {
            let mut calls = self.calls.lock().unwrap();
            calls.gets.push(Instant::now());
            (calls.gets.len() - 1, self.created.elapsed())
        };
        if !self.get_delay.is_zero() {
            sleep(self.get_delay).await;
        }
        (self.responder)(index, elapsed)
    }

    async fn retry_step(&self, _run_id: &RunId, step: StepKey) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().retries.push(step);
        if !self.retry_delay.is_zero() {
            sleep(self.retry_delay).await;
        }
        if self.fail_retries {
            return Err(RemoteError::Http {
                status: 500,
                body: "worker unavailable".to_string(),
            });
        }
        Ok(())
    }

    async fn compile(&self, _run_id: &RunId, mode: CompileMode) -> Result<CompileAck, RemoteError> {
        self.calls.lock().unwrap().compiles.push(mode);
        Ok(self.compile_ack)
    }
}

const RUN: &str = "run-1";

fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        start_timeout: Duration::from_secs(60),
        command_timeout: Duration::from_secs(15),
        poll: PollConfig::default()
            .with_interval(Duration::from_secs(2))
            .with_long_step_interval(Duration::from_secs(5))
            .with_max_window(Duration::from_secs(30 * 60))
            .with_tick_timeout(Duration::from_secs(15)),
        max_manual_retries: None,
    }
}

fn coordinator(remote: &Arc<FakeRemote>) -> RunCoordinator {
    coordinator_with(remote, config())
}

fn coordinator_with(remote: &Arc<FakeRemote>, config: CoordinatorConfig) -> RunCoordinator {
    let remote: Arc<dyn RemotePipeline> = Arc::clone(remote) as Arc<dyn RemotePipeline>;
    RunCoordinator::new(remote, Arc::new(StepRegistry::standard()), config)
}

fn request() -> StartRunRequest {
    StartRunRequest::new("Deep sea vents", "en", 10)
}

fn running() -> PipelineRun {
    PipelineRun::new(RunId::new(RUN))
        .with_status(RunStatus::Running)
        .with_step(StepKey::Research, StepState::new(StepStatus::Running))
}

fn validation_failed(patch: bool) -> PipelineRun {
    let mut validation = ValidationResult::fail(vec![ValidationIssue::new("X1")]);
    if patch {
        validation = validation.with_patch(json!([{ "issue_id": "X1", "fix": "cite the survey" }]));
    }
    PipelineRun::new(RunId::new(RUN))
        .with_status(RunStatus::Running)
        .with_step(StepKey::Research, StepState::new(StepStatus::Done))
        .with_step(StepKey::Narrative, StepState::new(StepStatus::Done))
        .with_step(StepKey::Validation, StepState::new(StepStatus::Done))
        .with_validation(validation)
}

fn compilation_run(run_status: RunStatus, compile: StepStatus, video: Option<&str>) -> PipelineRun {
    let outputs = RunOutputs {
        shot_plan: Some(ShotPlan {
            scenes: vec![ShotScene {
                scene_id: "s1".to_string(),
                details: Default::default(),
            }],
        }),
        narrated_audio: Some(NarratedAudio {
            files: vec!["narration_01.wav".to_string()],
        }),
        video_path: video.map(str::to_string),
        ..Default::default()
    };
    PipelineRun::new(RunId::new(RUN))
        .with_status(run_status)
        .with_step(StepKey::CompilationBuilder, StepState::new(compile))
        .with_outputs(outputs)
}

mod synchronizer {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_runs_one_loop() {
        let remote = Arc::new(FakeRemote::fixed(running()));
        let sync = Synchronizer::new(
            Arc::clone(&remote) as Arc<dyn RemotePipeline>,
            Arc::new(RunMirror::new()),
            Arc::new(StepRegistry::standard()),
            config().poll,
        );
        let run_id = RunId::new(RUN);

        assert!(sync.start(&run_id, WatchScope::Run));
        assert!(!sync.start(&run_id, WatchScope::Run));
        assert_eq!(sync.loops_started(), 1);

        // Ticks every 2s (research is long-running: 5s) never overlap.
        sleep(Duration::from_secs(20)).await;
        assert!(sync.is_polling());
        let count = remote.get_count();
        assert!((4..=6).contains(&count), "unexpected fetch count {count}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_on_polled_run_keeps_live_scope() {
        let remote = Arc::new(FakeRemote::fixed(running()));
        let sync = Synchronizer::new(
            Arc::clone(&remote) as Arc<dyn RemotePipeline>,
            Arc::new(RunMirror::new()),
            Arc::new(StepRegistry::standard()),
            config().poll,
        );
        let run_id = RunId::new(RUN);

        assert!(sync.start(&run_id, WatchScope::Run));
        assert!(!sync.start_after(
            &run_id,
            WatchScope::Step(StepKey::CompilationBuilder),
            &running()
        ));
        match sync.status() {
            SyncStatus::Polling {
                scope, generation, ..
            } => {
                assert_eq!(scope, WatchScope::Run);
                assert_eq!(generation, 1);
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_starting_other_run_replaces_loop() {
        let remote = Arc::new(FakeRemote::fixed(running()));
        let sync = Synchronizer::new(
            Arc::clone(&remote) as Arc<dyn RemotePipeline>,
            Arc::new(RunMirror::new()),
            Arc::new(StepRegistry::standard()),
            config().poll,
        );
        assert!(sync.start(&RunId::new(RUN), WatchScope::Run));
        assert!(sync.start(&RunId::new("run-2"), WatchScope::Run));
        assert_eq!(sync.loops_started(), 2);
        assert_eq!(sync.active_run(), Some(RunId::new("run-2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let remote = Arc::new(FakeRemote::fixed(running()));
        let sync = Synchronizer::new(
            Arc::clone(&remote) as Arc<dyn RemotePipeline>,
            Arc::new(RunMirror::new()),
            Arc::new(StepRegistry::standard()),
            config().poll,
        );
        sync.stop();
        sync.start(&RunId::new(RUN), WatchScope::Run);
        sync.stop();
        sync.stop();
        assert_eq!(sync.status(), SyncStatus::Idle);
        assert_eq!(sync.wait().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_fetch() {
        let remote = Arc::new(FakeRemote::fixed(running()).with_get_delay(Duration::from_secs(5)));
        let mirror = Arc::new(RunMirror::new());
        let sync = Synchronizer::new(
            Arc::clone(&remote) as Arc<dyn RemotePipeline>,
            Arc::clone(&mirror),
            Arc::new(StepRegistry::standard()),
            config().poll,
        );
        sync.start(&RunId::new(RUN), WatchScope::Run);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(remote.get_count(), 1);

        sync.stop();
        sleep(Duration::from_secs(30)).await;
        assert!(mirror.current().is_none());
        assert_eq!(remote.get_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_keep_polling() {
        let remote = Arc::new(FakeRemote::new(RUN, |index, _| {
            if index < 3 {
                Err(RemoteError::Http {
                    status: 503,
                    body: "busy".to_string(),
                })
            } else {
                Ok(PipelineRun::new(RunId::new(RUN)).with_status(RunStatus::Done))
            }
        }));
        let coordinator = coordinator(&remote);
        coordinator.start_run(request()).await.unwrap();

        assert_eq!(
            coordinator.wait().await,
            Some(SyncOutcome::Finished(RunStatus::Done))
        );
        assert_eq!(remote.get_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_failure_ends_polling() {
        let remote = Arc::new(FakeRemote::new(RUN, |_, _| {
            Err(RemoteError::Http {
                status: 404,
                body: "no such run".to_string(),
            })
        }));
        let coordinator = coordinator(&remote);
        coordinator.start_run(request()).await.unwrap();

        match coordinator.wait().await {
            Some(SyncOutcome::Failed { error }) => assert!(error.contains("404")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(remote.get_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_times_out_once_after_one_final_fetch() {
        let remote = Arc::new(FakeRemote::fixed(running()));
        let coordinator = coordinator(&remote);
        let started = Instant::now();
        coordinator.start_run(request()).await.unwrap();

        let outcome = coordinator.wait().await;
        match outcome {
            Some(SyncOutcome::TimedOut { elapsed }) => {
                assert!(elapsed >= Duration::from_secs(30 * 60))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let window_end = started + Duration::from_secs(30 * 60);
        let after_window = remote
            .get_times()
            .into_iter()
            .filter(|t| *t >= window_end)
            .count();
        assert_eq!(after_window, 1);
        assert!(!coordinator.is_polling());

        // The outcome is reported once; nothing else is fetched afterwards.
        let fetched = remote.get_count();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(remote.get_count(), fetched);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_fetch_honors_done() {
        let window = Duration::from_secs(30 * 60);
        let remote = Arc::new(FakeRemote::new(RUN, move |_, elapsed| {
            if elapsed >= window {
                Ok(PipelineRun::new(RunId::new(RUN)).with_status(RunStatus::Done))
            } else {
                Ok(running())
            }
        }));
        let coordinator = coordinator(&remote);
        coordinator.start_run(request()).await.unwrap();

        assert_eq!(
            coordinator.wait().await,
            Some(SyncOutcome::Finished(RunStatus::Done))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_run_can_resume() {
        let mut config = config();
        config.poll = config.poll.with_max_window(Duration::from_secs(10));
        let remote = Arc::new(FakeRemote::fixed(running()));
        let coordinator = coordinator_with(&remote, config);
        let handle = coordinator.start_run(request()).await.unwrap();

        assert!(matches!(
            coordinator.wait().await,
            Some(SyncOutcome::TimedOut { .. })
        ));
        assert!(coordinator.resume(&handle));
        assert!(coordinator.is_polling());
    }
}

mod scenarios {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_validation_fail_blocks_packaging_and_requires_manual_fix() {
        let remote = Arc::new(FakeRemote::fixed(validation_failed(false)));
        let coordinator = coordinator(&remote);
        let handle = coordinator.start_run(request()).await.unwrap();
        coordinator.refresh(&handle).await.unwrap();

        let view = coordinator.view().unwrap();
        let packaging = view.step(StepKey::Packaging).unwrap();
        assert!(!packaging.eligible);
        assert!(
            packaging
                .blocked_reason
                .as_deref()
                .unwrap()
                .contains("validation FAIL")
        );
        assert!(view.step(StepKey::Narrative).unwrap().manual_fix_required);

        let err = coordinator
            .retry_step(&handle, StepKey::Narrative, RetryTrigger::Automatic)
            .await
            .unwrap_err();
        match err {
            CoordinatorError::RetryRejected {
                step,
                reason,
                manual_fix_required,
                ..
            } => {
                assert_eq!(step, StepKey::Narrative);
                assert_eq!(reason, RetryRejection::ManualFixRequired);
                assert!(manual_fix_required);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(remote.retries().is_empty());

        // An operator can still ask for the rewrite.
        let remediation = coordinator
            .retry_step(&handle, StepKey::Narrative, RetryTrigger::Operator)
            .await
            .unwrap();
        assert_eq!(remediation, Remediation::Rewrite);
        assert_eq!(remote.retries(), vec![StepKey::Narrative]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_patch_instructions_allow_two_automatic_rewrites() {
        let remote = Arc::new(FakeRemote::fixed(validation_failed(true)));
        let coordinator = coordinator(&remote);
        let handle = coordinator.start_run(request()).await.unwrap();

        for _ in 0..2 {
            let remediation = coordinator
                .retry_step(&handle, StepKey::Narrative, RetryTrigger::Automatic)
                .await
                .unwrap();
            assert_eq!(remediation, Remediation::Rewrite);
        }
        let err = coordinator
            .retry_step(&handle, StepKey::Narrative, RetryTrigger::Automatic)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::RetryRejected {
                attempts_remaining: 0,
                manual_fix_required: true,
                ..
            }
        ));
        assert_eq!(remote.retries().len(), 2);

        let view = coordinator.view().unwrap();
        let narrative = view.step(StepKey::Narrative).unwrap();
        assert_eq!(narrative.attempts_used, 2);
        assert!(narrative.manual_fix_required);
    }

    #[tokio::test(start_paused = true)]
    async fn test_compile_conflict_observes_until_done() {
        let remote = Arc::new(
            FakeRemote::new(RUN, |index, _| {
                if index < 3 {
                    Ok(compilation_run(RunStatus::Running, StepStatus::Running, None))
                } else {
                    Ok(compilation_run(
                        RunStatus::Done,
                        StepStatus::Done,
                        Some("/renders/run-1/final.mp4"),
                    ))
                }
            })
            .with_compile_ack(CompileAck::Conflict),
        );
        let coordinator = coordinator(&remote);
        let handle = coordinator.start_run(request()).await.unwrap();

        let outcome = coordinator
            .request_compilation(&handle, CompileMode::Full)
            .await
            .unwrap();
        assert_eq!(outcome, CompileOutcome::AlreadyRunning);
        assert_eq!(remote.compiles(), vec![CompileMode::Full]);

        assert_eq!(
            coordinator.wait().await,
            Some(SyncOutcome::Finished(RunStatus::Done))
        );
        let view = coordinator.view().unwrap();
        assert_eq!(view.video_path.as_deref(), Some("/renders/run-1/final.mp4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compile_allowed_and_observed_while_run_is_in_error() {
        let remote = Arc::new(
            FakeRemote::new(RUN, |index, _| {
                if index < 2 {
                    Ok(compilation_run(RunStatus::Error, StepStatus::Running, None))
                } else {
                    Ok(compilation_run(
                        RunStatus::Error,
                        StepStatus::Done,
                        Some("/renders/run-1/preview.mp4"),
                    ))
                }
            })
            .with_compile_ack(CompileAck::Conflict),
        );
        let coordinator = coordinator(&remote);
        let handle = RunHandle::new(RunId::new(RUN));

        // A terminal run is mirrored but not polled.
        coordinator.attach(&handle).await.unwrap();
        assert!(!coordinator.is_polling());

        let outcome = coordinator
            .request_compilation(&handle, CompileMode::Preview)
            .await
            .unwrap();
        assert_eq!(outcome, CompileOutcome::AlreadyRunning);
        assert!(coordinator.is_polling());

        assert_eq!(
            coordinator.wait().await,
            Some(SyncOutcome::Finished(StepStatus::Done))
        );
        assert_eq!(
            coordinator.view().unwrap().video_path.as_deref(),
            Some("/renders/run-1/preview.mp4")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_compile_waits_past_previous_compile_error() {
        let remote = Arc::new(FakeRemote::new(RUN, |index, _| match index {
            0 | 1 => Ok(compilation_run(RunStatus::Error, StepStatus::Error, None)),
            2 => Ok(compilation_run(RunStatus::Running, StepStatus::Running, None)),
            _ => Ok(compilation_run(
                RunStatus::Done,
                StepStatus::Done,
                Some("/renders/run-1/final.mp4"),
            )),
        }));
        let coordinator = coordinator(&remote);
        let handle = RunHandle::new(RunId::new(RUN));
        coordinator.attach(&handle).await.unwrap();
        assert!(!coordinator.is_polling());

        let outcome = coordinator
            .request_compilation(&handle, CompileMode::Full)
            .await
            .unwrap();
        assert_eq!(outcome, CompileOutcome::Started);

        // The first tick still shows the earlier failure; only the new compile counts.
        assert_eq!(
            coordinator.wait().await,
            Some(SyncOutcome::Finished(RunStatus::Done))
        );
        assert_eq!(remote.get_count(), 4);
        assert_eq!(
            coordinator.view().unwrap().video_path.as_deref(),
            Some("/renders/run-1/final.mp4")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recompile_finishing_between_polls_is_seen_by_new_video() {
        let remote = Arc::new(FakeRemote::new(RUN, |index, _| {
            let video = if index < 2 {
                "/renders/run-1/take-1.mp4"
            } else {
                "/renders/run-1/take-2.mp4"
            };
            Ok(compilation_run(RunStatus::Done, StepStatus::Done, Some(video)))
        }));
        let coordinator = coordinator(&remote);
        let handle = RunHandle::new(RunId::new(RUN));
        coordinator.attach(&handle).await.unwrap();

        coordinator
            .request_compilation(&handle, CompileMode::Preview)
            .await
            .unwrap();
        assert_eq!(
            coordinator.wait().await,
            Some(SyncOutcome::Finished(RunStatus::Done))
        );
        assert_eq!(remote.get_count(), 3);
        assert_eq!(
            coordinator.view().unwrap().video_path.as_deref(),
            Some("/renders/run-1/take-2.mp4")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_compile_refused_until_ready() {
        let run = PipelineRun::new(RunId::new(RUN))
            .with_status(RunStatus::Running)
            .with_outputs(RunOutputs {
                shot_plan: Some(ShotPlan {
                    scenes: vec![ShotScene {
                        scene_id: "s1".to_string(),
                        details: Default::default(),
                    }],
                }),
                ..Default::default()
            });
        let remote = Arc::new(FakeRemote::fixed(run));
        let coordinator = coordinator(&remote);
        let handle = coordinator.start_run(request()).await.unwrap();

        let err = coordinator
            .request_compilation(&handle, CompileMode::Full)
            .await
            .unwrap_err();
        match err {
            CoordinatorError::CompilationNotReady { missing } => {
                assert_eq!(missing, vec!["narrated audio".to_string()])
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(remote.compiles().is_empty());
    }
}

mod commands {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_is_fatal_and_not_retried() {
        let remote = Arc::new(FakeRemote::fixed(running()).failing_start());
        let coordinator = coordinator(&remote);

        let err = coordinator.start_run(request()).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::StartFailed(_)));
        assert_eq!(remote.starts(), 1);
        assert!(!coordinator.is_polling());
        assert_eq!(remote.get_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_of_errored_step_restarts_polling() {
        let run = PipelineRun::new(RunId::new(RUN))
            .with_status(RunStatus::Error)
            .with_step(StepKey::Research, StepState::failed("source archive timed out"));
        let remote = Arc::new(FakeRemote::fixed(run));
        let coordinator = coordinator(&remote);
        let handle = RunHandle::new(RunId::new(RUN));
        coordinator.attach(&handle).await.unwrap();
        assert!(!coordinator.is_polling());

        let remediation = coordinator
            .retry_step(&handle, StepKey::Research, RetryTrigger::Automatic)
            .await
            .unwrap();
        assert_eq!(remediation, Remediation::Rerun);
        assert_eq!(remote.retries(), vec![StepKey::Research]);
        assert_eq!(coordinator.poll_loops_started(), 1);

        // Research allows a single automatic attempt.
        let err = coordinator
            .retry_step(&handle, StepKey::Research, RetryTrigger::Automatic)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::RetryRejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_past_error_from_before_the_retry() {
        let remote = Arc::new(FakeRemote::new(RUN, |index, _| match index {
            0 | 1 => Ok(PipelineRun::new(RunId::new(RUN))
                .with_status(RunStatus::Error)
                .with_step(StepKey::Research, StepState::failed("source archive timed out"))),
            2 => Ok(running()),
            _ => Ok(PipelineRun::new(RunId::new(RUN))
                .with_status(RunStatus::Done)
                .with_step(StepKey::Research, StepState::new(StepStatus::Done))),
        }));
        let coordinator = coordinator(&remote);
        let handle = RunHandle::new(RunId::new(RUN));
        coordinator.attach(&handle).await.unwrap();

        coordinator
            .retry_step(&handle, StepKey::Research, RetryTrigger::Automatic)
            .await
            .unwrap();
        assert_eq!(
            coordinator.wait().await,
            Some(SyncOutcome::Finished(RunStatus::Done))
        );
        assert_eq!(remote.get_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_automatic_retries_stay_within_budget() {
        let remote = Arc::new(
            FakeRemote::fixed(validation_failed(true)).with_retry_delay(Duration::from_millis(200)),
        );
        let coordinator = coordinator(&remote);
        let handle = RunHandle::new(RunId::new(RUN));
        coordinator.attach(&handle).await.unwrap();

        let (a, b, c) = tokio::join!(
            coordinator.retry_step(&handle, StepKey::Narrative, RetryTrigger::Automatic),
            coordinator.retry_step(&handle, StepKey::Narrative, RetryTrigger::Automatic),
            coordinator.retry_step(&handle, StepKey::Narrative, RetryTrigger::Automatic),
        );
        let results = [a, b, c];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
        assert_eq!(remote.retries().len(), 2);
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(matches!(
                err,
                CoordinatorError::RetryRejected {
                    reason: RetryRejection::ManualFixRequired,
                    ..
                }
            ));
        }
        assert_eq!(
            coordinator.view().unwrap().step(StepKey::Narrative).unwrap().attempts_used,
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_counts_consume_local_budget() {
        let mut run = PipelineRun::new(RunId::new(RUN))
            .with_status(RunStatus::Error)
            .with_step(StepKey::FootageDirection, StepState::failed("no footage found"));
        run.attempts.insert(StepKey::FootageDirection, 1);
        let remote = Arc::new(FakeRemote::fixed(run));
        let coordinator = coordinator(&remote);
        let handle = RunHandle::new(RunId::new(RUN));
        coordinator.attach(&handle).await.unwrap();

        let err = coordinator
            .retry_step(&handle, StepKey::FootageDirection, RetryTrigger::Automatic)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::RetryRejected { .. }));
        assert!(remote.retries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_remote_retry_carries_budget_context() {
        let run = PipelineRun::new(RunId::new(RUN))
            .with_status(RunStatus::Error)
            .with_step(StepKey::Packaging, StepState::failed("layout overflow"));
        let remote = Arc::new(FakeRemote::fixed(run).failing_retries());
        let coordinator = coordinator(&remote);
        let handle = RunHandle::new(RunId::new(RUN));
        coordinator.attach(&handle).await.unwrap();

        let err = coordinator
            .retry_step(&handle, StepKey::Packaging, RetryTrigger::Automatic)
            .await
            .unwrap_err();
        match err {
            CoordinatorError::RetryFailed {
                step,
                attempts_remaining,
                manual_fix_required,
                ..
            } => {
                assert_eq!(step, StepKey::Packaging);
                assert_eq!(attempts_remaining, 1);
                assert!(!manual_fix_required);
            }
            other => panic!("unexpected error: {other}"),
        }

        // A failed call does not consume the budget.
        assert_eq!(
            coordinator.view().unwrap().step(StepKey::Packaging).unwrap().attempts_used,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_retry_ceiling() {
        let run = PipelineRun::new(RunId::new(RUN))
            .with_status(RunStatus::Error)
            .with_step(StepKey::AssetResolution, StepState::failed("license check failed"));
        let remote = Arc::new(FakeRemote::fixed(run));
        let mut config = config();
        config.max_manual_retries = Some(1);
        let coordinator = coordinator_with(&remote, config);
        let handle = RunHandle::new(RunId::new(RUN));
        coordinator.attach(&handle).await.unwrap();

        coordinator
            .retry_step(&handle, StepKey::AssetResolution, RetryTrigger::Operator)
            .await
            .unwrap();
        let err = coordinator
            .retry_step(&handle, StepKey::AssetResolution, RetryTrigger::Operator)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::RetryRejected {
                reason: RetryRejection::ManualLimitReached { limit: 1 },
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_local_state_only() {
        let remote = Arc::new(FakeRemote::fixed(running()));
        let coordinator = coordinator(&remote);
        let handle = coordinator.start_run(request()).await.unwrap();
        coordinator.refresh(&handle).await.unwrap();
        assert!(coordinator.current().is_some());

        coordinator.reset();
        assert!(!coordinator.is_polling());
        assert!(coordinator.current().is_none());
        assert!(coordinator.view().is_none());
        assert_eq!(remote.starts(), 1);
        assert!(remote.retries().is_empty());
        assert!(remote.compiles().is_empty());

        let err = coordinator
            .retry_step(&handle, StepKey::Research, RetryTrigger::Operator)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::NoActiveRun));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_for_other_run_is_rejected() {
        let remote = Arc::new(FakeRemote::fixed(running()));
        let coordinator = coordinator(&remote);
        let handle = coordinator.start_run(request()).await.unwrap();
        coordinator.refresh(&handle).await.unwrap();

        let stranger = RunHandle::new(RunId::new("run-99"));
        let err = coordinator
            .request_compilation(&stranger, CompileMode::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::RunMismatch { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsaved_changes_against_start_settings() {
        let remote = Arc::new(FakeRemote::fixed(running()));
        let coordinator = coordinator(&remote);

        let mut voice = StepSettings::new();
        voice.insert("voice".to_string(), json!("narrator-1"));
        voice.insert("speed".to_string(), json!(1.0));
        coordinator
            .start_run(request().with_step_settings(StepKey::SpeechFormatting, voice.clone()))
            .await
            .unwrap();

        let mut edited = voice;
        edited.insert("speed".to_string(), json!(1.1));
        let current = BTreeMap::from([(StepKey::SpeechFormatting, edited)]);
        let changes = coordinator.unsaved_changes(&current);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "speed");

        coordinator.reset();
        assert!(coordinator.unsaved_changes(&current).is_empty());
    }
}
