//! The remote pipeline service, seen as four opaque operations.
//!
//! [`RemotePipeline`] is the seam between the coordinator and the network. The real
//! implementation is [`HttpRemote`]; tests substitute an in-memory fake.

mod http;

pub use http::HttpRemote;

use crate::errors::RemoteError;
use async_trait::async_trait;
use reelforge_common::{CompileMode, PipelineRun, RunId, StartRunRequest, StepKey};

/// Acknowledgment of a compile request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileAck {
    Accepted,
    /// A compilation is already underway for this run.
    Conflict,
}

/// Abstraction over the remote pipeline service.
#[async_trait]
pub trait RemotePipeline: Send + Sync {
    async fn start_run(&self, request: &StartRunRequest) -> Result<RunId, RemoteError>;

    async fn get_state(&self, run_id: &RunId) -> Result<PipelineRun, RemoteError>;

    async fn retry_step(&self, run_id: &RunId, step: StepKey) -> Result<(), RemoteError>;

    async fn compile(&self, run_id: &RunId, mode: CompileMode) -> Result<CompileAck, RemoteError>;
}
