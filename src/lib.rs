pub mod coordinator;
pub mod errors;
pub mod logging;
pub mod pipeline;
pub mod reel_config;
pub mod remote;
pub mod session;
pub mod ui;

pub use coordinator::{CompileOutcome, RunCoordinator, RunHandle, RunView, SyncOutcome};
pub use errors::{CoordinatorError, RemoteError};
