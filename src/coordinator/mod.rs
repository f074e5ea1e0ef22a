//! Effectful half of the coordinator: the mirror, the synchronizer that feeds it, and
//! the [`RunCoordinator`] facade in front of both.

pub mod facade;
pub mod mirror;
pub mod synchronizer;
pub mod view;

pub use facade::{CompileOutcome, CoordinatorConfig, RunCoordinator, RunHandle};
pub use mirror::{FetchTicket, IngestOutcome, MirrorState, RunMirror};
pub use synchronizer::{PollConfig, SyncOutcome, SyncStatus, Synchronizer, WatchScope};
pub use view::{RunView, StepView, ValidationSummary};
