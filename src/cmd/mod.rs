//! CLI command implementations.
//!
//! | Module    | Commands handled                                          |
//! |-----------|-----------------------------------------------------------|
//! | `project` | `Init`, `Steps`                                           |
//! | `run`     | `Start`, `Status`, `Watch`, `Retry`, `Compile`, `Reset`   |
//! | `config`  | `Config`                                                  |

pub mod config;
pub mod project;
pub mod run;

pub use config::cmd_config;
pub use project::{cmd_init, cmd_steps};
pub use run::{StartOverrides, cmd_compile, cmd_reset, cmd_retry, cmd_start, cmd_status, cmd_watch};
