//! CLI command implementations.
//!
//! | Module    | Commands handled                                  |
//! |-----------|---------------------------------------------------|
//! | `project` | `Init`                                            |
//! | `run`     | `Run`, `Recover`                                  |
//! | `tasks`   | `Status`, `Ready`, `Add`, `Unblock`, `Feedback`, `Ask` |

pub mod project;
pub mod run;
pub mod tasks;

pub use project::cmd_init;
pub use run::{cmd_recover, cmd_run};
pub use tasks::{NewTaskArgs, cmd_add, cmd_ask, cmd_feedback, cmd_ready, cmd_status, cmd_unblock};
