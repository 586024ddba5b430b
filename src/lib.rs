pub mod archive;
pub mod backoff;
pub mod config;
pub mod errors;
pub mod events;
pub mod git;
pub mod init;
pub mod lock;
pub mod merge;
pub mod orchestrator;
pub mod snapshot;
pub mod telemetry;
pub mod timer;
pub mod tracker;
pub mod worker;
