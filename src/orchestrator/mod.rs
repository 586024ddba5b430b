pub mod engine;
pub mod prompt;
pub mod recovery;
pub mod registry;
pub mod slot;
pub mod testing;

pub use engine::{Collaborators, OrchestratorConfig, OrchestratorStatus, ProjectOrchestrator};
pub use recovery::RecoveryReport;
pub use registry::OrchestratorRegistry;
pub use slot::{Slot, SlotPhase};
pub use testing::{ShellTestRunner, TestOutcome, TestRunner};
