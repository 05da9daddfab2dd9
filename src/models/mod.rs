pub mod command;
pub mod execution;
pub mod playbook;
pub mod server;
pub mod unit;

pub use command::Command;
pub use execution::{
    Execution, ExecutionStatus, ExecutionSummary, ExecutionType, TargetCounts, TargetResult,
    TargetStatus,
};
pub use playbook::{Playbook, PlaybookStep};
pub use server::{Server, ServerStatus};
pub use unit::{MAX_STEP_TIMEOUT_SECS, ResolvedStep, ResolvedUnit};
