pub mod command_service;
pub mod dispatcher;
pub mod execution_service;
pub mod health_monitor;
pub mod inventory_service;
pub mod ledger;
pub mod playbook_service;
pub mod resolver;
pub mod templates;

pub use command_service::{CommandInput, CommandService};
pub use dispatcher::Dispatcher;
pub use execution_service::{ExecutionRequest, ExecutionService};
pub use health_monitor::{HealthMonitor, ProbeOutcome, ServerInfo};
pub use inventory_service::{InventoryService, ServerInput};
pub use ledger::ExecutionLedger;
pub use playbook_service::{PlaybookInput, PlaybookService, ValidationReport};
pub use resolver::WorkUnitResolver;
