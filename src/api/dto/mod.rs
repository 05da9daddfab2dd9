pub mod command;
pub mod execution;
pub mod playbook;
pub mod server;
