pub mod command;
pub mod execution;
pub mod health;
pub mod playbook;
pub mod server;
