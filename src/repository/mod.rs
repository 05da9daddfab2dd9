mod command_repository;
mod connection;
mod execution_repository;
mod playbook_repository;
mod server_repository;

pub use command_repository::CommandRepository;
pub use connection::establish_connection;
pub use execution_repository::{ExecutionFilter, ExecutionRepository};
pub use playbook_repository::PlaybookRepository;
pub use server_repository::{ServerFilter, ServerRepository};

pub type DbPool = sqlx::SqlitePool;

#[cfg(test)]
pub(crate) use connection::test_pool;
