use super::handlers::{command, execution, health, playbook, server};
use super::middleware::cors::add_cors;
use crate::services::{
    CommandService, ExecutionService, HealthMonitor, InventoryService, PlaybookService,
};
use axum::{
    Router,
    routing::{get, post},
};

#[derive(Clone)]
pub struct AppState {
    pub inventory_service: InventoryService,
    pub health_monitor: HealthMonitor,
    pub command_service: CommandService,
    pub playbook_service: PlaybookService,
    pub execution_service: ExecutionService,
}

pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Inventory
        .route(
            "/api/servers",
            get(server::list_servers).post(server::create_server),
        )
        .route(
            "/api/servers/{id}",
            get(server::get_server)
                .put(server::update_server)
                .delete(server::delete_server),
        )
        .route("/api/servers/{id}/ping", post(server::ping_server))
        .route("/api/servers/{id}/info", get(server::server_info))
        // Commands
        .route(
            "/api/commands",
            get(command::list_commands).post(command::create_command),
        )
        .route(
            "/api/commands/{id}",
            get(command::get_command)
                .put(command::update_command)
                .delete(command::delete_command),
        )
        .route("/api/commands/{id}/execute", post(command::execute_command))
        // Playbooks
        .route(
            "/api/playbooks",
            get(playbook::list_playbooks).post(playbook::create_playbook),
        )
        .route("/api/playbooks/templates", get(playbook::list_templates))
        .route(
            "/api/playbooks/{id}",
            get(playbook::get_playbook)
                .put(playbook::update_playbook)
                .delete(playbook::delete_playbook),
        )
        .route("/api/playbooks/{id}/execute", post(playbook::execute_playbook))
        .route("/api/playbooks/{id}/validate", post(playbook::validate_playbook))
        // Executions
        .route("/api/executions", get(execution::list_executions))
        .route("/api/executions/{id}", get(execution::get_execution))
        .route("/api/executions/{id}/cancel", post(execution::cancel_execution))
        .with_state(state);

    add_cors(api_routes)
}
