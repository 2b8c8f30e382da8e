use axum::Json;
use axum::extract::State;

use crate::app::AppState;
use crate::web::models::ServerStatus;
use crate::web::models::Usage;

pub async fn get_status(State(state): State<AppState>) -> Json<ServerStatus> {
    Json(ServerStatus {
        name: "qpy-server".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        allow_lms_packages: state.settings.webservice.allow_lms_packages,
        max_package_size: state.settings.webservice.max_package_size,
        usage: Usage {
            requests_in_process: state.pool.requests_in_process(),
            requests_in_queue: state.pool.requests_in_queue(),
        },
    })
}
