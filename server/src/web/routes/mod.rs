mod attempts;
mod files;
mod packages;
mod status;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::routing::post;
use qpy_protocol::MIB;
use qpy_protocol::PackageLocation;
use tower_http::trace::TraceLayer;

use super::error::WebError;
use crate::app::AppState;
use crate::package::Package;
use crate::worker::pool::WorkerLease;

pub fn router(state: AppState) -> Router {
    // Our pipeline enforces the per-part caps; the outer limit only has to
    // admit the largest legal body (package + main + question state).
    let body_limit = (state.settings.webservice.max_package_size + 8 * MIB) as usize;

    Router::new()
        .route("/status", get(status::get_status))
        .route("/packages", get(packages::get_packages))
        .route("/packages/:package_hash", get(packages::get_package))
        .route("/package-extract-info", post(packages::package_extract_info))
        .route("/packages/:package_hash/options", post(packages::post_options))
        .route("/packages/:package_hash/question", post(packages::post_question))
        .route(
            "/packages/:package_hash/attempt/start",
            post(attempts::post_attempt_start),
        )
        .route(
            "/packages/:package_hash/attempt/view",
            post(attempts::post_attempt_view),
        )
        .route(
            "/packages/:package_hash/attempt/score",
            post(attempts::post_attempt_score),
        )
        .route(
            "/packages/:package_hash/file/:namespace/:short_name/*path",
            post(files::serve_static_file),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Checks a worker out of the pool for one exchange against `package`.
pub(crate) async fn acquire_package_worker(
    state: &AppState,
    package: &Package,
) -> Result<WorkerLease, WebError> {
    let path = state.packages.get_path(package).await?;
    Ok(state.pool.acquire(PackageLocation::zip(path)).await?)
}
