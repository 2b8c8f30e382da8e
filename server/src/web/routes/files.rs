use axum::extract::Path;
use axum::extract::Request;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;

use super::acquire_package_worker;
use crate::app::AppState;
use crate::web::error::WebError;
use crate::web::pipeline::read_body_parts;
use crate::web::pipeline::resolve_package;

/// One year; with the package hash in the URL, cache busting is automatic.
const CACHE_CONTROL: &str = "public, immutable, max-age=31536000";

pub async fn serve_static_file(
    State(state): State<AppState>,
    Path((package_hash, namespace, short_name, path)): Path<(String, String, String, String)>,
    request: Request,
) -> Result<Response, WebError> {
    if !path.starts_with("static/") {
        return Err(WebError::StaticFileNotFound);
    }

    let parts = read_body_parts(&state, request).await?;
    let package = resolve_package(&state, Some(&package_hash), &parts).await?;

    if package.manifest().namespace != namespace || package.manifest().short_name != short_name {
        // Static files of non-main packages would need the identifier to
        // select among loaded packages, which no worker message carries yet.
        return Ok((
            StatusCode::NOT_IMPLEMENTED,
            "Static file retrieval from non-main packages is not supported yet.",
        )
            .into_response());
    }

    let lease = acquire_package_worker(&state, &package).await?;
    let result = lease.worker().get_static_file(&path).await;
    lease.release().await;
    let file = result?;

    let mut response = file.data.into_response();
    if let Some(mime_type) = &file.mime_type {
        if let Ok(value) = header::HeaderValue::from_str(mime_type) {
            response.headers_mut().insert(header::CONTENT_TYPE, value);
        }
    }
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static(CACHE_CONTROL),
    );
    Ok(response)
}
