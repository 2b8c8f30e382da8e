use axum::Json;
use axum::extract::Path;
use axum::extract::Request;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use qpy_protocol::RequestUser;

use super::acquire_package_worker;
use crate::app::AppState;
use crate::web::error::WebError;
use crate::web::models::AttemptScoreArguments;
use crate::web::models::AttemptStartArguments;
use crate::web::models::AttemptViewArguments;
use crate::web::pipeline::read_body_parts;
use crate::web::pipeline::resolve_package;

pub async fn post_attempt_start(
    State(state): State<AppState>,
    Path(package_hash): Path<String>,
    request: Request,
) -> Result<Response, WebError> {
    let parts = read_body_parts(&state, request).await?;
    let data: AttemptStartArguments = parts.main_as()?;
    let question_state = parts.require_question_state()?;
    let package = resolve_package(&state, Some(&package_hash), &parts).await?;

    let lease = acquire_package_worker(&state, &package).await?;
    let result = lease
        .worker()
        .start_attempt(RequestUser::new(["de", "en"]), question_state, data.variant)
        .await;
    lease.release().await;

    Ok((StatusCode::CREATED, Json(result?)).into_response())
}

pub async fn post_attempt_view(
    State(state): State<AppState>,
    Path(package_hash): Path<String>,
    request: Request,
) -> Result<Response, WebError> {
    let parts = read_body_parts(&state, request).await?;
    let data: AttemptViewArguments = parts.main_as()?;
    let question_state = parts.require_question_state()?;
    let package = resolve_package(&state, Some(&package_hash), &parts).await?;

    let lease = acquire_package_worker(&state, &package).await?;
    let result = lease
        .worker()
        .view_attempt(
            RequestUser::new(["de", "en"]),
            question_state,
            data.attempt_state,
            data.scoring_state,
            data.response,
        )
        .await;
    lease.release().await;

    Ok((StatusCode::CREATED, Json(result?)).into_response())
}

pub async fn post_attempt_score(
    State(state): State<AppState>,
    Path(package_hash): Path<String>,
    request: Request,
) -> Result<Response, WebError> {
    let parts = read_body_parts(&state, request).await?;
    let data: AttemptScoreArguments = parts.main_as()?;
    let question_state = parts.require_question_state()?;
    let package = resolve_package(&state, Some(&package_hash), &parts).await?;

    let lease = acquire_package_worker(&state, &package).await?;
    let result = lease
        .worker()
        .score_attempt(
            RequestUser::new(["de", "en"]),
            question_state,
            data.attempt_state,
            data.scoring_state,
            data.response,
        )
        .await;
    lease.release().await;

    Ok((StatusCode::CREATED, Json(result?)).into_response())
}
