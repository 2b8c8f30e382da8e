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
use crate::web::models::NotFoundStatusWhat;
use crate::web::models::PackageVersionInfo;
use crate::web::models::QuestionCreateArguments;
use crate::web::models::QuestionCreatedResponse;
use crate::web::models::QuestionEditFormResponse;
use crate::web::models::RequestBaseData;
use crate::web::pipeline::read_body_parts;
use crate::web::pipeline::resolve_package;

pub async fn get_packages(State(state): State<AppState>) -> Response {
    Json(state.packages.get_package_versions_infos()).into_response()
}

pub async fn get_package(
    State(state): State<AppState>,
    Path(package_hash): Path<String>,
) -> Result<Response, WebError> {
    let package = state
        .packages
        .get(&package_hash)
        .ok_or(WebError::NotFound {
            what: NotFoundStatusWhat::Package,
        })?;
    Ok(Json(PackageVersionInfo::from_package(&package)).into_response())
}

/// Accepts a bare package part and reports its manifest info without
/// dispatching anything to it beyond loading.
pub async fn package_extract_info(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, WebError> {
    let parts = read_body_parts(&state, request).await?;
    let package = resolve_package(&state, None, &parts).await?;
    Ok((
        StatusCode::CREATED,
        Json(PackageVersionInfo::from_package(&package)),
    )
        .into_response())
}

/// The options form a question creator uses to customize a question.
pub async fn post_options(
    State(state): State<AppState>,
    Path(package_hash): Path<String>,
    request: Request,
) -> Result<Response, WebError> {
    let parts = read_body_parts(&state, request).await?;
    let _data: RequestBaseData = parts.main_as()?;
    let question_state = parts.optional_question_state()?;
    let package = resolve_package(&state, Some(&package_hash), &parts).await?;

    let lease = acquire_package_worker(&state, &package).await?;
    let result = lease
        .worker()
        .get_options_form(RequestUser::new(["de", "en"]), question_state)
        .await;
    lease.release().await;

    let (definition, form_data) = result?;
    Ok(Json(QuestionEditFormResponse {
        definition,
        form_data,
    })
    .into_response())
}

pub async fn post_question(
    State(state): State<AppState>,
    Path(package_hash): Path<String>,
    request: Request,
) -> Result<Response, WebError> {
    let parts = read_body_parts(&state, request).await?;
    let data: QuestionCreateArguments = parts.main_as()?;
    let question_state = parts.optional_question_state()?;
    let package = resolve_package(&state, Some(&package_hash), &parts).await?;

    let lease = acquire_package_worker(&state, &package).await?;
    let result = lease
        .worker()
        .create_question(RequestUser::new(["de", "en"]), question_state, data.form_data)
        .await;
    lease.release().await;

    let created = result?;
    Ok(Json(QuestionCreatedResponse::from(created)).into_response())
}
