//! Request body handling shared by all package-scoped routes.
//!
//! A body is either one JSON document (the `main` part) or
//! `multipart/form-data` with up to three recognized parts: `main`,
//! `package` (hashed while read) and `question_state`. Each part has its own
//! byte cap; exceeding one is a 413. Unknown parts are skipped. The three
//! checks handlers compose — main body, question state, package — are
//! independent of each other.

use axum::extract::FromRequest;
use axum::extract::Multipart;
use axum::extract::Request;
use axum::http::header;
use bytes::Bytes;
use serde::de::DeserializeOwned;

use super::error::WebError;
use crate::app::AppState;
use crate::hash::HashContainer;
use crate::package::Package;
use crate::web::models::NotFoundStatusWhat;
use qpy_protocol::MAX_QUESTION_STATE_SIZE;

#[derive(Default)]
pub struct BodyParts {
    pub main: Option<Bytes>,
    pub package: Option<HashContainer>,
    pub question_state: Option<Bytes>,
}

/// Reads and caps the request body once; handlers pick the parts they need.
pub async fn read_body_parts(
    state: &AppState,
    request: Request,
) -> Result<BodyParts, WebError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|err| WebError::InvalidRequest {
                reason: format!("invalid multipart body: {err}"),
            })?;
        return parse_form_data(state, multipart).await;
    }

    if content_type.starts_with("application/json") {
        let max_main_size = state.settings.webservice.max_main_size();
        let body = axum::body::to_bytes(request.into_body(), max_main_size as usize)
            .await
            .map_err(|_| WebError::PayloadTooLarge {
                max_size: max_main_size,
            })?;
        return Ok(BodyParts {
            main: Some(body),
            ..BodyParts::default()
        });
    }

    if content_type.is_empty() {
        // No body sent at all.
        return Ok(BodyParts::default());
    }

    Err(WebError::UnsupportedMediaType { content_type })
}

async fn parse_form_data(
    state: &AppState,
    mut multipart: Multipart,
) -> Result<BodyParts, WebError> {
    let mut parts = BodyParts::default();

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        WebError::InvalidRequest {
            reason: format!("invalid multipart body: {err}"),
        }
    })? {
        match field.name() {
            Some("main") => {
                let bytes =
                    read_field(field, state.settings.webservice.max_main_size()).await?;
                parts.main = Some(bytes);
            }
            Some("package") => {
                let bytes =
                    read_field(field, state.settings.webservice.max_package_size).await?;
                parts.package = Some(HashContainer::new(bytes));
            }
            Some("question_state") => {
                let bytes = read_field(field, MAX_QUESTION_STATE_SIZE).await?;
                parts.question_state = Some(bytes);
            }
            // Unknown parts are skipped.
            _ => {}
        }
    }

    Ok(parts)
}

async fn read_field(
    mut field: axum::extract::multipart::Field<'_>,
    max_size: u64,
) -> Result<Bytes, WebError> {
    let mut data = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(|err| WebError::InvalidRequest {
        reason: format!("failed to read a body part: {err}"),
    })? {
        if (data.len() + chunk.len()) as u64 > max_size {
            return Err(WebError::PayloadTooLarge { max_size });
        }
        data.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(data))
}

impl BodyParts {
    /// Parses the `main` part into the handler's envelope type.
    pub fn main_as<T: DeserializeOwned>(&self) -> Result<T, WebError> {
        let Some(main) = &self.main else {
            return Err(WebError::InvalidRequest {
                reason: "the main body is required but was not provided".to_string(),
            });
        };
        serde_json::from_slice(main).map_err(|err| WebError::InvalidRequest {
            reason: format!("invalid JSON body: {err}"),
        })
    }

    /// The question state, required.
    pub fn require_question_state(&self) -> Result<String, WebError> {
        match self.optional_question_state()? {
            Some(state) => Ok(state),
            None => Err(WebError::InvalidRequest {
                reason: "a question state part is required but was not provided".to_string(),
            }),
        }
    }

    pub fn optional_question_state(&self) -> Result<Option<String>, WebError> {
        self.question_state
            .as_ref()
            .map(|bytes| {
                String::from_utf8(bytes.to_vec()).map_err(|_| WebError::InvalidRequest {
                    reason: "the question state is not valid UTF-8".to_string(),
                })
            })
            .transpose()
    }
}

/// Resolves the package a request refers to.
///
/// Order: a URI hash with a body part must agree with it; a URI hash alone
/// is looked up in the index; a lone body part is accepted into the upload
/// collector. An unknown URI hash is a 404, a request naming no package at
/// all a 400.
pub async fn resolve_package(
    state: &AppState,
    uri_package_hash: Option<&str>,
    parts: &BodyParts,
) -> Result<std::sync::Arc<Package>, WebError> {
    if let (Some(uri_hash), Some(container)) = (uri_package_hash, &parts.package) {
        if uri_hash != container.hash {
            return Err(WebError::InvalidPackage {
                reason: format!(
                    "the request URI specifies a package with hash '{uri_hash}', but the sent \
                     package has a hash of '{}'",
                    container.hash
                ),
                temporary: false,
            });
        }
    }

    let mut package = None;
    if let Some(uri_hash) = uri_package_hash {
        package = state.packages.get(uri_hash);
    }

    if package.is_none() {
        if let Some(container) = &parts.package {
            if !state.settings.webservice.allow_lms_packages {
                return Err(WebError::InvalidRequest {
                    reason: "this server does not accept uploaded packages".to_string(),
                });
            }
            package = Some(state.packages.put(container).await?);
        }
    }

    match package {
        Some(package) => Ok(package),
        None if uri_package_hash.is_some() => Err(WebError::NotFound {
            what: NotFoundStatusWhat::Package,
        }),
        None => Err(WebError::InvalidRequest {
            reason: "the package is required but was not provided".to_string(),
        }),
    }
}
