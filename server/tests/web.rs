//! End-to-end tests of the HTTP surface, driven through the router with
//! in-process thread workers.

use std::io::Write;
use std::path::Path;

use axum::Router;
use axum::body::Body;
use axum::http::Request;
use axum::http::StatusCode;
use axum::http::header;
use pretty_assertions::assert_eq;
use qpy_server::app::App;
use qpy_server::hash::hash_bytes;
use qpy_server::settings::Settings;
use qpy_server::settings::WorkerKind;
use qpy_worker::QuestionType;
use qpy_worker::QuestionTypeError;
use serde_json::json;
use tower::ServiceExt;

const BOUNDARY: &str = "qpy-test-boundary";

type FormData = serde_json::Map<String, serde_json::Value>;

struct EchoQuestionType;

impl QuestionType for EchoQuestionType {
    fn options_form(
        &mut self,
        question_state: Option<&str>,
        _request_user: &qpy_protocol::RequestUser,
    ) -> Result<(qpy_protocol::OptionsFormDefinition, FormData), QuestionTypeError> {
        let mut form_data = FormData::new();
        if let Some(state) = question_state {
            form_data.insert("previous_state".to_string(), state.into());
        }
        Ok((
            qpy_protocol::OptionsFormDefinition {
                general: vec![qpy_protocol::FormElement::Input(
                    qpy_protocol::TextInputElement {
                        name: "prompt".to_string(),
                        label: "Prompt".to_string(),
                        required: true,
                        default: None,
                        placeholder: None,
                    },
                )],
                sections: Vec::new(),
            },
            form_data,
        ))
    }

    fn create_question(
        &mut self,
        _old_state: Option<&str>,
        form_data: &FormData,
        _request_user: &qpy_protocol::RequestUser,
    ) -> Result<(String, qpy_protocol::QuestionModel), QuestionTypeError> {
        Ok((
            serde_json::to_string(form_data).map_err(|e| QuestionTypeError::Other(e.to_string()))?,
            qpy_protocol::QuestionModel::manual(),
        ))
    }

    fn start_attempt(
        &mut self,
        _question_state: &str,
        variant: u32,
        _request_user: &qpy_protocol::RequestUser,
    ) -> Result<qpy_protocol::AttemptStartedModel, QuestionTypeError> {
        Ok(qpy_protocol::AttemptStartedModel {
            attempt: qpy_protocol::AttemptModel {
                lang: Some("en".to_string()),
                variant,
                ui: qpy_protocol::AttemptUi::formulation("<p>echo</p>"),
            },
            attempt_state: "attempt-state".to_string(),
        })
    }

    fn view_attempt(
        &mut self,
        _question_state: &str,
        _attempt_state: &str,
        _scoring_state: Option<&str>,
        _response: Option<&FormData>,
        _request_user: &qpy_protocol::RequestUser,
    ) -> Result<qpy_protocol::AttemptModel, QuestionTypeError> {
        Ok(qpy_protocol::AttemptModel {
            lang: Some("en".to_string()),
            variant: 1,
            ui: qpy_protocol::AttemptUi::formulation("<p>view</p>"),
        })
    }

    fn score_attempt(
        &mut self,
        _question_state: &str,
        _attempt_state: &str,
        _scoring_state: Option<&str>,
        _response: &FormData,
        _request_user: &qpy_protocol::RequestUser,
    ) -> Result<qpy_protocol::AttemptScoredModel, QuestionTypeError> {
        Ok(qpy_protocol::AttemptScoredModel {
            attempt: qpy_protocol::AttemptModel {
                lang: Some("en".to_string()),
                variant: 1,
                ui: qpy_protocol::AttemptUi::formulation("<p>scored</p>"),
            },
            score: qpy_protocol::ScoreModel {
                scoring_state: None,
                scoring_code: qpy_protocol::ScoringCode::AutomaticallyScored,
                score: Some(1.0),
                score_final: Some(1.0),
            },
        })
    }
}

fn echo_factory(_manifest: &qpy_protocol::Manifest) -> Box<dyn QuestionType> {
    Box::new(EchoQuestionType)
}

fn register_qtype(namespace: &str, short_name: &str) {
    qpy_worker::register_question_type(
        format!("@{namespace}/{short_name}:__main__"),
        echo_factory,
    );
}

/// Builds a zip package archive in memory. `static_files` entries are
/// `(path-under-dist, bytes, size-declared-in-manifest)`.
fn build_package(
    namespace: &str,
    short_name: &str,
    version: &str,
    static_files: &[(&str, &[u8], u64)],
) -> Vec<u8> {
    let mut manifest = json!({
        "short_name": short_name,
        "namespace": namespace,
        "version": version,
        "api_version": "0.2",
        "author": "Test Author",
    });
    if !static_files.is_empty() {
        let mut inventory = serde_json::Map::new();
        for (path, _, declared_size) in static_files {
            inventory.insert(
                (*path).to_string(),
                json!({
                    "size": declared_size,
                    "mime_type": mime_guess::from_path(path)
                        .first()
                        .map(|m| m.essence_str().to_string()),
                }),
            );
        }
        manifest["static_files"] = inventory.into();
    }

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    writer
        .start_file("dist/manifest.json", options)
        .expect("start manifest");
    writer
        .write_all(&serde_json::to_vec(&manifest).expect("serialize manifest"))
        .expect("write manifest");
    for (path, bytes, _) in static_files {
        writer
            .start_file(format!("dist/{path}"), options)
            .expect("start static file");
        writer.write_all(bytes).expect("write static file");
    }
    writer.finish().expect("finish zip").into_inner()
}

fn test_settings(base: &Path, local_directory: Option<&Path>) -> Settings {
    let mut settings = Settings::default();
    settings.worker.kind = WorkerKind::Thread;
    settings.worker.max_workers = 4;
    settings.worker.max_memory = 1024 * 1024 * 1024;
    settings.worker.per_worker_memory = 64 * 1024 * 1024;
    settings.cache_package.directory = base.join("cache/packages");
    settings.cache_package.size = 64 * 1024 * 1024;
    settings.cache_repo_index.directory = base.join("cache/repo_index");
    settings.collector.local_directory = local_directory.map(Path::to_path_buf);
    settings
}

async fn build_router(settings: Settings) -> Router {
    let app = App::new(settings).await.expect("assemble app");
    let state = app.state();
    state.packages.start().await.expect("start collectors");
    app.router()
}

fn multipart_body(parts: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, bytes) in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn multipart_request(uri: &str, parts: &[(&str, &[u8])]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(parts)))
        .expect("request")
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("parse body")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn status_reports_configuration_and_usage() {
    let base = tempfile::tempdir().expect("tempdir");
    let router = build_router(test_settings(base.path(), None)).await;

    let response = router
        .oneshot(
            Request::builder()
                .uri("/status")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let status = body_json(response).await;
    assert_eq!(status["name"], "qpy-server");
    assert_eq!(status["allow_lms_packages"], true);
    assert_eq!(status["usage"]["requests_in_process"], 0);
    assert_eq!(status["usage"]["requests_in_queue"], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn options_form_with_upload_then_cache_hit() {
    register_qtype("acme", "example");
    let base = tempfile::tempdir().expect("tempdir");
    let router = build_router(test_settings(base.path(), None)).await;

    let package = build_package("acme", "example", "1.0.0", &[]);
    let hash = hash_bytes(&package);
    let uri = format!("/packages/{hash}/options");

    let main = br#"{"context":1}"#;
    let response = router
        .clone()
        .oneshot(multipart_request(&uri, &[("main", main), ("package", &package)]))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let form = body_json(response).await;
    assert_eq!(form["definition"]["general"][0]["kind"], "input");

    // The package is cached now; the same request without the part works.
    let response = router
        .oneshot(multipart_request(&uri, &[("main", main)]))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn options_form_accepts_plain_json_bodies() {
    register_qtype("acme", "jsononly");
    let base = tempfile::tempdir().expect("tempdir");
    let router = build_router(test_settings(base.path(), None)).await;

    let package = build_package("acme", "jsononly", "1.0.0", &[]);
    let hash = hash_bytes(&package);

    // Seed the cache with a multipart upload.
    let response = router
        .clone()
        .oneshot(multipart_request(
            &format!("/packages/{hash}/options"),
            &[("main", br#"{"context":1}"#), ("package", &package)],
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/packages/{hash}/options"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"context":2}"#))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hash_mismatch_is_an_invalid_package() {
    register_qtype("acme", "example");
    let base = tempfile::tempdir().expect("tempdir");
    let router = build_router(test_settings(base.path(), None)).await;

    let package = build_package("acme", "example", "1.0.0", &[]);
    let wrong_hash = "a".repeat(64);

    let response = router
        .oneshot(multipart_request(
            &format!("/packages/{wrong_hash}/options"),
            &[("main", br#"{"context":1}"#), ("package", &package)],
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["error_code"], "INVALID_PACKAGE");
    assert_eq!(body["temporary"], false);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_uri_hash_is_a_package_not_found() {
    let base = tempfile::tempdir().expect("tempdir");
    let router = build_router(test_settings(base.path(), None)).await;

    let unknown_hash = "b".repeat(64);
    let response = router
        .oneshot(multipart_request(
            &format!("/packages/{unknown_hash}/options"),
            &[("main", br#"{"context":1}"#)],
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = body_json(response).await;
    assert_eq!(body["what"], "PACKAGE");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_main_body_is_an_invalid_request() {
    register_qtype("acme", "example");
    let base = tempfile::tempdir().expect("tempdir");
    let router = build_router(test_settings(base.path(), None)).await;

    let package = build_package("acme", "example", "1.0.0", &[]);
    let hash = hash_bytes(&package);

    let response = router
        .oneshot(multipart_request(
            &format!("/packages/{hash}/options"),
            &[("package", &package)],
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["error_code"], "INVALID_REQUEST");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn attempt_start_requires_a_question_state() {
    register_qtype("acme", "example");
    let base = tempfile::tempdir().expect("tempdir");
    let router = build_router(test_settings(base.path(), None)).await;

    let package = build_package("acme", "example", "1.0.0", &[]);
    let hash = hash_bytes(&package);
    let uri = format!("/packages/{hash}/attempt/start");

    let response = router
        .clone()
        .oneshot(multipart_request(
            &uri,
            &[("main", br#"{"variant":1}"#), ("package", &package)],
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = router
        .oneshot(multipart_request(
            &uri,
            &[
                ("main", br#"{"variant":2}"#),
                ("package", &package),
                ("question_state", b"question-state"),
            ],
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);

    let attempt = body_json(response).await;
    assert_eq!(attempt["variant"], 2);
    assert_eq!(attempt["attempt_state"], "attempt-state");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn attempt_view_and_score_round_trip() {
    register_qtype("acme", "example");
    let base = tempfile::tempdir().expect("tempdir");
    let router = build_router(test_settings(base.path(), None)).await;

    let package = build_package("acme", "example", "1.0.0", &[]);
    let hash = hash_bytes(&package);

    let view_main = br#"{"attempt_state":"attempt-state"}"#;
    let response = router
        .clone()
        .oneshot(multipart_request(
            &format!("/packages/{hash}/attempt/view"),
            &[
                ("main", view_main),
                ("package", &package),
                ("question_state", b"question-state"),
            ],
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);

    let score_main = br#"{"attempt_state":"attempt-state","response":{"answer":"42"}}"#;
    let response = router
        .oneshot(multipart_request(
            &format!("/packages/{hash}/attempt/score"),
            &[
                ("main", score_main),
                ("package", &package),
                ("question_state", b"question-state"),
            ],
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);

    let scored = body_json(response).await;
    assert_eq!(scored["scoring_code"], "AUTOMATICALLY_SCORED");
    assert_eq!(scored["score"], 1.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn static_file_retrieval_with_cache_headers() {
    register_qtype("acme", "statics");
    let base = tempfile::tempdir().expect("tempdir");
    let router = build_router(test_settings(base.path(), None)).await;

    let package = build_package(
        "acme",
        "statics",
        "1.0.0",
        &[("static/x.pdf", b"some data", 9)],
    );
    let hash = hash_bytes(&package);

    let response = router
        .clone()
        .oneshot(multipart_request(
            &format!("/packages/{hash}/file/acme/statics/static/x.pdf"),
            &[("package", &package)],
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok()),
        Some("public, immutable, max-age=31536000")
    );
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/pdf")
    );
    let bytes = axum::body::to_bytes(response.into_body(), 1024)
        .await
        .expect("read body");
    assert_eq!(&bytes[..], b"some data");

    // Present on disk but absent from the manifest: 404.
    let response = router
        .oneshot(multipart_request(
            &format!("/packages/{hash}/file/acme/statics/static/missing.pdf"),
            &[],
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn static_file_size_mismatch_is_an_invalid_package() {
    register_qtype("acme", "badsize");
    let base = tempfile::tempdir().expect("tempdir");
    let router = build_router(test_settings(base.path(), None)).await;

    // Manifest declares 1 byte; the archive holds 9.
    let package = build_package(
        "acme",
        "badsize",
        "1.0.0",
        &[("static/x.pdf", b"some data", 1)],
    );
    let hash = hash_bytes(&package);

    let response = router
        .oneshot(multipart_request(
            &format!("/packages/{hash}/file/acme/badsize/static/x.pdf"),
            &[("package", &package)],
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["error_code"], "INVALID_PACKAGE");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_question_state_is_a_payload_too_large() {
    register_qtype("acme", "example");
    let base = tempfile::tempdir().expect("tempdir");
    let router = build_router(test_settings(base.path(), None)).await;

    let package = build_package("acme", "example", "1.0.0", &[]);
    let hash = hash_bytes(&package);
    let oversized = vec![b'x'; (qpy_protocol::MAX_QUESTION_STATE_SIZE + 1) as usize];

    let response = router
        .oneshot(multipart_request(
            &format!("/packages/{hash}/options"),
            &[
                ("main", br#"{"context":1}"#),
                ("package", &package),
                ("question_state", &oversized),
            ],
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn package_extract_info_reports_the_manifest() {
    register_qtype("acme", "example");
    let base = tempfile::tempdir().expect("tempdir");
    let router = build_router(test_settings(base.path(), None)).await;

    let package = build_package("acme", "example", "1.2.3", &[]);
    let hash = hash_bytes(&package);

    let response = router
        .oneshot(multipart_request("/package-extract-info", &[("package", &package)]))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);

    let info = body_json(response).await;
    assert_eq!(info["short_name"], "example");
    assert_eq!(info["namespace"], "acme");
    assert_eq!(info["version"], "1.2.3");
    assert_eq!(info["package_hash"], hash);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listing_groups_versions_descending() {
    register_qtype("acme", "listed");
    register_qtype("acme", "solo");
    let base = tempfile::tempdir().expect("tempdir");
    let local_dir = base.path().join("packages");
    std::fs::create_dir_all(&local_dir).expect("mkdir");

    std::fs::write(
        local_dir.join("listed-1.0.0.qpy"),
        build_package("acme", "listed", "1.0.0", &[]),
    )
    .expect("write");
    std::fs::write(
        local_dir.join("listed-0.0.1.qpy"),
        build_package("acme", "listed", "0.0.1", &[]),
    )
    .expect("write");
    std::fs::write(
        local_dir.join("solo.qpy"),
        build_package("acme", "solo", "0.2.0", &[]),
    )
    .expect("write");

    let router = build_router(test_settings(base.path(), Some(&local_dir))).await;

    let response = router
        .oneshot(
            Request::builder()
                .uri("/packages")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let listing = body_json(response).await;
    let entries = listing.as_array().expect("array");
    assert_eq!(entries.len(), 2);

    let listed = entries
        .iter()
        .find(|entry| entry["manifest"]["short_name"] == "listed")
        .expect("listed entry");
    assert_eq!(listed["versions"][0]["version"], "1.0.0");
    assert_eq!(listed["versions"][1]["version"], "0.0.1");
    // The manifest shown is the one of the highest version.
    assert_eq!(listed["manifest"]["short_name"], "listed");
}
