//! Server-side worker handles and the pool that hands them out.

mod connection;
mod error;
mod host;
pub mod pool;
mod process;
mod thread;

use std::io::Read;
use std::time::Duration;

use qpy_protocol::CreateQuestionFromOptions;
use qpy_protocol::AttemptModel;
use qpy_protocol::AttemptScoredModel;
use qpy_protocol::AttemptStartedModel;
use qpy_protocol::DIST_DIR;
use qpy_protocol::GetManifest;
use qpy_protocol::GetOptionsForm;
use qpy_protocol::Manifest;
use qpy_protocol::OptionsFormDefinition;
use qpy_protocol::PackageLocation;
use qpy_protocol::QuestionCreated;
use qpy_protocol::RequestUser;
use qpy_protocol::ScoreAttempt;
use qpy_protocol::StartAttempt;
use qpy_protocol::ViewAttempt;
use qpy_protocol::WorkerRequest;
use qpy_protocol::WorkerResourceLimits;

pub use error::WorkerError;
pub use host::WorkerState;
pub use pool::WorkerPool;
pub use process::ProcessWorker;
pub use thread::ThreadWorker;

pub type FormData = serde_json::Map<String, serde_json::Value>;

/// One static file read out of a package, ready to serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFileData {
    pub size: u64,
    pub mime_type: Option<String>,
    pub data: Vec<u8>,
}

/// A worker owned by the server: either an isolated process or an in-process
/// thread for debugging. All operations are strictly one exchange at a time.
pub enum Worker {
    Process(ProcessWorker),
    Thread(ThreadWorker),
}

impl Worker {
    pub async fn start(&mut self) -> Result<(), WorkerError> {
        match self {
            Self::Process(worker) => worker.start().await,
            Self::Thread(worker) => worker.start().await,
        }
    }

    pub fn location(&self) -> &PackageLocation {
        match self {
            Self::Process(worker) => worker.location(),
            Self::Thread(worker) => worker.location(),
        }
    }

    pub fn limits(&self) -> WorkerResourceLimits {
        match self {
            Self::Process(worker) => worker.limits(),
            Self::Thread(worker) => worker.limits(),
        }
    }

    pub fn state(&self) -> WorkerState {
        match self {
            Self::Process(worker) => worker.state(),
            Self::Thread(worker) => worker.state(),
        }
    }

    async fn request<R: WorkerRequest>(&self, message: &R) -> Result<R::Response, WorkerError> {
        match self {
            Self::Process(worker) => {
                worker.send_and_wait(message, worker.default_timeout()).await
            }
            Self::Thread(worker) => worker.send_and_wait(message).await,
        }
    }

    pub async fn get_manifest(&self) -> Result<Manifest, WorkerError> {
        let response = self
            .request(&GetManifest {
                location: self.location().clone(),
            })
            .await?;
        Ok(response.manifest)
    }

    pub async fn get_options_form(
        &self,
        request_user: RequestUser,
        question_state: Option<String>,
    ) -> Result<(OptionsFormDefinition, FormData), WorkerError> {
        let response = self
            .request(&GetOptionsForm {
                question_state,
                request_user,
            })
            .await?;
        Ok((response.definition, response.form_data))
    }

    pub async fn create_question(
        &self,
        request_user: RequestUser,
        old_state: Option<String>,
        form_data: FormData,
    ) -> Result<QuestionCreated, WorkerError> {
        self.request(&CreateQuestionFromOptions {
            question_state: old_state,
            form_data,
            request_user,
        })
        .await
    }

    pub async fn start_attempt(
        &self,
        request_user: RequestUser,
        question_state: String,
        variant: u32,
    ) -> Result<AttemptStartedModel, WorkerError> {
        let response = self
            .request(&StartAttempt {
                question_state,
                variant,
                request_user,
            })
            .await?;
        Ok(response.attempt)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn view_attempt(
        &self,
        request_user: RequestUser,
        question_state: String,
        attempt_state: String,
        scoring_state: Option<String>,
        response: Option<FormData>,
    ) -> Result<AttemptModel, WorkerError> {
        let reply = self
            .request(&ViewAttempt {
                question_state,
                attempt_state,
                scoring_state,
                response,
                request_user,
            })
            .await?;
        Ok(reply.attempt)
    }

    pub async fn score_attempt(
        &self,
        request_user: RequestUser,
        question_state: String,
        attempt_state: String,
        scoring_state: Option<String>,
        response: FormData,
    ) -> Result<AttemptScoredModel, WorkerError> {
        let reply = self
            .request(&ScoreAttempt {
                question_state,
                attempt_state,
                scoring_state,
                response,
                request_user,
            })
            .await?;
        Ok(reply.scored)
    }

    /// Reads a static file out of the package, cross-checking the manifest's
    /// size inventory. Served from the server side; the worker is only asked
    /// for the manifest.
    pub async fn get_static_file(&self, path: &str) -> Result<PackageFileData, WorkerError> {
        let manifest = self.get_manifest().await?;
        let location = self.location().clone();
        let path = path.trim_start_matches('/').to_string();
        tokio::task::spawn_blocking(move || read_static_file(&location, &manifest, &path))
            .await
            .map_err(|err| WorkerError::Io(err.to_string()))?
    }

    pub async fn stop(&mut self, grace: Duration) {
        match self {
            Self::Process(worker) => worker.stop(grace).await,
            Self::Thread(worker) => worker.stop(grace).await,
        }
    }

    pub async fn kill(&self) {
        match self {
            Self::Process(worker) => worker.kill().await,
            Self::Thread(worker) => worker.kill().await,
        }
    }
}

fn check_static_file_size(
    path: &str,
    expected: u64,
    actual: u64,
) -> Result<(), WorkerError> {
    if expected != actual {
        return Err(WorkerError::StaticFileSizeMismatch {
            path: path.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

fn static_file_mime(path: &str, entry_mime: Option<&String>) -> Option<String> {
    entry_mime.cloned().or_else(|| {
        mime_guess::from_path(path)
            .first()
            .map(|mime| mime.essence_str().to_string())
    })
}

fn read_static_file(
    location: &PackageLocation,
    manifest: &Manifest,
    path: &str,
) -> Result<PackageFileData, WorkerError> {
    let Some(entry) = manifest.static_files.get(path) else {
        return Err(WorkerError::StaticFileNotFound(path.to_string()));
    };

    match location {
        PackageLocation::Zip(zip) => {
            let file = std::fs::File::open(&zip.path)?;
            let mut archive =
                zip::ZipArchive::new(file).map_err(|err| WorkerError::Io(err.to_string()))?;
            let mut entry_file = match archive.by_name(&format!("{DIST_DIR}/{path}")) {
                Ok(entry_file) => entry_file,
                Err(zip::result::ZipError::FileNotFound) => {
                    return Err(WorkerError::StaticFileNotFound(path.to_string()));
                }
                Err(err) => return Err(WorkerError::Io(err.to_string())),
            };
            check_static_file_size(path, entry.size, entry_file.size())?;

            let mut data = Vec::with_capacity(entry_file.size() as usize);
            entry_file.read_to_end(&mut data)?;
            Ok(PackageFileData {
                size: entry.size,
                mime_type: static_file_mime(path, entry.mime_type.as_ref()),
                data,
            })
        }
        PackageLocation::Dir(dir) => {
            let full_path = dir.path.join(path);
            let metadata = match std::fs::metadata(&full_path) {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(WorkerError::StaticFileNotFound(path.to_string()));
                }
                Err(err) => return Err(err.into()),
            };
            check_static_file_size(path, entry.size, metadata.len())?;

            let data = std::fs::read(&full_path)?;
            Ok(PackageFileData {
                size: entry.size,
                mime_type: static_file_mime(path, entry.mime_type.as_ref()),
                data,
            })
        }
        PackageLocation::Function(_) => {
            Err(WorkerError::StaticFileNotFound(path.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn manifest_with_static_file(size: u64) -> Manifest {
        serde_json::from_value(serde_json::json!({
            "short_name": "example",
            "namespace": "acme",
            "version": "0.1.0",
            "api_version": "0.2",
            "author": "a",
            "static_files": {
                "static/x.pdf": {"size": size, "mime_type": "application/pdf"},
            },
        }))
        .expect("manifest")
    }

    #[test]
    fn reads_static_file_from_dir_package() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("static")).expect("mkdir");
        std::fs::write(dir.path().join("static/x.pdf"), b"some data").expect("write");

        let data = read_static_file(
            &PackageLocation::dir(dir.path()),
            &manifest_with_static_file(9),
            "static/x.pdf",
        )
        .expect("read");
        assert_eq!(data.data, b"some data");
        assert_eq!(data.mime_type.as_deref(), Some("application/pdf"));
    }

    #[test]
    fn size_mismatch_is_an_invalid_package() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("static")).expect("mkdir");
        std::fs::write(dir.path().join("static/x.pdf"), b"some data").expect("write");

        let err = read_static_file(
            &PackageLocation::dir(dir.path()),
            &manifest_with_static_file(1),
            "static/x.pdf",
        )
        .expect_err("mismatch");
        assert!(matches!(
            err,
            WorkerError::StaticFileSizeMismatch { expected: 1, actual: 9, .. }
        ));
    }

    #[test]
    fn file_missing_from_manifest_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("static")).expect("mkdir");
        std::fs::write(dir.path().join("static/y.pdf"), b"on disk only").expect("write");

        let err = read_static_file(
            &PackageLocation::dir(dir.path()),
            &manifest_with_static_file(9),
            "static/y.pdf",
        )
        .expect_err("not in manifest");
        assert!(matches!(err, WorkerError::StaticFileNotFound(_)));
    }
}
