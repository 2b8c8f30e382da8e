//! Bootstrap and dispatch loop of the worker runtime.
//!
//! The first frame on the wire must be `InitWorker`; anything else aborts the
//! worker. After replying, the runtime loops: read one frame, route it by
//! message id, write exactly one response frame. A handler failure becomes a
//! structured error frame instead of tearing the loop down; a frame with an
//! unknown id is unrecoverable because the stream can no longer be trusted.

use std::io::Read;
use std::io::Write;
use std::panic::AssertUnwindSafe;

use qpy_protocol::CodecError;
use qpy_protocol::CreateQuestionFromOptions;
use qpy_protocol::GetManifest;
use qpy_protocol::GetOptionsForm;
use qpy_protocol::InitWorker;
use qpy_protocol::LoadPackage;
use qpy_protocol::MessageId;
use qpy_protocol::MessageToServer;
use qpy_protocol::AttemptScored;
use qpy_protocol::AttemptStarted;
use qpy_protocol::AttemptViewed;
use qpy_protocol::OptionsFormReturned;
use qpy_protocol::PackageLoaded;
use qpy_protocol::QuestionCreated;
use qpy_protocol::ReturnedManifest;
use qpy_protocol::ScoreAttempt;
use qpy_protocol::StartAttempt;
use qpy_protocol::ViewAttempt;
use qpy_protocol::WorkerBound;
use qpy_protocol::WorkerErrorKind;
use qpy_protocol::WorkerErrorMessage;
use qpy_protocol::WorkerResourceLimits;
use qpy_protocol::WorkerStarted;
use qpy_protocol::encode_payload;
use qpy_protocol::read_frame;
use qpy_protocol::write_frame;
use tracing::debug;
use tracing::warn;

use crate::WORKER_TYPE_PROCESS;
use crate::limits::apply_memory_limit;
use crate::package::LoadedPackage;
use crate::package::PackageOpenError;
use crate::qtype::QuestionType;
use crate::qtype::QuestionTypeError;
use crate::qtype::resolve_question_type;

#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("expected InitWorker as the first message, got id {0}")]
    Bootstrap(u32),

    #[error("worker stream ended or carried an invalid frame: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
enum HandlerError {
    #[error(transparent)]
    QuestionType(#[from] QuestionTypeError),

    #[error(transparent)]
    PackageOpen(#[from] PackageOpenError),

    #[error("no main package has been loaded")]
    MainPackageNotLoaded,

    #[error("unexpected message: {0}")]
    UnexpectedMessage(&'static str),

    #[error("package code panicked: {0}")]
    Panic(String),

    #[error("failed to serialize response: {0}")]
    Encode(#[from] serde_json::Error),
}

impl HandlerError {
    fn kind(&self) -> WorkerErrorKind {
        match self {
            Self::QuestionType(QuestionTypeError::MemoryExceeded) => WorkerErrorKind::MemoryExceeded,
            _ => WorkerErrorKind::Unknown,
        }
    }
}

/// One encoded response frame: message id plus JSON payload.
type EncodedResponse = (u32, Vec<u8>);

fn encode<M: MessageToServer>(message: &M) -> Result<EncodedResponse, HandlerError> {
    let payload = match encode_payload(message) {
        Ok(payload) => payload,
        Err(CodecError::Json(err)) => return Err(HandlerError::Encode(err)),
        Err(other) => return Err(HandlerError::Panic(other.to_string())),
    };
    Ok((M::ID.as_u32(), payload))
}

pub struct WorkerRuntime<R: Read, W: Write> {
    reader: R,
    writer: W,
    worker_type: String,
    limits: Option<WorkerResourceLimits>,
    loaded: Vec<LoadedPackage>,
    main: Option<Box<dyn QuestionType>>,
}

impl<R: Read, W: Write> WorkerRuntime<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            worker_type: String::new(),
            limits: None,
            loaded: Vec::new(),
            main: None,
        }
    }

    /// Runs bootstrap and the dispatch loop until `Exit` or a stream error.
    pub fn run(mut self) -> Result<(), RuntimeError> {
        self.bootstrap()?;
        self.dispatch_loop()
    }

    fn bootstrap(&mut self) -> Result<(), RuntimeError> {
        let frame = read_frame(&mut self.reader)?;
        let message = WorkerBound::decode(&frame)?;
        let WorkerBound::InitWorker(init) = message else {
            return Err(RuntimeError::Bootstrap(frame.message_id));
        };

        // Thread workers share the server's address space; limiting it here
        // would limit the server.
        if init.worker_type == WORKER_TYPE_PROCESS {
            apply_memory_limit(init.limits.max_memory)?;
        }
        self.worker_type = init.worker_type;
        self.limits = Some(init.limits);

        self.send(&WorkerStarted {})?;
        debug!(worker_type = %self.worker_type, "worker bootstrapped");
        Ok(())
    }

    fn dispatch_loop(&mut self) -> Result<(), RuntimeError> {
        loop {
            let frame = read_frame(&mut self.reader)?;
            let message = WorkerBound::decode(&frame)?;

            let Some(expected_response) = message.expected_response_id() else {
                // Exit carries no response; leave the loop cleanly.
                debug!("worker exiting on request");
                return Ok(());
            };

            match self.handle(message) {
                Ok((id, payload)) => write_frame(&mut self.writer, id, &payload)?,
                Err(error) => {
                    warn!(%error, "handler failed");
                    let report = WorkerErrorMessage {
                        expected_response_id: expected_response.as_u32(),
                        kind: error.kind(),
                        message: Some(error.to_string()),
                    };
                    let payload = match encode_payload(&report) {
                        Ok(payload) => payload,
                        Err(CodecError::Json(err)) => return Err(CodecError::Json(err).into()),
                        Err(other) => return Err(other.into()),
                    };
                    write_frame(&mut self.writer, MessageId::Error.as_u32(), &payload)?;
                }
            }
            self.writer.flush()?;
        }
    }

    fn handle(&mut self, message: WorkerBound) -> Result<EncodedResponse, HandlerError> {
        match message {
            WorkerBound::InitWorker(_) => {
                Err(HandlerError::UnexpectedMessage("InitWorker after bootstrap"))
            }
            WorkerBound::Exit(_) => unreachable!("handled by the dispatch loop"),
            WorkerBound::LoadPackage(msg) => self.on_load_package(msg),
            WorkerBound::GetManifest(msg) => self.on_get_manifest(msg),
            WorkerBound::GetOptionsForm(msg) => self.on_get_options_form(msg),
            WorkerBound::CreateQuestionFromOptions(msg) => self.on_create_question(msg),
            WorkerBound::StartAttempt(msg) => self.on_start_attempt(msg),
            WorkerBound::ViewAttempt(msg) => self.on_view_attempt(msg),
            WorkerBound::ScoreAttempt(msg) => self.on_score_attempt(msg),
        }
    }

    fn send<M: MessageToServer>(&mut self, message: &M) -> Result<(), RuntimeError> {
        let payload = encode_payload(message)?;
        write_frame(&mut self.writer, M::ID.as_u32(), &payload)?;
        self.writer.flush()?;
        Ok(())
    }

    fn main_question_type(&mut self) -> Result<&mut Box<dyn QuestionType>, HandlerError> {
        self.main.as_mut().ok_or(HandlerError::MainPackageNotLoaded)
    }

    fn on_load_package(&mut self, msg: LoadPackage) -> Result<EncodedResponse, HandlerError> {
        let package = LoadedPackage::open(&msg.location)?;

        if msg.main {
            let key = package.entrypoint_key();
            let factory = resolve_question_type(&key)
                .ok_or_else(|| PackageOpenError::UnknownEntrypoint(key))?;
            self.main = Some(factory(&package.manifest));
        }

        self.loaded.retain(|loaded| loaded.location != package.location);
        self.loaded.push(package);
        encode(&PackageLoaded {})
    }

    fn on_get_manifest(&mut self, msg: GetManifest) -> Result<EncodedResponse, HandlerError> {
        let manifest = match self.loaded.iter().find(|p| p.location == msg.location) {
            Some(package) => package.manifest.clone(),
            None => LoadedPackage::open(&msg.location)?.manifest,
        };
        encode(&ReturnedManifest { manifest })
    }

    fn on_get_options_form(&mut self, msg: GetOptionsForm) -> Result<EncodedResponse, HandlerError> {
        let main = self.main_question_type()?;
        let (definition, form_data) = catching(|| {
            Ok(main.options_form(msg.question_state.as_deref(), &msg.request_user)?)
        })?;
        encode(&OptionsFormReturned {
            definition,
            form_data,
        })
    }

    fn on_create_question(
        &mut self,
        msg: CreateQuestionFromOptions,
    ) -> Result<EncodedResponse, HandlerError> {
        let main = self.main_question_type()?;
        let (question_state, question_model) = catching(|| {
            Ok(main.create_question(
                msg.question_state.as_deref(),
                &msg.form_data,
                &msg.request_user,
            )?)
        })?;
        encode(&QuestionCreated {
            question_state,
            question_model,
        })
    }

    fn on_start_attempt(&mut self, msg: StartAttempt) -> Result<EncodedResponse, HandlerError> {
        let main = self.main_question_type()?;
        let attempt = catching(|| {
            Ok(main.start_attempt(&msg.question_state, msg.variant, &msg.request_user)?)
        })?;
        encode(&AttemptStarted { attempt })
    }

    fn on_view_attempt(&mut self, msg: ViewAttempt) -> Result<EncodedResponse, HandlerError> {
        let main = self.main_question_type()?;
        let attempt = catching(|| {
            Ok(main.view_attempt(
                &msg.question_state,
                &msg.attempt_state,
                msg.scoring_state.as_deref(),
                msg.response.as_ref(),
                &msg.request_user,
            )?)
        })?;
        encode(&AttemptViewed { attempt })
    }

    fn on_score_attempt(&mut self, msg: ScoreAttempt) -> Result<EncodedResponse, HandlerError> {
        let main = self.main_question_type()?;
        let scored = catching(|| {
            Ok(main.score_attempt(
                &msg.question_state,
                &msg.attempt_state,
                msg.scoring_state.as_deref(),
                &msg.response,
                &msg.request_user,
            )?)
        })?;
        encode(&AttemptScored { scored })
    }
}

/// Runs a handler body, converting panics in package code into handler
/// errors so they travel back as structured error frames.
fn catching<T>(body: impl FnOnce() -> Result<T, HandlerError>) -> Result<T, HandlerError> {
    match std::panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| (*s).to_string()))
                .unwrap_or_else(|| "opaque panic payload".to_string());
            Err(HandlerError::Panic(message))
        }
    }
}
