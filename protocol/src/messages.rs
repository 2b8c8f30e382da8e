//! The fixed message set exchanged between server and worker.
//!
//! Message ids partition into two disjoint ranges: server → worker uses
//! 0–999, worker → server uses 1000–1999. Receivers reject anything outside
//! their expected range. Request structs implement [`WorkerRequest`] so the
//! caller gets the matching response type back without touching raw frames.

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::AttemptModel;
use crate::AttemptScoredModel;
use crate::AttemptStartedModel;
use crate::Manifest;
use crate::OptionsFormDefinition;
use crate::PackageLocation;
use crate::QuestionModel;
use crate::WorkerResourceLimits;
use crate::codec::CodecError;
use crate::codec::Frame;

/// Every message id known to either side of the pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageId {
    // Server to worker.
    InitWorker = 0,
    Exit = 3,
    LoadPackage = 10,
    GetManifest = 20,
    GetOptionsForm = 30,
    CreateQuestionFromOptions = 40,
    StartAttempt = 50,
    ViewAttempt = 51,
    ScoreAttempt = 52,

    // Worker to server.
    WorkerStarted = 1000,
    PackageLoaded = 1010,
    ReturnedManifest = 1020,
    OptionsFormReturned = 1030,
    QuestionCreated = 1040,
    AttemptStarted = 1050,
    AttemptViewed = 1051,
    AttemptScored = 1052,
    Error = 1100,
}

impl MessageId {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        let id = match value {
            0 => Self::InitWorker,
            3 => Self::Exit,
            10 => Self::LoadPackage,
            20 => Self::GetManifest,
            30 => Self::GetOptionsForm,
            40 => Self::CreateQuestionFromOptions,
            50 => Self::StartAttempt,
            51 => Self::ViewAttempt,
            52 => Self::ScoreAttempt,
            1000 => Self::WorkerStarted,
            1010 => Self::PackageLoaded,
            1020 => Self::ReturnedManifest,
            1030 => Self::OptionsFormReturned,
            1040 => Self::QuestionCreated,
            1050 => Self::AttemptStarted,
            1051 => Self::AttemptViewed,
            1052 => Self::AttemptScored,
            1100 => Self::Error,
            _ => return None,
        };
        Some(id)
    }

    /// True for ids the worker may send to the server.
    pub fn is_server_bound(self) -> bool {
        self.as_u32() >= 1000
    }
}

/// A message travelling from the server to a worker.
pub trait MessageToWorker: Serialize + Send {
    const ID: MessageId;
}

/// A message travelling from a worker to the server.
pub trait MessageToServer: Serialize + DeserializeOwned + Send {
    const ID: MessageId;
}

/// A server → worker message that expects exactly one response frame.
pub trait WorkerRequest: MessageToWorker {
    type Response: MessageToServer;
}

/// The language preference block accompanying every user-facing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestUser {
    pub preferred_languages: Vec<String>,
}

impl RequestUser {
    pub fn new(preferred_languages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            preferred_languages: preferred_languages.into_iter().map(Into::into).collect(),
        }
    }
}

/// First message on every connection; anything else aborts the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitWorker {
    pub limits: WorkerResourceLimits,
    pub worker_type: String,
}

impl MessageToWorker for InitWorker {
    const ID: MessageId = MessageId::InitWorker;
}

impl WorkerRequest for InitWorker {
    type Response = WorkerStarted;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStarted {}

impl MessageToServer for WorkerStarted {
    const ID: MessageId = MessageId::WorkerStarted;
}

/// Command to gracefully leave the dispatch loop. Has no response; the
/// worker exits instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exit {}

impl MessageToWorker for Exit {
    const ID: MessageId = MessageId::Exit;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadPackage {
    pub location: PackageLocation,
    /// Set this package as the main package and resolve its entrypoint.
    pub main: bool,
}

impl MessageToWorker for LoadPackage {
    const ID: MessageId = MessageId::LoadPackage;
}

impl WorkerRequest for LoadPackage {
    type Response = PackageLoaded;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageLoaded {}

impl MessageToServer for PackageLoaded {
    const ID: MessageId = MessageId::PackageLoaded;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetManifest {
    pub location: PackageLocation,
}

impl MessageToWorker for GetManifest {
    const ID: MessageId = MessageId::GetManifest;
}

impl WorkerRequest for GetManifest {
    type Response = ReturnedManifest;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnedManifest {
    pub manifest: Manifest,
}

impl MessageToServer for ReturnedManifest {
    const ID: MessageId = MessageId::ReturnedManifest;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetOptionsForm {
    pub question_state: Option<String>,
    pub request_user: RequestUser,
}

impl MessageToWorker for GetOptionsForm {
    const ID: MessageId = MessageId::GetOptionsForm;
}

impl WorkerRequest for GetOptionsForm {
    type Response = OptionsFormReturned;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionsFormReturned {
    pub definition: OptionsFormDefinition,
    pub form_data: serde_json::Map<String, serde_json::Value>,
}

impl MessageToServer for OptionsFormReturned {
    const ID: MessageId = MessageId::OptionsFormReturned;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateQuestionFromOptions {
    /// Previous question state, or `None` if the question is new.
    pub question_state: Option<String>,
    pub form_data: serde_json::Map<String, serde_json::Value>,
    pub request_user: RequestUser,
}

impl MessageToWorker for CreateQuestionFromOptions {
    const ID: MessageId = MessageId::CreateQuestionFromOptions;
}

impl WorkerRequest for CreateQuestionFromOptions {
    type Response = QuestionCreated;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionCreated {
    pub question_state: String,
    pub question_model: QuestionModel,
}

impl MessageToServer for QuestionCreated {
    const ID: MessageId = MessageId::QuestionCreated;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartAttempt {
    pub question_state: String,
    pub variant: u32,
    pub request_user: RequestUser,
}

impl MessageToWorker for StartAttempt {
    const ID: MessageId = MessageId::StartAttempt;
}

impl WorkerRequest for StartAttempt {
    type Response = AttemptStarted;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptStarted {
    pub attempt: AttemptStartedModel,
}

impl MessageToServer for AttemptStarted {
    const ID: MessageId = MessageId::AttemptStarted;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewAttempt {
    pub question_state: String,
    pub attempt_state: String,
    pub scoring_state: Option<String>,
    pub response: Option<serde_json::Map<String, serde_json::Value>>,
    pub request_user: RequestUser,
}

impl MessageToWorker for ViewAttempt {
    const ID: MessageId = MessageId::ViewAttempt;
}

impl WorkerRequest for ViewAttempt {
    type Response = AttemptViewed;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptViewed {
    pub attempt: AttemptModel,
}

impl MessageToServer for AttemptViewed {
    const ID: MessageId = MessageId::AttemptViewed;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreAttempt {
    pub question_state: String,
    pub attempt_state: String,
    pub scoring_state: Option<String>,
    pub response: serde_json::Map<String, serde_json::Value>,
    pub request_user: RequestUser,
}

impl MessageToWorker for ScoreAttempt {
    const ID: MessageId = MessageId::ScoreAttempt;
}

impl WorkerRequest for ScoreAttempt {
    type Response = AttemptScored;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptScored {
    pub scored: AttemptScoredModel,
}

impl MessageToServer for AttemptScored {
    const ID: MessageId = MessageId::AttemptScored;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerErrorKind {
    Unknown,
    MemoryExceeded,
}

/// Structured report of a failure inside a worker handler. The
/// `expected_response_id` names the response the failed request would have
/// produced, which is what the server's receive loop matches on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerErrorMessage {
    pub expected_response_id: u32,
    pub kind: WorkerErrorKind,
    pub message: Option<String>,
}

impl MessageToServer for WorkerErrorMessage {
    const ID: MessageId = MessageId::Error;
}

/// Decoded form of a frame arriving at the worker. One dispatch table maps
/// each id to its payload schema.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerBound {
    InitWorker(InitWorker),
    Exit(Exit),
    LoadPackage(LoadPackage),
    GetManifest(GetManifest),
    GetOptionsForm(GetOptionsForm),
    CreateQuestionFromOptions(CreateQuestionFromOptions),
    StartAttempt(StartAttempt),
    ViewAttempt(ViewAttempt),
    ScoreAttempt(ScoreAttempt),
}

impl WorkerBound {
    pub fn decode(frame: &Frame) -> Result<Self, CodecError> {
        fn parse<M: DeserializeOwned>(payload: &[u8]) -> Result<M, CodecError> {
            if payload.is_empty() {
                return Ok(serde_json::from_slice(b"{}")?);
            }
            Ok(serde_json::from_slice(payload)?)
        }

        let invalid = || CodecError::InvalidMessageId {
            message_id: frame.message_id,
            payload_length: frame.payload.len() as u32,
        };

        let message = match MessageId::from_u32(frame.message_id).ok_or_else(invalid)? {
            MessageId::InitWorker => Self::InitWorker(parse(&frame.payload)?),
            MessageId::Exit => Self::Exit(parse(&frame.payload)?),
            MessageId::LoadPackage => Self::LoadPackage(parse(&frame.payload)?),
            MessageId::GetManifest => Self::GetManifest(parse(&frame.payload)?),
            MessageId::GetOptionsForm => Self::GetOptionsForm(parse(&frame.payload)?),
            MessageId::CreateQuestionFromOptions => {
                Self::CreateQuestionFromOptions(parse(&frame.payload)?)
            }
            MessageId::StartAttempt => Self::StartAttempt(parse(&frame.payload)?),
            MessageId::ViewAttempt => Self::ViewAttempt(parse(&frame.payload)?),
            MessageId::ScoreAttempt => Self::ScoreAttempt(parse(&frame.payload)?),
            // Worker-to-server range: not ours to receive.
            _ => return Err(invalid()),
        };
        Ok(message)
    }

    pub fn id(&self) -> MessageId {
        match self {
            Self::InitWorker(_) => MessageId::InitWorker,
            Self::Exit(_) => MessageId::Exit,
            Self::LoadPackage(_) => MessageId::LoadPackage,
            Self::GetManifest(_) => MessageId::GetManifest,
            Self::GetOptionsForm(_) => MessageId::GetOptionsForm,
            Self::CreateQuestionFromOptions(_) => MessageId::CreateQuestionFromOptions,
            Self::StartAttempt(_) => MessageId::StartAttempt,
            Self::ViewAttempt(_) => MessageId::ViewAttempt,
            Self::ScoreAttempt(_) => MessageId::ScoreAttempt,
        }
    }

    /// Id of the response frame a successful handler would produce. `Exit`
    /// produces none.
    pub fn expected_response_id(&self) -> Option<MessageId> {
        let id = match self {
            Self::InitWorker(_) => MessageId::WorkerStarted,
            Self::Exit(_) => return None,
            Self::LoadPackage(_) => MessageId::PackageLoaded,
            Self::GetManifest(_) => MessageId::ReturnedManifest,
            Self::GetOptionsForm(_) => MessageId::OptionsFormReturned,
            Self::CreateQuestionFromOptions(_) => MessageId::QuestionCreated,
            Self::StartAttempt(_) => MessageId::AttemptStarted,
            Self::ViewAttempt(_) => MessageId::AttemptViewed,
            Self::ScoreAttempt(_) => MessageId::AttemptScored,
        };
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::codec::encode_payload;

    fn round_trip<M>(message: &M) -> WorkerBound
    where
        M: MessageToWorker + PartialEq + std::fmt::Debug,
    {
        let payload = encode_payload(message).expect("encode");
        let frame = Frame {
            message_id: M::ID.as_u32(),
            payload,
        };
        WorkerBound::decode(&frame).expect("decode")
    }

    #[test]
    fn id_partition_is_disjoint() {
        for id in [
            MessageId::InitWorker,
            MessageId::Exit,
            MessageId::LoadPackage,
            MessageId::GetManifest,
            MessageId::GetOptionsForm,
            MessageId::CreateQuestionFromOptions,
            MessageId::StartAttempt,
            MessageId::ViewAttempt,
            MessageId::ScoreAttempt,
        ] {
            assert!(id.as_u32() < 1000);
            assert!(!id.is_server_bound());
        }
        for id in [
            MessageId::WorkerStarted,
            MessageId::PackageLoaded,
            MessageId::ReturnedManifest,
            MessageId::OptionsFormReturned,
            MessageId::QuestionCreated,
            MessageId::AttemptStarted,
            MessageId::AttemptViewed,
            MessageId::AttemptScored,
            MessageId::Error,
        ] {
            assert!(id.as_u32() >= 1000);
            assert!(id.is_server_bound());
        }
    }

    #[test]
    fn exit_encodes_to_empty_payload() {
        let payload = encode_payload(&Exit {}).expect("encode");
        assert!(payload.is_empty());

        let frame = Frame {
            message_id: MessageId::Exit.as_u32(),
            payload,
        };
        assert_eq!(WorkerBound::decode(&frame).expect("decode"), WorkerBound::Exit(Exit {}));
    }

    #[test]
    fn request_messages_round_trip() {
        let user = RequestUser::new(["de", "en"]);

        let start = StartAttempt {
            question_state: "state".to_string(),
            variant: 2,
            request_user: user.clone(),
        };
        assert_eq!(round_trip(&start), WorkerBound::StartAttempt(start));

        let options = GetOptionsForm {
            question_state: None,
            request_user: user,
        };
        assert_eq!(round_trip(&options), WorkerBound::GetOptionsForm(options));
    }

    #[test]
    fn unknown_id_is_invalid() {
        let frame = Frame {
            message_id: 999,
            payload: Vec::new(),
        };
        let err = WorkerBound::decode(&frame).expect_err("unknown id");
        assert!(matches!(err, CodecError::InvalidMessageId { message_id: 999, .. }));
    }

    #[test]
    fn server_bound_id_is_rejected_by_worker() {
        let frame = Frame {
            message_id: MessageId::WorkerStarted.as_u32(),
            payload: Vec::new(),
        };
        assert!(WorkerBound::decode(&frame).is_err());
    }

    #[test]
    fn worker_error_round_trips() {
        let error = WorkerErrorMessage {
            expected_response_id: MessageId::OptionsFormReturned.as_u32(),
            kind: WorkerErrorKind::MemoryExceeded,
            message: Some("allocation failed".to_string()),
        };
        let json = serde_json::to_vec(&error).expect("serialize");
        let parsed: WorkerErrorMessage = serde_json::from_slice(&json).expect("deserialize");
        assert_eq!(parsed, error);
        assert!(String::from_utf8_lossy(&json).contains("MEMORY_EXCEEDED"));
    }
}
