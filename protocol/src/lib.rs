//! Wire types shared between the application server and its workers.
//!
//! The crate hides the framing details of the worker IPC channel behind a
//! typed API: request structs implement [`WorkerRequest`], which statically
//! pairs them with their response type, and the codec in [`codec`] moves the
//! raw frames. It also carries the package manifest and the host-facing API
//! models (forms, questions, attempts), since both sides of the pipe need
//! them.

mod attempt;
mod codec;
mod elements;
mod limits;
mod location;
mod manifest;
mod messages;
mod question;

pub use attempt::AttemptFile;
pub use attempt::AttemptModel;
pub use attempt::AttemptScoredModel;
pub use attempt::AttemptStartedModel;
pub use attempt::AttemptUi;
pub use attempt::CacheControl;
pub use attempt::ScoreModel;
pub use attempt::ScoringCode;
pub use codec::CodecError;
pub use codec::Frame;
pub use codec::FrameHeader;
pub use codec::HEADER_SIZE;
pub use codec::MAX_PAYLOAD_SIZE;
pub use codec::encode_payload;
pub use codec::read_frame;
pub use codec::read_frame_async;
pub use codec::write_frame;
pub use codec::write_frame_async;
pub use elements::CheckboxElement;
pub use elements::CheckboxGroupElement;
pub use elements::FormElement;
pub use elements::FormSection;
pub use elements::GroupElement;
pub use elements::HiddenElement;
pub use elements::OptionsFormDefinition;
pub use elements::RadioGroupElement;
pub use elements::SelectElement;
pub use elements::SelectOption;
pub use elements::StaticTextElement;
pub use elements::TextInputElement;
pub use limits::WorkerResourceLimits;
pub use location::DirPackageLocation;
pub use location::FunctionPackageLocation;
pub use location::PackageLocation;
pub use location::ZipPackageLocation;
pub use manifest::Manifest;
pub use manifest::ManifestError;
pub use manifest::PackageFile;
pub use manifest::PackageType;
pub use messages::AttemptScored;
pub use messages::AttemptStarted;
pub use messages::AttemptViewed;
pub use messages::CreateQuestionFromOptions;
pub use messages::Exit;
pub use messages::GetManifest;
pub use messages::GetOptionsForm;
pub use messages::InitWorker;
pub use messages::LoadPackage;
pub use messages::MessageId;
pub use messages::MessageToServer;
pub use messages::MessageToWorker;
pub use messages::OptionsFormReturned;
pub use messages::PackageLoaded;
pub use messages::QuestionCreated;
pub use messages::RequestUser;
pub use messages::ReturnedManifest;
pub use messages::ScoreAttempt;
pub use messages::StartAttempt;
pub use messages::ViewAttempt;
pub use messages::WorkerBound;
pub use messages::WorkerErrorKind;
pub use messages::WorkerErrorMessage;
pub use messages::WorkerRequest;
pub use messages::WorkerStarted;
pub use question::PossibleResponse;
pub use question::QuestionModel;
pub use question::ScoringMethod;
pub use question::SubquestionModel;

pub const MIB: u64 = 1024 * 1024;

/// Hosts may persist question states of at most this size.
pub const MAX_QUESTION_STATE_SIZE: u64 = 2 * MIB;

/// Upper bound on the `main` part of a request body.
pub const MAX_MAIN_SIZE: u64 = 5 * MIB;

/// Default (and minimum) upper bound on uploaded package archives.
pub const DEFAULT_MAX_PACKAGE_SIZE: u64 = 20 * MIB;

/// File extension of package archives.
pub const PACKAGE_EXTENSION: &str = "qpy";

/// Subtree of a package archive that holds the distributable files.
pub const DIST_DIR: &str = "dist";

/// Manifest file name inside [`DIST_DIR`].
pub const MANIFEST_FILENAME: &str = "manifest.json";
