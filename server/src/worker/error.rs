use qpy_protocol::WorkerErrorKind;
use qpy_protocol::WorkerErrorMessage;

/// Everything that can go wrong between the server and one worker. The
/// `temporary` bit travels with each failure so callers can decide whether a
/// retry could ever help.
#[derive(thiserror::Error, Debug, Clone)]
pub enum WorkerError {
    #[error("worker is not running")]
    NotRunning,

    #[error("worker failed to start: {reason}")]
    Start { reason: String, temporary: bool },

    #[error("worker exceeded its CPU time limit of {limit_seconds}s")]
    CpuTimeLimitExceeded { limit_seconds: f64 },

    #[error("worker exceeded its real time limit of {limit_seconds}s")]
    RealTimeLimitExceeded { limit_seconds: f64 },

    #[error("worker exceeded its memory limit")]
    MemoryExceeded { message: Option<String> },

    /// Unhandled failure inside package code, reported by the worker.
    #[error("package code failed: {message}")]
    Package { message: String },

    /// The worker sent a frame this side cannot interpret; the stream is
    /// poisoned and the worker gets killed.
    #[error("worker sent a frame with unknown message id {message_id}")]
    InvalidMessageId { message_id: u32 },

    #[error("static file '{path}' has size {actual} on disk but {expected} in the manifest")]
    StaticFileSizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("static file not found: {0}")]
    StaticFileNotFound(String),

    #[error("worker io failure: {0}")]
    Io(String),

    #[error("worker sent an undecodable response: {0}")]
    Decode(String),
}

impl WorkerError {
    pub fn temporary(&self) -> bool {
        match self {
            Self::NotRunning
            | Self::CpuTimeLimitExceeded { .. }
            | Self::RealTimeLimitExceeded { .. }
            | Self::MemoryExceeded { .. }
            | Self::InvalidMessageId { .. }
            | Self::Io(_) => true,
            Self::Start { temporary, .. } => *temporary,
            Self::Package { .. }
            | Self::StaticFileSizeMismatch { .. }
            | Self::StaticFileNotFound(_)
            | Self::Decode(_) => false,
        }
    }

    /// Server-side form of a structured error frame.
    pub fn from_wire(report: &WorkerErrorMessage) -> Self {
        match report.kind {
            WorkerErrorKind::MemoryExceeded => Self::MemoryExceeded {
                message: report.message.clone(),
            },
            WorkerErrorKind::Unknown => Self::Package {
                message: report
                    .message
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            },
        }
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
