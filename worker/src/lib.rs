//! The isolated executor that loads one package and answers typed requests
//! over a length-framed channel.
//!
//! The runtime is deliberately synchronous and single-threaded: it reads one
//! frame, dispatches it, writes one frame, repeats. All concurrency lives on
//! the server side of the pipe.

mod limits;
mod package;
mod qtype;
mod runtime;

pub use limits::apply_memory_limit;
pub use package::LoadedPackage;
pub use package::PackageOpenError;
pub use qtype::QuestionType;
pub use qtype::QuestionTypeError;
pub use qtype::QuestionTypeFactory;
pub use qtype::register_question_type;
pub use runtime::RuntimeError;
pub use runtime::WorkerRuntime;

/// Worker type tag for process-isolated workers; memory limits apply.
pub const WORKER_TYPE_PROCESS: &str = "process";

/// Worker type tag for in-process debug workers; no rlimit is applied since
/// that would constrain the host process.
pub const WORKER_TYPE_THREAD: &str = "thread";
