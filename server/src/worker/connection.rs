use qpy_protocol::CodecError;
use qpy_protocol::Frame;
use qpy_protocol::MessageId;
use qpy_protocol::MessageToWorker;
use qpy_protocol::encode_payload;
use qpy_protocol::read_frame_async;
use qpy_protocol::write_frame_async;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;

use super::error::WorkerError;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub(crate) enum ReceiveOutcome {
    Frame(Frame),
    /// The worker closed its end of the pipe; it has exited or is exiting.
    Eof,
}

/// Server end of one worker's framed channel, read side. Once a frame with
/// an id outside the worker→server range arrives, the stream is poisoned and
/// refuses further reads.
pub(crate) struct ConnectionReader {
    reader: BoxedReader,
    poisoned: bool,
}

impl ConnectionReader {
    pub fn new(reader: BoxedReader) -> Self {
        Self {
            reader,
            poisoned: false,
        }
    }

    pub async fn receive(&mut self) -> Result<ReceiveOutcome, WorkerError> {
        if self.poisoned {
            return Err(WorkerError::NotRunning);
        }

        let frame = match read_frame_async(&mut self.reader).await {
            Ok(frame) => frame,
            Err(CodecError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(ReceiveOutcome::Eof);
            }
            Err(CodecError::PayloadTooLarge(len)) => {
                self.poisoned = true;
                return Err(WorkerError::Io(format!("oversized frame of {len} bytes")));
            }
            Err(err) => return Err(WorkerError::Io(err.to_string())),
        };

        match MessageId::from_u32(frame.message_id) {
            Some(id) if id.is_server_bound() => Ok(ReceiveOutcome::Frame(frame)),
            _ => {
                self.poisoned = true;
                Err(WorkerError::InvalidMessageId {
                    message_id: frame.message_id,
                })
            }
        }
    }
}

/// Writes one typed message to the worker.
pub(crate) async fn send_message<M: MessageToWorker>(
    writer: &mut BoxedWriter,
    message: &M,
) -> Result<(), WorkerError> {
    let payload = encode_payload(message).map_err(|err| WorkerError::Io(err.to_string()))?;
    write_frame_async(writer, M::ID.as_u32(), &payload).await?;
    Ok(())
}
