//! Blocking client for polling a remote shard's replication server.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;

use crate::core::{
    ClusterName, ErrorCode, ErrorPayload, Limits, ReplicationMessages, ReplicationTask,
    TaskDescriptor, TaskId, Transience,
};

use super::frame::{FrameError, FrameReader, FrameWriter};
use super::proto::{
    GetMessages, GetTask, ProtoDecodeError, ProtoEncodeError, ReplEnvelope, ReplMessage,
    decode_envelope, encode_envelope,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("encode error: {0}")]
    Encode(#[from] ProtoEncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] ProtoDecodeError),
    #[error("server closed the connection")]
    Closed,
    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse {
        expected: &'static str,
        got: &'static str,
    },
    #[error("remote error: {0}")]
    Remote(ErrorPayload),
}

impl ClientError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::Io(_) | ClientError::Closed => ErrorCode::Unavailable,
            ClientError::Frame(err) => err.code(),
            ClientError::Encode(_) => ErrorCode::Internal,
            ClientError::Decode(_) | ClientError::UnexpectedResponse { .. } => {
                ErrorCode::InvalidRequest
            }
            ClientError::Remote(payload) => payload.code,
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            ClientError::Io(_) | ClientError::Closed => Transience::Retryable,
            ClientError::Frame(err) => err.transience(),
            ClientError::Remote(payload) => Transience::from_wire(payload.retryable),
            _ => Transience::Permanent,
        }
    }
}

pub struct ReplicationClient {
    reader: FrameReader<TcpStream>,
    writer: FrameWriter<TcpStream>,
    limits: Limits,
}

impl ReplicationClient {
    pub fn connect(addr: impl ToSocketAddrs, limits: Limits) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let reader_stream = stream.try_clone()?;
        Ok(Self {
            reader: FrameReader::new(reader_stream, limits.max_frame_bytes),
            writer: FrameWriter::new(stream, limits.max_frame_bytes),
            limits,
        })
    }

    /// Polls for tasks above `last_retrieved`, waiting at most `wait` on the
    /// server side when nothing is pending.
    pub fn get_messages(
        &mut self,
        polling_cluster: &ClusterName,
        last_retrieved: TaskId,
        wait: Option<Duration>,
    ) -> Result<ReplicationMessages, ClientError> {
        let request = ReplMessage::GetMessages(GetMessages {
            polling_cluster: polling_cluster.clone(),
            last_retrieved_message_id: last_retrieved,
            wait_timeout_ms: wait.map(|wait| u64::try_from(wait.as_millis()).unwrap_or(u64::MAX)),
        });
        match self.roundtrip(request)? {
            ReplMessage::Messages(messages) => Ok(messages),
            other => Err(unexpected("MESSAGES", &other)),
        }
    }

    pub fn get_task(&mut self, descriptor: &TaskDescriptor) -> Result<ReplicationTask, ClientError> {
        let request = ReplMessage::GetTask(GetTask {
            descriptor: descriptor.clone(),
        });
        match self.roundtrip(request)? {
            ReplMessage::Task(task) => Ok(task),
            other => Err(unexpected("TASK", &other)),
        }
    }

    fn roundtrip(&mut self, request: ReplMessage) -> Result<ReplMessage, ClientError> {
        let bytes = encode_envelope(&ReplEnvelope::v1(request))?;
        self.writer.write_frame(&bytes)?;
        let Some(response) = self.reader.read_next()? else {
            return Err(ClientError::Closed);
        };
        match decode_envelope(&response, &self.limits)?.message {
            ReplMessage::Error(payload) => Err(ClientError::Remote(payload)),
            message => Ok(message),
        }
    }
}

fn unexpected(expected: &'static str, got: &ReplMessage) -> ClientError {
    let got = match got {
        ReplMessage::GetMessages(_) => "GET_MESSAGES",
        ReplMessage::Messages(_) => "MESSAGES",
        ReplMessage::GetTask(_) => "GET_TASK",
        ReplMessage::Task(_) => "TASK",
        ReplMessage::Error(_) => "ERROR",
    };
    ClientError::UnexpectedResponse { expected, got }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_keep_code_and_retryability() {
        let err = ClientError::Remote(ErrorPayload::new(ErrorCode::Overloaded, "busy", true));
        assert_eq!(err.code(), ErrorCode::Overloaded);
        assert!(err.transience().is_retryable());

        let err = ClientError::Remote(
            ErrorPayload::new(ErrorCode::NotFound, "gone", false).with_task_id(TaskId::new(3)),
        );
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert!(!err.transience().is_retryable());
    }

    #[test]
    fn closed_connection_is_retryable() {
        assert_eq!(ClientError::Closed.code(), ErrorCode::Unavailable);
        assert!(ClientError::Closed.transience().is_retryable());
    }
}
