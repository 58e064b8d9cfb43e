//! Newline-delimited JSON over any byte stream.
//!
//! One document per line, serialised without embedded newlines. Reads are
//! bounded so a peer cannot grow the buffer without limit.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{
    split, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    ReadHalf, WriteHalf,
};

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("malformed message: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
        raw: String,
    },
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

impl FrameError {
    /// Whether the stream is still usable after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::Decode { .. })
    }
}

/// Bidirectional message channel over a stream.
pub struct MessageChannel<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    max_message_bytes: usize,
    line: Vec<u8>,
}

impl<S> MessageChannel<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S) -> Self {
        Self::with_limit(stream, DEFAULT_MAX_MESSAGE_BYTES)
    }

    pub fn with_limit(stream: S, max_message_bytes: usize) -> Self {
        let (reader, writer) = split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            max_message_bytes,
            line: Vec::new(),
        }
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), FrameError> {
        let mut encoded = serde_json::to_string(message).map_err(FrameError::Encode)?;
        encoded.push('\n');
        self.writer.write_all(encoded.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next document, or `None` once the peer has closed the stream.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        loop {
            self.line.clear();
            let limit = self.max_message_bytes as u64 + 1;
            let read = (&mut self.reader)
                .take(limit)
                .read_until(b'\n', &mut self.line)
                .await?;
            if read == 0 {
                return Ok(None);
            }
            if !self.line.ends_with(b"\n") && read > self.max_message_bytes {
                return Err(FrameError::TooLarge {
                    limit: self.max_message_bytes,
                });
            }

            // Bytes, not text: invalid UTF-8 is a decode error like any other.
            let raw = self.line.trim_ascii();
            if raw.is_empty() {
                continue;
            }
            return serde_json::from_slice(raw)
                .map(Some)
                .map_err(|source| FrameError::Decode {
                    source,
                    raw: String::from_utf8_lossy(raw).into_owned(),
                });
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DispatcherReply, WorkerMessage};
    use tokio::io::duplex;

    #[tokio::test]
    async fn messages_cross_a_duplex_pipe() {
        let (a, b) = duplex(4096);
        let mut worker = MessageChannel::new(a);
        let mut dispatcher = MessageChannel::new(b);

        worker.send(&WorkerMessage::Ready).await.unwrap();
        let received: WorkerMessage = dispatcher.recv().await.unwrap().unwrap();
        assert_eq!(received, WorkerMessage::Ready);

        dispatcher.send(&DispatcherReply::assignment(None)).await.unwrap();
        let reply: DispatcherReply = worker.recv().await.unwrap().unwrap();
        assert_eq!(reply.task, Some(None));
    }

    #[tokio::test]
    async fn closed_peer_yields_none() {
        let (a, b) = duplex(64);
        drop(a);
        let mut channel = MessageChannel::new(b);
        let received: Option<WorkerMessage> = channel.recv().await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn malformed_line_leaves_stream_usable() {
        let (mut a, b) = duplex(4096);
        a.write_all(b"{not json\n{\"status\":\"ready\"}\n").await.unwrap();
        let mut channel = MessageChannel::new(b);

        let err = channel.recv::<WorkerMessage>().await.unwrap_err();
        assert!(err.is_recoverable());

        let next: WorkerMessage = channel.recv().await.unwrap().unwrap();
        assert_eq!(next, WorkerMessage::Ready);
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_recoverable_decode_error() {
        let (mut a, b) = duplex(4096);
        a.write_all(b"{\"status\":\"re\xffdy\"}\n\xfe\xfe\n{\"status\":\"ready\"}\n")
            .await
            .unwrap();
        let mut channel = MessageChannel::new(b);

        for _ in 0..2 {
            let err = channel.recv::<WorkerMessage>().await.unwrap_err();
            assert!(matches!(err, FrameError::Decode { .. }));
            assert!(err.is_recoverable());
        }
        let next: WorkerMessage = channel.recv().await.unwrap().unwrap();
        assert_eq!(next, WorkerMessage::Ready);
    }

    #[tokio::test]
    async fn oversized_line_is_rejected() {
        let (mut a, b) = duplex(4096);
        let mut channel = MessageChannel::with_limit(b, 16);
        a.write_all(b"{\"status\":\"ready\",\"padding\":\"xxxxxxxx\"}\n")
            .await
            .unwrap();

        let err = channel.recv::<WorkerMessage>().await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { limit: 16 }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn unterminated_final_document_is_accepted() {
        let (mut a, b) = duplex(4096);
        a.write_all(b"{\"status\":\"ready\"}").await.unwrap();
        drop(a);
        let mut channel = MessageChannel::new(b);
        let msg: WorkerMessage = channel.recv().await.unwrap().unwrap();
        assert_eq!(msg, WorkerMessage::Ready);
    }
}
