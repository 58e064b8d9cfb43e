// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod framing;
pub mod protocol;
pub mod tls;

pub use framing::{FrameError, MessageChannel, DEFAULT_MAX_MESSAGE_BYTES};
pub use protocol::{
    CompletionReport, DispatcherReply, PlanResult, ReplyStatus, TaskSpec, WorkerMessage,
    INVALID_SCORE,
};

use tokio::io::{AsyncRead, AsyncWrite};

/// Any byte stream a [`MessageChannel`] can run over: plain TCP or TLS.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed stream so plain and TLS connections share one channel type.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Truncate `input` to at most `max` bytes on a char boundary, keeping the end.
pub fn tail(input: &str, max: usize) -> &str {
    if input.len() <= max {
        return input;
    }
    let mut start = input.len() - max;
    while !input.is_char_boundary(start) {
        start += 1;
    }
    &input[start..]
}

/// Short single-line excerpt of `input` for log fields.
pub fn snippet(input: &str, max: usize) -> String {
    let mut end = input.len().min(max);
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    let flat = input[..end].replace('\n', "\\n");
    if end < input.len() {
        format!("{}…", flat)
    } else {
        flat
    }
}
