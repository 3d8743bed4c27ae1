//! Buffered byte-stream I/O over pluggable channels
//!
//! This module provides:
//! - `IoChannel` trait so buffering does not care whether bytes cross a raw
//!   socket or a wrapping layer
//! - `BufferedStream` with exact, line and until-closed receive patterns and
//!   chunked sends

mod buffered;
mod channel;

#[cfg(test)]
pub(crate) mod test_utils;

pub use buffered::{
    BUFFER_SIZE, BufferedStream, InvalidPattern, ReceivePattern, STEP_SIZE, StreamStats,
    send_range,
};
pub use channel::{IoChannel, SocketChannel};
