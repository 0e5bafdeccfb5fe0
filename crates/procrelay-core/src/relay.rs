//! Line relay between process pipes and consumers.
//!
//! Output is line-buffered: the consumers are textual command-line tools, so
//! a line is the unit of delivery. Binary streams are not supported.

use crate::error::RelayError;
use std::io;
use std::ops::ControlFlow;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_stream::{Stream, StreamExt};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::debug;

/// Longest line delivered in one piece; longer runs are split at this size.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Splits a byte stream on `\n`, dropping a trailing `\r` and decoding each
/// line as lossy UTF-8. A final unterminated line is emitted at end of stream.
///
/// A line longer than the maximum length is flushed in pieces of that size,
/// so a child that never writes a newline cannot grow the buffer unbounded.
#[derive(Debug)]
pub struct LineCodec {
    next_index: usize,
    max_length: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length: max_length.max(1),
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // A newline right after a full-length line still terminates it.
        let limit = src.len().min(self.max_length + 1);
        match src[self.next_index..limit].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let newline = self.next_index + offset;
                self.next_index = 0;
                let line = src.split_to(newline + 1);
                Ok(Some(decode_line(&line[..newline])))
            }
            None if src.len() > self.max_length => {
                self.next_index = 0;
                let piece = src.split_to(self.max_length);
                Ok(Some(decode_line(&piece)))
            }
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        if src.is_empty() {
            return Ok(None);
        }

        self.next_index = 0;
        let rest = src.split_to(src.len());
        Ok(Some(decode_line(&rest)))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Lazy, finite sequence of the lines of `reader`.
///
/// Ends at end of stream; a read error also ends it, as a normal closure.
pub fn lines<R: AsyncRead + Unpin>(reader: R) -> impl Stream<Item = String> + Unpin {
    FramedRead::new(reader, LineCodec::new()).map_while(|frame| match frame {
        Ok(line) => Some(line),
        Err(e) => {
            debug!("Stream closed by read error: {}", e);
            None
        }
    })
}

/// Pump `reader` line by line into `on_line` in arrival order.
///
/// Returns the number of lines delivered once the stream closes or the
/// callback breaks. Never fails.
pub async fn stream_output<R, F>(reader: R, mut on_line: F) -> usize
where
    R: AsyncRead + Unpin,
    F: FnMut(String) -> ControlFlow<()>,
{
    let mut lines = lines(reader);
    let mut delivered = 0;

    while let Some(line) = lines.next().await {
        delivered += 1;
        if on_line(line).is_break() {
            break;
        }
    }

    delivered
}

/// Write `text` plus a line terminator in a single write, then flush.
pub async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> Result<(), RelayError> {
    let mut buffer = String::with_capacity(text.len() + 1);
    buffer.push_str(text);
    buffer.push('\n');

    writer
        .write_all(buffer.as_bytes())
        .await
        .map_err(|e| RelayError::Write(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| RelayError::Write(e.to_string()))
}
