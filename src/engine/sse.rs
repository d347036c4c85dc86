//! Incremental Server-Sent Events decoding for engine responses.
//!
//! Engine responses arrive as SSE over HTTP with bytes chunked at
//! arbitrary boundaries. This adapter buffers the bytes, splits lines
//! (both `\n` and `\r\n`), and assembles `data:` lines into frames
//! delimited by blank lines. Comments and fields the engine adapter
//! never reads (`id:`, `retry:`) are skipped. Lines are converted to
//! text only once complete, so multi-byte characters split across
//! chunks survive intact.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;

// ============================================================================
// Frames
// ============================================================================

/// One assembled SSE frame: the event name, if any, and the joined
/// `data:` payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

enum Line<'a> {
    Data(&'a str),
    Event(&'a str),
    Blank,
    Skip,
}

fn classify(line: &str) -> Line<'_> {
    if line.is_empty() {
        return Line::Blank;
    }
    if let Some(rest) = line.strip_prefix("data:") {
        return Line::Data(rest.strip_prefix(' ').unwrap_or(rest));
    }
    if let Some(rest) = line.strip_prefix("event:") {
        return Line::Event(rest.strip_prefix(' ').unwrap_or(rest));
    }
    // Comments, id:, retry:, and unknown fields.
    Line::Skip
}

// ============================================================================
// SseFrameStream
// ============================================================================

/// Stream adapter turning a byte stream into [`SseFrame`]s.
pub struct SseFrameStream<S> {
    inner: S,
    buffer: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
    done: bool,
}

impl<S> SseFrameStream<S> {
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            event: None,
            data_lines: Vec::new(),
            done: false,
        }
    }

    /// Pop the next complete line off the buffer, stripping the newline
    /// and any trailing `\r`.
    fn take_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Feed one line into the frame under assembly. A blank line
    /// completes the frame if it has any content.
    fn push_line(&mut self, line: &str) -> Option<SseFrame> {
        match classify(line) {
            Line::Blank => self.flush(),
            Line::Data(data) => {
                self.data_lines.push(data.to_string());
                None
            }
            Line::Event(event) => {
                self.event = Some(event.to_string());
                None
            }
            Line::Skip => None,
        }
    }

    fn flush(&mut self) -> Option<SseFrame> {
        if self.event.is_none() && self.data_lines.is_empty() {
            return None;
        }
        Some(SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        })
    }
}

impl<S, E> Stream for SseFrameStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<SseFrame, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        loop {
            while let Some(line) = self.take_line() {
                if let Some(frame) = self.push_line(&line) {
                    return Poll::Ready(Some(Ok(frame)));
                }
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.buffer.extend_from_slice(&bytes);
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    self.done = true;
                    // Flush a final frame when the stream ends without a
                    // trailing blank line.
                    if !self.buffer.is_empty() {
                        let mut rest = std::mem::take(&mut self.buffer);
                        if rest.last() == Some(&b'\r') {
                            rest.pop();
                        }
                        let line = String::from_utf8_lossy(&rest).into_owned();
                        if let Some(frame) = self.push_line(&line) {
                            return Poll::Ready(Some(Ok(frame)));
                        }
                    }
                    return Poll::Ready(self.flush().map(Ok));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
