//! Delimiter framing for the stdio channel.
//!
//! A frame is `serialize(envelope) + "\n" + MESSAGE_DELIMITER`. The reader
//! side works over any chunking of the byte stream: it keeps the unterminated
//! tail in a buffer and resumes scanning from its own cursor, so a delimiter
//! split across reads is still found once both halves arrive.

use std::io;

use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{Envelope, MESSAGE_DELIMITER};

/// Stateful frame decoder.
///
/// Use it directly through [`FrameReader::read`], or as a [`Decoder`] under
/// `FramedRead`.
#[derive(Debug)]
pub struct FrameReader {
    /// `"\n" + delimiter`.
    pattern: Vec<u8>,
    /// Where the next search in the `Decoder` buffer starts.
    next_index: usize,
    /// Buffer owned by the reader when driven through `read`.
    buffer: BytesMut,
    /// Where the next search in `buffer` starts. Kept apart from
    /// `next_index` since the two buffers are unrelated.
    read_index: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self::with_delimiter(MESSAGE_DELIMITER)
    }

    pub fn with_delimiter(delimiter: &str) -> Self {
        let mut pattern = Vec::with_capacity(delimiter.len() + 1);
        pattern.push(b'\n');
        pattern.extend_from_slice(delimiter.as_bytes());
        Self {
            pattern,
            next_index: 0,
            buffer: BytesMut::new(),
            read_index: 0,
        }
    }

    /// Feed one chunk and emit every frame it completes, in order.
    ///
    /// Frames are handed to `on_frame` before the rest of the chunk is
    /// scanned. Whatever follows the last delimiter stays buffered.
    pub fn read(&mut self, chunk: impl AsRef<[u8]>, mut on_frame: impl FnMut(String)) {
        self.buffer.extend_from_slice(chunk.as_ref());
        while let Some(frame) = next_frame(&self.pattern, &mut self.read_index, &mut self.buffer) {
            on_frame(frame);
        }
    }

    /// Bytes received since the last emitted frame.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }
}

/// Split the next complete frame off `src`, resuming the search at `cursor`.
fn next_frame(pattern: &[u8], cursor: &mut usize, src: &mut BytesMut) -> Option<String> {
    let start = (*cursor).min(src.len());
    match find(&src[start..], pattern) {
        Some(offset) => {
            let end = start + offset;
            *cursor = 0;
            let frame = src.split_to(end + pattern.len());
            Some(decode_text(&frame[..end]))
        }
        None => {
            // The pattern may already have started in the last few bytes.
            *cursor = src.len().saturating_sub(pattern.len() - 1);
            None
        }
    }
}

impl Decoder for FrameReader {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(next_frame(&self.pattern, &mut self.next_index, src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = next_frame(&self.pattern, &mut self.next_index, src) {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            tracing::debug!(
                bytes = src.len(),
                "Discarding unterminated frame at end of stream"
            );
            src.clear();
        }
        self.next_index = 0;
        Ok(None)
    }
}

/// Frame encoder: JSON body, newline, delimiter.
#[derive(Debug, Default)]
pub struct FrameEncoder;

impl Encoder<Envelope> for FrameEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&Envelope>>::encode(self, &item, dst)
    }
}

impl Encoder<&Envelope> for FrameEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: &Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(id = %item.id(), json_size_bytes = json.len(), "Encoding frame");
        dst.reserve(json.len() + MESSAGE_DELIMITER.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        dst.put_slice(MESSAGE_DELIMITER.as_bytes());
        Ok(())
    }
}

fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "Frame is not valid UTF-8, decoding lossily");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
