//! Incremental framing of a raw byte stream into complete JSON values.
//!
//! Persistent sockets carry JSON messages back to back with no length prefix
//! or delimiter. [`MessageFramer`] accumulates raw chunks and hands out one
//! complete top-level value at a time, leaving any trailing partial value in
//! the buffer for the next chunk.

use serde_json::Value;

/// Outcome of a failed decode attempt that is not simply "need more bytes".
#[derive(Debug, thiserror::Error)]
#[error("malformed message at buffer offset {offset}: {source}")]
pub struct MalformedMessage {
    pub offset: usize,
    #[source]
    pub source: serde_json::Error,
}

/// Accumulation buffer for one listener epoch.
#[derive(Debug, Default)]
pub struct MessageFramer {
    buf: Vec<u8>,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a freshly read chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Decode one complete value from the front of the buffer.
    ///
    /// Returns `Ok(None)` when the buffer holds nothing or only an incomplete
    /// value. A syntax error is returned as [`MalformedMessage`]; the buffer is
    /// left untouched so the caller decides whether to [`reset`](Self::reset).
    pub fn next_message(&mut self) -> Result<Option<Value>, MalformedMessage> {
        let Some(start) = self.buf.iter().position(|b| !b.is_ascii_whitespace()) else {
            self.buf.clear();
            return Ok(None);
        };
        if start > 0 {
            self.buf.drain(..start);
        }

        let (outcome, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
            let outcome = stream.next();
            (outcome, stream.byte_offset())
        };

        match outcome {
            None => {
                self.buf.clear();
                Ok(None)
            }
            Some(Ok(value)) => {
                self.buf.drain(..consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(source)) => Err(MalformedMessage {
                offset: consumed,
                source,
            }),
        }
    }

    /// Drain every complete value currently buffered.
    pub fn drain_messages(&mut self) -> Result<Vec<Value>, MalformedMessage> {
        let mut out = Vec::new();
        while let Some(value) = self.next_message()? {
            out.push(value);
        }
        Ok(out)
    }

    /// Drop everything buffered.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Number of bytes waiting for the rest of their message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
