//! Incremental decoder for the framed record stream.
//!
//! The controller answers with a sequence of self-delimiting JSON messages.
//! Chunks from the HTTP body are appended to an internal buffer and records
//! are pulled out one decode call at a time. Running out of buffered bytes is
//! not an error; only malformed input or a truncated tail at end of body is.

use serde_json::Value;
use thiserror::Error;

use crate::record::{Record, RecordError, RecordType};

/// Errors raised while decoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The buffered bytes are not valid JSON.
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    /// A frame decoded but is not a valid record.
    #[error(transparent)]
    Record(#[from] RecordError),

    /// The body ended in the middle of a frame.
    #[error("stream ended inside a frame ({pending} bytes pending)")]
    Truncated { pending: usize },
}

/// Accumulates body chunks and yields decoded records.
///
/// Object and array frames are delimited by a byte scanner that keeps its
/// position between calls, so each buffered byte is examined once no matter
/// how many chunks a frame arrives in. Only complete frames reach the JSON
/// parser.
#[derive(Debug)]
pub struct FrameDecoder {
    kind: RecordType,
    buffer: Vec<u8>,
    scan: Scan,
}

/// Progress of the delimiter scan over the current frame.
#[derive(Debug, Default)]
struct Scan {
    /// Next buffer offset to examine.
    pos: usize,
    /// Offset of the opening bracket, once seen.
    start: Option<usize>,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl FrameDecoder {
    pub fn new(kind: RecordType) -> Self {
        Self {
            kind,
            buffer: Vec::new(),
            scan: Scan::default(),
        }
    }

    /// Append a chunk of body bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Decode the next complete frame.
    ///
    /// Returns `Ok(None)` when no complete frame is buffered yet.
    pub fn next_record(&mut self) -> Result<Option<Record>, FrameError> {
        if self.scan.start.is_none() {
            let Some(offset) = self.buffer[self.scan.pos..]
                .iter()
                .position(|b| !b.is_ascii_whitespace())
            else {
                self.buffer.clear();
                self.scan = Scan::default();
                return Ok(None);
            };
            let first = self.scan.pos + offset;
            self.scan.pos = first;

            match self.buffer[first] {
                b'{' | b'[' => self.scan.start = Some(first),
                // Scalars never form a valid record; let the parser report them
                _ => return self.decode_scalar(first),
            }
        }

        let Some(end) = self.find_frame_end() else {
            return Ok(None);
        };
        let start = self.scan.start.unwrap_or(0);
        let value: Value =
            serde_json::from_slice(&self.buffer[start..end]).map_err(FrameError::Malformed)?;

        self.buffer.drain(..end);
        self.scan = Scan::default();
        Ok(Some(Record::from_value(self.kind, value)?))
    }

    /// Advance the scan; returns the offset just past the closing bracket.
    fn find_frame_end(&mut self) -> Option<usize> {
        let scan = &mut self.scan;
        while scan.pos < self.buffer.len() {
            let byte = self.buffer[scan.pos];
            scan.pos += 1;

            if scan.in_string {
                if scan.escaped {
                    scan.escaped = false;
                } else if byte == b'\\' {
                    scan.escaped = true;
                } else if byte == b'"' {
                    scan.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => scan.in_string = true,
                b'{' | b'[' => scan.depth += 1,
                b'}' | b']' => {
                    scan.depth = scan.depth.saturating_sub(1);
                    if scan.depth == 0 {
                        return Some(scan.pos);
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn decode_scalar(&mut self, first: usize) -> Result<Option<Record>, FrameError> {
        let (value, consumed) = {
            let mut frames =
                serde_json::Deserializer::from_slice(&self.buffer[first..]).into_iter::<Value>();
            match frames.next() {
                Some(Ok(value)) => (value, first + frames.byte_offset()),
                Some(Err(e)) if e.is_eof() => return Ok(None),
                Some(Err(e)) => return Err(FrameError::Malformed(e)),
                None => return Ok(None),
            }
        };

        self.buffer.drain(..consumed);
        self.scan = Scan::default();
        Ok(Some(Record::from_value(self.kind, value)?))
    }

    /// Check the tail once the body has ended.
    pub fn finish(&self) -> Result<(), FrameError> {
        let pending = self
            .buffer
            .iter()
            .filter(|b| !b.is_ascii_whitespace())
            .count();
        if pending == 0 {
            Ok(())
        } else {
            Err(FrameError::Truncated {
                pending: self.buffer.len(),
            })
        }
    }

    /// Number of bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
