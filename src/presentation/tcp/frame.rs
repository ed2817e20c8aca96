//! TCP Frame Layer
//!
//! Wire layout, big-endian:
//!
//! ```text
//! +---------+----------+------------+-----------------+
//! | version | type     | length     | payload         |
//! | 1 byte  | 2 bytes  | 4 bytes    | `length` bytes  |
//! +---------+----------+------------+-----------------+
//! ```
//!
//! [`FrameParser`] accumulates arbitrary socket chunks and yields complete
//! frames. A declared length above the configured cap is rejected before
//! any payload byte is buffered. Frames completed ahead of a corrupt header
//! are still handed out alongside the error.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::shared::error::AppError;

/// Only protocol version spoken
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size
pub const HEADER_LEN: usize = 7;

/// Framing errors. Fatal to the connection: the byte stream cannot be
/// resynchronized.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Frame of {length} bytes exceeds the {max} byte limit")]
    TooLarge { length: usize, max: usize },
}

impl FrameError {
    /// Metric label
    pub fn kind(&self) -> &'static str {
        match self {
            FrameError::UnsupportedVersion(_) => "version",
            FrameError::TooLarge { .. } => "too_large",
        }
    }
}

impl From<FrameError> for AppError {
    fn from(err: FrameError) -> Self {
        AppError::Framing(err.to_string())
    }
}

/// One complete frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub message_type: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(message_type: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            payload: payload.into(),
        }
    }

    /// Serialize header and payload into one buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.version);
        buf.put_u16(self.message_type);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Frames completed by one chunk, plus the framing error that stopped
/// parsing, if any
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Parsed {
    pub frames: Vec<Frame>,
    pub error: Option<FrameError>,
}

impl Parsed {
    /// Frames only, failing if the chunk also carried a framing error
    pub fn into_result(self) -> Result<Vec<Frame>, FrameError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.frames),
        }
    }
}

/// Incremental frame parser
#[derive(Debug)]
pub struct FrameParser {
    buffer: BytesMut,
    max_frame_size: usize,
    failed: Option<FrameError>,
}

impl FrameParser {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(HEADER_LEN),
            max_frame_size,
            failed: None,
        }
    }

    /// Append a chunk and drain every complete frame it finishes.
    ///
    /// Parsing stops at the first corrupt header. Frames completed before it
    /// are returned together with the error, and every later call reports
    /// the same error without consuming input.
    pub fn feed(&mut self, chunk: &[u8]) -> Parsed {
        if let Some(e) = &self.failed {
            return Parsed {
                frames: Vec::new(),
                error: Some(e.clone()),
            };
        }
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while self.buffer.len() >= HEADER_LEN {
            let version = self.buffer[0];
            if version != PROTOCOL_VERSION {
                return self.fail(frames, FrameError::UnsupportedVersion(version));
            }
            let message_type = u16::from_be_bytes([self.buffer[1], self.buffer[2]]);
            let length = u32::from_be_bytes([
                self.buffer[3],
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
            ]) as usize;
            if length > self.max_frame_size {
                let max = self.max_frame_size;
                return self.fail(frames, FrameError::TooLarge { length, max });
            }
            if self.buffer.len() < HEADER_LEN + length {
                self.buffer.reserve(HEADER_LEN + length - self.buffer.len());
                break;
            }

            self.buffer.advance(HEADER_LEN);
            let payload = self.buffer.split_to(length).freeze();
            frames.push(Frame {
                version,
                message_type,
                payload,
            });
        }

        Parsed {
            frames,
            error: None,
        }
    }

    fn fail(&mut self, frames: Vec<Frame>, error: FrameError) -> Parsed {
        self.buffer.clear();
        self.failed = Some(error.clone());
        Parsed {
            frames,
            error: Some(error),
        }
    }

    /// Bytes held for an incomplete frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
