//! Tuple framing over a byte stream.
//!
//! Received bytes accumulate in a ring buffer; complete tuples are cut out
//! of it according to the configured framing mode. Incomplete tails stay
//! buffered until more bytes arrive or the source stops.

use bytes::{Buf, BytesMut};

use rill_core::config::TcpFraming;
use rill_core::error::{EngineError, Result};

pub struct FrameBuffer {
    framing: TcpFraming,
    buf: BytesMut,
    /// Parsed size prefix whose tuple bytes have not fully arrived yet.
    pending_size: Option<usize>,
}

impl FrameBuffer {
    pub fn new(framing: TcpFraming) -> Self {
        Self {
            framing,
            buf: BytesMut::with_capacity(2048),
            pending_size: None,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extracts the next complete tuple, or `None` when the buffered bytes
    /// do not contain one yet.
    pub fn next_tuple(&mut self) -> Result<Option<Vec<u8>>> {
        match self.framing {
            TcpFraming::TupleSeparator { separator } => {
                let Some(pos) = self.buf.iter().position(|b| *b == separator) else {
                    return Ok(None);
                };
                if pos == 0 {
                    self.buf.advance(1);
                    return Err(EngineError::protocol(
                        "empty tuple before separator".to_string(),
                    ));
                }
                let tuple = self.buf.split_to(pos).to_vec();
                self.buf.advance(1);
                Ok(Some(tuple))
            }
            TcpFraming::FixedSize { size } => {
                if self.buf.len() < size {
                    return Ok(None);
                }
                Ok(Some(self.buf.split_to(size).to_vec()))
            }
            TcpFraming::SizePrefix { digits } => {
                let size = match self.pending_size {
                    Some(size) => size,
                    None => {
                        if self.buf.len() < digits {
                            return Ok(None);
                        }
                        let prefix = self.buf.split_to(digits);
                        let text = std::str::from_utf8(&prefix).map_err(|_| {
                            EngineError::protocol("size prefix is not ASCII".to_string())
                        })?;
                        let size: usize = text.trim().parse().map_err(|_| {
                            EngineError::protocol(format!(
                                "size prefix {text:?} is not a decimal number"
                            ))
                        })?;
                        self.pending_size = Some(size);
                        size
                    }
                };
                if self.buf.len() < size {
                    return Ok(None);
                }
                self.pending_size = None;
                Ok(Some(self.buf.split_to(size).to_vec()))
            }
        }
    }
}
