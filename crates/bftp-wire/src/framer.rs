use thiserror::Error;

use crate::{ErrorCode, Opcode, Packet, BLOCK_SIZE, DATA_HEADER_SIZE, MAX_PACKET_SIZE};

/// Framing violations.
///
/// `UnknownOpcode` is recoverable: the framer has already reset and the
/// session answers with an illegal-operation ERROR. Everything else leaves
/// the byte stream unparseable and is fatal to the connection.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("DATA declares {0} payload bytes, maximum is 512")]
    DataTooLong(usize),
    #[error("frame exceeds maximum packet size without completing")]
    Oversized,
    #[error("text payload is not valid UTF-8")]
    InvalidString,
}

impl FrameError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FrameError::UnknownOpcode(_))
    }
}

/// Incremental packet framer.
///
/// Accumulates one byte at a time and emits a [`Packet`] as soon as the
/// opcode-specific completion rule is satisfied, then resets for the next
/// frame. One `Framer` instance serves one connection direction.
#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one byte from the stream. Returns `Ok(Some(packet))` exactly
    /// when the byte completes a frame, `Ok(None)` otherwise. On any error
    /// the internal buffer has been reset.
    pub fn feed(&mut self, byte: u8) -> Result<Option<Packet>, FrameError> {
        self.buf.push(byte);
        if self.buf.len() < 2 {
            return Ok(None);
        }

        let raw = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        let opcode = match Opcode::from_u16(raw) {
            Some(op) => op,
            None => {
                self.buf.clear();
                return Err(FrameError::UnknownOpcode(raw));
            }
        };

        let complete = match opcode {
            // Text-terminated: NUL after the fixed header.
            Opcode::Rrq | Opcode::Wrq | Opcode::Logrq | Opcode::Delrq => {
                self.buf.len() > 2 && byte == 0
            }
            Opcode::Error => self.buf.len() > 4 && byte == 0,
            Opcode::Bcast => self.buf.len() > 3 && byte == 0,
            // Fixed-size.
            Opcode::Ack => self.buf.len() == 4,
            Opcode::Dirq | Opcode::Disc => self.buf.len() == 2,
            // Header declares the payload length.
            Opcode::Data => {
                if self.buf.len() < 4 {
                    false
                } else {
                    let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
                    if len > BLOCK_SIZE {
                        self.buf.clear();
                        return Err(FrameError::DataTooLong(len));
                    }
                    self.buf.len() == DATA_HEADER_SIZE + len
                }
            }
        };

        if complete {
            let packet = parse(opcode, &self.buf);
            self.buf.clear();
            return packet.map(Some);
        }

        if self.buf.len() >= MAX_PACKET_SIZE {
            self.buf.clear();
            return Err(FrameError::Oversized);
        }
        Ok(None)
    }
}

fn parse(opcode: Opcode, buf: &[u8]) -> Result<Packet, FrameError> {
    Ok(match opcode {
        Opcode::Rrq => Packet::Rrq {
            filename: text(&buf[2..])?,
        },
        Opcode::Wrq => Packet::Wrq {
            filename: text(&buf[2..])?,
        },
        Opcode::Logrq => Packet::Logrq {
            username: text(&buf[2..])?,
        },
        Opcode::Delrq => Packet::Delrq {
            filename: text(&buf[2..])?,
        },
        Opcode::Data => Packet::Data {
            block: u16::from_be_bytes([buf[4], buf[5]]),
            payload: buf[DATA_HEADER_SIZE..].to_vec(),
        },
        Opcode::Ack => Packet::Ack {
            block: u16::from_be_bytes([buf[2], buf[3]]),
        },
        Opcode::Error => Packet::Error {
            code: ErrorCode::from_u16(u16::from_be_bytes([buf[2], buf[3]])),
            message: text(&buf[4..])?,
        },
        Opcode::Bcast => Packet::Bcast {
            added: buf[2] != 0,
            filename: text(&buf[3..])?,
        },
        Opcode::Dirq => Packet::Dirq,
        Opcode::Disc => Packet::Disc,
    })
}

/// Decode a NUL-terminated UTF-8 field (the terminator is the last byte of
/// the frame).
fn text(bytes: &[u8]) -> Result<String, FrameError> {
    let body = &bytes[..bytes.len() - 1];
    String::from_utf8(body.to_vec()).map_err(|_| FrameError::InvalidString)
}
