//! # bftp-wire
//!
//! Wire protocol for bftp: a TFTP-like file-transfer protocol carried over a
//! persistent TCP connection.
//!
//! All packets start with a big-endian 16-bit opcode. The rest of the frame
//! is opcode-specific: NUL-terminated UTF-8 text, fixed-width fields, or a
//! length-prefixed data block. [`Framer`] turns the raw octet stream into
//! [`Packet`] values one byte at a time; [`Packet::encode`] is the lossless
//! inverse.

mod framer;
mod packet;

pub use framer::{FrameError, Framer};
pub use packet::{ErrorCode, Opcode, Packet};

/// Maximum payload of one DATA block. A payload shorter than this marks the
/// final block of a transfer.
pub const BLOCK_SIZE: usize = 512;

/// DATA header: opcode(2) + length(2) + block(2).
pub const DATA_HEADER_SIZE: usize = 6;

/// Upper bound on any frame; a buffer reaching this size without completing
/// is a protocol violation.
pub const MAX_PACKET_SIZE: usize = DATA_HEADER_SIZE + BLOCK_SIZE;
