use crate::BLOCK_SIZE;

/// Protocol opcodes. Closed set; anything else on the wire is rejected at
/// the framing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Dirq = 6,
    Logrq = 7,
    Delrq = 8,
    Bcast = 9,
    Disc = 10,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Opcode> {
        match value {
            1 => Some(Opcode::Rrq),
            2 => Some(Opcode::Wrq),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            6 => Some(Opcode::Dirq),
            7 => Some(Opcode::Logrq),
            8 => Some(Opcode::Delrq),
            9 => Some(Opcode::Bcast),
            10 => Some(Opcode::Disc),
            _ => None,
        }
    }
}

/// Error codes carried inside ERROR packets. Server-assigned, not the
/// standard TFTP set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    IllegalOperation = 4,
    FileExists = 5,
    NotLoggedIn = 6,
    AlreadyLoggedIn = 7,
}

impl ErrorCode {
    /// Decode-side mapping; codes the server never emits collapse to
    /// `NotDefined`.
    pub fn from_u16(value: u16) -> ErrorCode {
        match value {
            1 => ErrorCode::FileNotFound,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::FileExists,
            6 => ErrorCode::NotLoggedIn,
            7 => ErrorCode::AlreadyLoggedIn,
            _ => ErrorCode::NotDefined,
        }
    }
}

/// One framed protocol packet. Immutable once decoded; ownership moves to
/// whichever component consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Read request: download `filename` from the server store.
    Rrq { filename: String },
    /// Write request: upload `filename` to the server store.
    Wrq { filename: String },
    /// One transfer block. `payload` is at most [`BLOCK_SIZE`] bytes; a
    /// shorter (possibly empty) payload terminates the transfer.
    Data { block: u16, payload: Vec<u8> },
    /// Acknowledge `block`; block 0 acknowledges a request itself.
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
    /// Directory listing request.
    Dirq,
    Logrq { username: String },
    Delrq { filename: String },
    /// Server push: the file set changed. `added` is false for a deletion.
    Bcast { added: bool, filename: String },
    Disc,
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq { .. } => Opcode::Rrq,
            Packet::Wrq { .. } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::Dirq => Opcode::Dirq,
            Packet::Logrq { .. } => Opcode::Logrq,
            Packet::Delrq { .. } => Opcode::Delrq,
            Packet::Bcast { .. } => Opcode::Bcast,
            Packet::Disc => Opcode::Disc,
        }
    }

    /// Serialize to wire bytes. Structural inverse of the framer: feeding
    /// the result back through [`crate::Framer`] yields an equal packet.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.opcode() as u16).to_be_bytes());
        match self {
            Packet::Rrq { filename }
            | Packet::Wrq { filename }
            | Packet::Delrq { filename } => push_text(&mut out, filename),
            Packet::Logrq { username } => push_text(&mut out, username),
            Packet::Data { block, payload } => {
                debug_assert!(payload.len() <= BLOCK_SIZE);
                out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                out.extend_from_slice(&block.to_be_bytes());
                out.extend_from_slice(payload);
            }
            Packet::Ack { block } => out.extend_from_slice(&block.to_be_bytes()),
            Packet::Error { code, message } => {
                out.extend_from_slice(&(*code as u16).to_be_bytes());
                push_text(&mut out, message);
            }
            Packet::Bcast { added, filename } => {
                out.push(u8::from(*added));
                push_text(&mut out, filename);
            }
            Packet::Dirq | Packet::Disc => {}
        }
        out
    }
}

fn push_text(out: &mut Vec<u8>, text: &str) {
    out.extend_from_slice(text.as_bytes());
    out.push(0);
}
