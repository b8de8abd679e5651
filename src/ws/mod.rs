//! RFC 6455 WebSocket framing, implemented from scratch on top of any
//! `AsyncRead + AsyncWrite` byte stream.
//!
//! The server obtains the raw stream by hijacking an HTTP/1.1 connection
//! after the upgrade handshake (see [`upgrade`]). One [`WebSocket`] owns the
//! connection: a read state machine behind one lock and a write path behind
//! another, so reads and writes never block each other. At most one frame
//! writer is in flight at any time; a violation is a programmer error and
//! aborts the process.

mod conn;
mod mask;
pub mod upgrade;

pub use conn::{Message, WebSocket};

use std::time::Duration;

use thiserror::Error;

/// Frame opcodes from RFC 6455 section 5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

impl Opcode {
    pub(crate) fn from_u8(value: u8) -> Option<Opcode> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xa => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }

    pub fn is_data(self) -> bool {
        matches!(self, Opcode::Text | Opcode::Binary)
    }
}

/// Which side of the connection this socket plays. Servers must receive
/// masked frames and send unmasked ones; clients the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("websocket: {0}")]
    Protocol(String),

    /// The peer sent a close frame. Carries the validated close code and
    /// UTF-8 reason.
    #[error("websocket: peer closed: code={code}, reason={reason:?}")]
    Closed { code: u16, reason: String },

    #[error("websocket: read limit exceeded")]
    ReadLimit,

    #[error("websocket: close frame already sent")]
    CloseSent,

    #[error("websocket: write timeout")]
    WriteTimeout,

    #[error("websocket: invalid control frame")]
    InvalidControlFrame,

    #[error("websocket: unexpected end of stream")]
    UnexpectedEof,

    #[error("websocket handshake: {0}")]
    Handshake(String),

    #[error("websocket io: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::UnexpectedEof
        } else {
            Error::Io(err.to_string())
        }
    }
}

pub const CLOSE_NORMAL_CLOSURE: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;
/// Synthesized when a close frame arrives with an empty payload; never sent.
pub const CLOSE_NO_STATUS_RECEIVED: u16 = 1005;
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;

pub(crate) const MAX_FRAME_HEADER_SIZE: usize = 2 + 8 + 4;
pub(crate) const MAX_CONTROL_PAYLOAD_SIZE: usize = 125;
pub(crate) const READ_BUFFER_SIZE: usize = 4096;
pub(crate) const WRITE_BUFFER_SIZE: usize = 4096;

/// Default cap on an inbound message; signaling and chat traffic is tiny.
/// `set_read_limit(0)` disables the cap.
pub const DEFAULT_READ_LIMIT: u64 = 64 * 1024;

/// Grace period for best-effort control writes (close echoes, pong replies).
pub(crate) const CONTROL_WRITE_WAIT: Duration = Duration::from_secs(1);

/// Close codes we accept from the wire, per RFC 6455 section 7.4.
pub fn is_valid_received_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

/// Builds a close frame payload: 16-bit big-endian code followed by the
/// UTF-8 reason.
pub fn format_close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trip() {
        for opcode in [
            Opcode::Continuation,
            Opcode::Text,
            Opcode::Binary,
            Opcode::Close,
            Opcode::Ping,
            Opcode::Pong,
        ] {
            assert_eq!(Opcode::from_u8(opcode as u8), Some(opcode));
        }
        assert_eq!(Opcode::from_u8(0x3), None);
        assert_eq!(Opcode::from_u8(0xb), None);
    }

    #[test]
    fn received_close_code_ranges() {
        assert!(is_valid_received_close_code(CLOSE_NORMAL_CLOSURE));
        assert!(is_valid_received_close_code(CLOSE_MESSAGE_TOO_BIG));
        assert!(is_valid_received_close_code(3000));
        assert!(is_valid_received_close_code(4999));
        assert!(!is_valid_received_close_code(999));
        assert!(!is_valid_received_close_code(1004));
        assert!(!is_valid_received_close_code(CLOSE_NO_STATUS_RECEIVED));
        assert!(!is_valid_received_close_code(1006));
        assert!(!is_valid_received_close_code(5000));
    }

    #[test]
    fn close_payload_layout() {
        let payload = format_close_payload(CLOSE_PROTOCOL_ERROR, "bad MASK");
        assert_eq!(&payload[..2], &[0x03, 0xea]);
        assert_eq!(&payload[2..], b"bad MASK");
    }
}
