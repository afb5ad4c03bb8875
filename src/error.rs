//! Error types for the etherdream-net crate.

use std::error::Error as StdError;
use std::{fmt, io};

use crate::protocol::StatusFrame;

/// Everything that can go wrong while talking to a DAC.
///
/// None of these are fatal to the process: connection-level failures tear
/// down one `DeviceConnection`, and per-command failures end one tick of the
/// streaming loop.
#[derive(Debug)]
pub enum Error {
    /// The TCP connect attempt did not complete within its deadline.
    ConnectTimeout,

    /// The socket failed while connecting, reading or writing.
    Socket(io::Error),

    /// Fewer bytes than a full 22-byte status frame were supplied to the
    /// decoder. Recoverable by buffering more input.
    MalformedFrame,

    /// The DAC answered a command with something other than ACK.
    Nak(Nak),

    /// No matching response frame arrived within the deadline.
    ResponseTimeout,

    /// The connection was torn down while the request was outstanding.
    ConnectionClosed,
}

/// The non-ACK response codes a DAC can return.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Nak {
    /// Generic refusal (`N`).
    Refused,
    /// The device buffer is full (`F`).
    Full,
    /// The command was invalid in the current state (`I`).
    Invalid,
    /// The light engine is in emergency stop (`!`).
    EmergencyStop,
    /// A response code outside the documented set. Treated as a protocol
    /// violation but surfaced like any other NAK rather than killing the
    /// connection.
    Unknown(u8),
}

impl Nak {
    /// Classifies a response code, returning `None` for ACK.
    pub fn from_response(code: u8) -> Option<Self> {
        Some(match code {
            StatusFrame::ACK => return None,
            StatusFrame::NAK => Nak::Refused,
            StatusFrame::NAK_FULL => Nak::Full,
            StatusFrame::NAK_INVALID => Nak::Invalid,
            StatusFrame::NAK_ESTOP => Nak::EmergencyStop,
            other => Nak::Unknown(other),
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConnectTimeout => write!(f, "connect attempt timed out"),
            Error::Socket(err) => write!(f, "socket error: {}", err),
            Error::MalformedFrame => write!(f, "not enough bytes for a status frame"),
            Error::Nak(nak) => nak.fmt(f),
            Error::ResponseTimeout => write!(f, "timed out waiting for a response"),
            Error::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl fmt::Display for Nak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Nak::Refused => write!(f, "DAC responded with \"NAK\""),
            Nak::Full => write!(f, "DAC responded with \"NAK - Full\""),
            Nak::Invalid => write!(f, "DAC responded with \"NAK - Invalid\""),
            Nak::EmergencyStop => write!(f, "DAC responded with \"NAK - Emergency Stop\""),
            Nak::Unknown(code) => write!(f, "DAC responded with unknown code 0x{:02X}", code),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Socket(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Socket(err)
    }
}

impl Error {
    /// Returns true if this error means the connection is gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed)
    }
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
