//! HJ/T212 protocol types and constants.

use serde::{Deserialize, Serialize};
use std::fmt;

// Frame delimiters
pub(crate) const FRAME_MARKER: &[u8; 2] = b"##";
pub(crate) const FRAME_TERMINATOR: &[u8; 2] = b"\r\n";
pub(crate) const LENGTH_DIGITS: usize = 4;
pub(crate) const CHECKSUM_DIGITS: usize = 4;

// CP sub-field sentinel
pub(crate) const CP_SENTINEL: &str = "&&";

// Vendor binary layer
pub(crate) const CM_MAGIC: [u8; 2] = [0x43, 0x4D]; // "CM"
pub(crate) const CM_FRAME_SIZE: usize = 9;
pub(crate) const CM_STATUS_OFFSET: usize = 2;

// Binary status bytes
pub(crate) const CM_STATUS_ACCEPTED: u8 = 0x01;
pub(crate) const CM_STATUS_INITIAL: u8 = 0x03;
pub(crate) const CM_STATUS_REJECTED: u8 = 0x8D;

// ASCII execution results
pub(crate) const ASCII_ACCEPTED: &str = "ST=91";
pub(crate) const ASCII_REJECTED: &str = "ST=92";

/// Wire variant of an outbound frame.
///
/// `WithLength` carries a 4-digit decimal segment length after `##`;
/// `NoLength` goes straight from the marker to the data segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameVariant {
    WithLength,
    NoLength,
}

impl FrameVariant {
    /// The other variant, used for the fallback attempt.
    pub fn alternate(self) -> Self {
        match self {
            Self::WithLength => Self::NoLength,
            Self::NoLength => Self::WithLength,
        }
    }
}

impl fmt::Display for FrameVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WithLength => write!(f, "with-length"),
            Self::NoLength => write!(f, "no-length"),
        }
    }
}

/// Definitive result of one protocol session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Server confirmed the upload (`ST=91` or binary status 0x01).
    Accepted,
    /// Server refused the upload (`ST=92` or binary status 0x8D).
    Rejected,
    /// Server answered, but not with a recognised accept/reject.
    AmbiguousStatus,
    /// No response arrived before the response deadline.
    Timeout,
    /// Connect failed, or the peer closed without answering.
    ConnectionError,
    /// Response frame failed validation under both variants.
    ProtocolError,
}

impl SessionOutcome {
    /// Whether this outcome may be followed by a fallback attempt.
    pub(crate) fn permits_fallback(self) -> bool {
        matches!(self, Self::AmbiguousStatus | Self::ProtocolError)
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::AmbiguousStatus => "ambiguous status",
            Self::Timeout => "timeout",
            Self::ConnectionError => "connection error",
            Self::ProtocolError => "protocol error",
        };
        f.write_str(name)
    }
}

/// 9-byte vendor greeting: `CM` + status + type + subtype + 4 padding bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeGreeting {
    pub status: u8,
    pub kind: u8,
    pub subtype: u8,
    pub padding: [u8; 4],
}

impl HandshakeGreeting {
    /// Parse a greeting from the start of `bytes`.
    ///
    /// Returns `None` unless at least 9 bytes are present and the first two are `CM`.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < CM_FRAME_SIZE || bytes[0..2] != CM_MAGIC {
            return None;
        }
        Some(Self {
            status: bytes[2],
            kind: bytes[3],
            subtype: bytes[4],
            padding: [bytes[5], bytes[6], bytes[7], bytes[8]],
        })
    }

    /// Serialize back to the 9-byte wire form.
    pub fn to_bytes(&self) -> [u8; CM_FRAME_SIZE] {
        let mut frame = [0u8; CM_FRAME_SIZE];
        frame[0..2].copy_from_slice(&CM_MAGIC);
        frame[2] = self.status;
        frame[3] = self.kind;
        frame[4] = self.subtype;
        frame[5..9].copy_from_slice(&self.padding);
        frame
    }

    /// Binary acknowledgment for this greeting: status 0x01, same type/subtype, zero padding.
    pub fn acknowledgment(&self) -> [u8; CM_FRAME_SIZE] {
        Self {
            status: CM_STATUS_ACCEPTED,
            kind: self.kind,
            subtype: self.subtype,
            padding: [0; 4],
        }
        .to_bytes()
    }
}

/// Whether `bytes` begins with the `CM` magic.
pub(crate) fn has_cm_magic(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0..2] == CM_MAGIC
}
