//! HJ/T212 uplink protocol client.
//!
//! Implements the ASCII `##...CRC\r\n` framing used by radiation-source
//! collection servers, plus the vendor `CM` binary handshake some deployments
//! send before the standard protocol starts.

mod classifier;
mod client;
mod error;
mod handshake;
mod io;
mod protocol;
mod types;

#[cfg(test)]
mod tests;

// Re-export public API
pub use classifier::classify;
pub use client::{AttemptReport, ProtocolSession, SessionReport, TimeoutSet};
pub use error::{Hj212Error, Result};
pub use handshake::{HandshakeNegotiator, HandshakeProfile, HandshakeReport, HandshakeState, ReplyStyle};
pub use protocol::{Frame, checksum, crc16, decode, encode};
pub use types::{FrameVariant, HandshakeGreeting, SessionOutcome};
