//! Vendor `CM` handshake negotiation.
//!
//! Some collection servers push a 9-byte binary greeting right after the TCP
//! connection opens; others stay silent until the first data frame. The
//! negotiator absorbs both: it always ends in [`HandshakeState::Ready`].

use super::io::{hex, read_greeting, read_once, write_all};
use super::types::{FRAME_TERMINATOR, HandshakeGreeting};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Negotiation states, in the order they can be visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    AwaitingGreeting,
    GreetingBinaryCm,
    NoGreeting,
    RespondedOrSkipped,
    Ready,
}

/// What to send back after a `CM` greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStyle {
    /// Read the greeting and send nothing.
    #[default]
    None,
    /// Plain `CM\r\n`.
    AsciiCm,
    /// Send the greeting bytes back unchanged.
    Echo,
    /// 9-byte binary acknowledgment with status 0x01.
    BinaryAck,
    /// Binary acknowledgment followed by `\r\n`.
    BinaryAckCrlf,
    /// `CM` followed by six NUL bytes.
    NullPadded,
}

impl ReplyStyle {
    /// Reply bytes for a received greeting, or `None` when nothing is sent.
    pub fn reply_for(self, greeting: &HandshakeGreeting, raw: &[u8]) -> Option<Vec<u8>> {
        match self {
            Self::None => None,
            Self::AsciiCm => Some(b"CM\r\n".to_vec()),
            Self::Echo => Some(raw.to_vec()),
            Self::BinaryAck => Some(greeting.acknowledgment().to_vec()),
            Self::BinaryAckCrlf => {
                let mut reply = greeting.acknowledgment().to_vec();
                reply.extend_from_slice(FRAME_TERMINATOR);
                Some(reply)
            }
            Self::NullPadded => {
                let mut reply = b"CM".to_vec();
                reply.extend_from_slice(&[0u8; 6]);
                Some(reply)
            }
        }
    }
}

/// Handshake behaviour and its phase deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeProfile {
    pub reply: ReplyStyle,
    pub greeting_timeout: Duration,
    pub ack_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for HandshakeProfile {
    fn default() -> Self {
        Self {
            reply: ReplyStyle::None,
            greeting_timeout: Duration::from_millis(500),
            ack_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Record of one negotiation.
#[derive(Debug, Clone, Default)]
pub struct HandshakeReport {
    /// States visited, starting at `Init` and ending at `Ready`.
    pub states: Vec<HandshakeState>,
    pub greeting: Option<HandshakeGreeting>,
    /// Bytes read at connect time that were not a `CM` greeting.
    pub discarded: Vec<u8>,
    pub reply_sent: Option<Vec<u8>>,
    pub ack: Option<Vec<u8>>,
}

impl HandshakeReport {
    pub fn final_state(&self) -> Option<HandshakeState> {
        self.states.last().copied()
    }
}

/// Bounded, non-failing handshake state machine.
pub struct HandshakeNegotiator {
    profile: HandshakeProfile,
    report: HandshakeReport,
}

impl HandshakeNegotiator {
    pub fn new(profile: HandshakeProfile) -> Self {
        Self {
            profile,
            report: HandshakeReport {
                states: vec![HandshakeState::Init],
                ..Default::default()
            },
        }
    }

    fn enter(&mut self, state: HandshakeState) {
        debug!("Handshake -> {state:?}");
        self.report.states.push(state);
    }

    /// Drive the negotiation to `Ready`.
    ///
    /// Silence, a closed peer, an unrecognised greeting, a failed reply write
    /// and a missing acknowledgment all still end in `Ready`.
    pub async fn negotiate<S>(mut self, stream: &mut S) -> HandshakeReport
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.enter(HandshakeState::AwaitingGreeting);

        let raw = match read_greeting(stream, self.profile.greeting_timeout).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Greeting read failed: {e}");
                Vec::new()
            }
        };

        let Some(greeting) = HandshakeGreeting::parse(&raw) else {
            if raw.is_empty() {
                debug!("No greeting within {:?}", self.profile.greeting_timeout);
            } else {
                warn!("Discarding {} unrecognised connect-time bytes: {}", raw.len(), hex(&raw));
                self.report.discarded = raw;
            }
            self.enter(HandshakeState::NoGreeting);
            self.enter(HandshakeState::Ready);
            return self.report;
        };

        info!(
            "CM greeting: status=0x{:02X} type=0x{:02X} subtype=0x{:02X}",
            greeting.status, greeting.kind, greeting.subtype
        );
        self.report.greeting = Some(greeting);
        self.enter(HandshakeState::GreetingBinaryCm);

        match self.profile.reply.reply_for(&greeting, &raw) {
            None => debug!("Reply style {:?}: not answering greeting", self.profile.reply),
            Some(reply) => {
                match write_all(stream, &reply, self.profile.write_timeout).await {
                    Ok(()) => self.report.reply_sent = Some(reply),
                    Err(e) => warn!("Handshake reply failed: {e}"),
                }
            }
        }
        self.enter(HandshakeState::RespondedOrSkipped);

        if self.report.reply_sent.is_some() {
            match read_once(stream, self.profile.ack_timeout).await {
                Ok(ack) if !ack.is_empty() => {
                    debug!("Handshake acknowledged: {}", hex(&ack));
                    self.report.ack = Some(ack);
                }
                Ok(_) => warn!("Handshake reply not acknowledged within {:?}", self.profile.ack_timeout),
                Err(e) => warn!("Handshake acknowledgment read failed: {e}"),
            }
        }

        self.enter(HandshakeState::Ready);
        self.report
    }
}
