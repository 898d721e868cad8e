//! ProtocolSession struct and public API.

use super::classifier::classify;
use super::error::{Hj212Error, Result};
use super::handshake::{HandshakeNegotiator, HandshakeProfile, HandshakeReport, ReplyStyle};
use super::io::{read_response, write_all};
use super::protocol::{decode, encode};
use super::types::{FRAME_MARKER, FRAME_TERMINATOR, FrameVariant, SessionOutcome};
use crate::models::EnvelopeBuilder;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Default response size ceiling in bytes.
pub(crate) const DEFAULT_RESPONSE_CEILING: usize = 1024;

/// Independent deadlines for each session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSet {
    pub connect: Duration,
    pub greeting: Duration,
    pub handshake_ack: Duration,
    pub write: Duration,
    pub response: Duration,
}

impl Default for TimeoutSet {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            greeting: Duration::from_millis(500),
            handshake_ack: Duration::from_millis(1000),
            write: Duration::from_secs(5),
            response: Duration::from_secs(5),
        }
    }
}

/// What happened on one connection.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub variant: FrameVariant,
    pub qn: String,
    /// `None` when the connection could not be established.
    pub handshake: Option<HandshakeReport>,
    pub frame_sent: bool,
    pub response: Vec<u8>,
    pub outcome: SessionOutcome,
    pub elapsed: Duration,
}

impl AttemptReport {
    fn new(variant: FrameVariant, qn: String) -> Self {
        Self {
            variant,
            qn,
            handshake: None,
            frame_sent: false,
            response: Vec::new(),
            outcome: SessionOutcome::ConnectionError,
            elapsed: Duration::ZERO,
        }
    }

    /// Whether this attempt may be followed by the alternate variant.
    fn wants_fallback(&self) -> bool {
        self.outcome.permits_fallback() || (self.outcome == SessionOutcome::ConnectionError && self.frame_sent)
    }
}

/// Result of a full session: the final outcome plus every attempt made.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub attempts: Vec<AttemptReport>,
}

impl SessionReport {
    pub fn fallback_used(&self) -> bool {
        self.attempts.len() > 1
    }
}

/// One upload exchange against an HJ/T212 collection server.
///
/// Every attempt opens a fresh connection, negotiates the vendor handshake,
/// writes exactly one frame and classifies the reply. At most one fallback
/// attempt with the alternate frame variant follows.
#[derive(Debug, Clone)]
pub struct ProtocolSession {
    host: String,
    port: u16,
    timeouts: TimeoutSet,
    reply: ReplyStyle,
    primary_variant: FrameVariant,
    fallback_enabled: bool,
    response_ceiling: usize,
}

impl ProtocolSession {
    /// Create a session with the default profile: no handshake reply,
    /// `WithLength` frames, fallback enabled.
    pub fn new(host: &str, port: u16, timeouts: TimeoutSet) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeouts,
            reply: ReplyStyle::None,
            primary_variant: FrameVariant::WithLength,
            fallback_enabled: true,
            response_ceiling: DEFAULT_RESPONSE_CEILING,
        }
    }

    pub fn with_reply(mut self, reply: ReplyStyle) -> Self {
        self.reply = reply;
        self
    }

    pub fn with_variant(mut self, variant: FrameVariant) -> Self {
        self.primary_variant = variant;
        self
    }

    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    pub fn with_response_ceiling(mut self, ceiling: usize) -> Self {
        self.response_ceiling = ceiling;
        self
    }

    fn handshake_profile(&self) -> HandshakeProfile {
        HandshakeProfile {
            reply: self.reply,
            greeting_timeout: self.timeouts.greeting,
            ack_timeout: self.timeouts.handshake_ack,
            write_timeout: self.timeouts.write,
        }
    }

    /// Run the session to a definitive outcome.
    pub async fn run(&self, builder: &EnvelopeBuilder) -> SessionReport {
        let first = self.attempt(builder, self.primary_variant).await;
        let retry = self.fallback_enabled && first.wants_fallback();
        let mut attempts = vec![first];

        if retry {
            let variant = self.primary_variant.alternate();
            warn!("Outcome {}: falling back to {variant} frame", attempts[0].outcome);
            attempts.push(self.attempt(builder, variant).await);
        }

        let outcome = attempts.last().map_or(SessionOutcome::ConnectionError, |a| a.outcome);
        info!(
            "Session with {}:{} finished: {outcome} after {} attempt(s)",
            self.host,
            self.port,
            attempts.len()
        );
        SessionReport { outcome, attempts }
    }

    /// One connection: connect, handshake, send, read, classify.
    async fn attempt(&self, builder: &EnvelopeBuilder, variant: FrameVariant) -> AttemptReport {
        let start = Instant::now();
        let envelope = builder.build();
        let frame = encode(&envelope, variant);
        let mut report = AttemptReport::new(variant, envelope.qn.clone());

        info!("Uploading QN={} as {variant} frame", envelope.qn);

        let mut stream = match self.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("{e}");
                report.elapsed = start.elapsed();
                return report;
            }
        };

        report.handshake = Some(HandshakeNegotiator::new(self.handshake_profile()).negotiate(&mut stream).await);

        match write_all(&mut stream, &frame.to_bytes(), self.timeouts.write).await {
            Ok(()) => {
                report.frame_sent = true;
                report.outcome = match read_response(&mut stream, self.timeouts.response, self.response_ceiling).await {
                    Ok(bytes) => {
                        let outcome = interpret(&bytes);
                        report.response = bytes;
                        outcome
                    }
                    Err(Hj212Error::Timeout(_)) => SessionOutcome::Timeout,
                    Err(e) => {
                        error!("Response read failed: {e}");
                        SessionOutcome::ConnectionError
                    }
                };
            }
            Err(e) => error!("Frame write failed: {e}"),
        }

        if let Err(e) = stream.shutdown().await {
            debug!("Shutdown after attempt failed: {e}");
        }

        report.elapsed = start.elapsed();
        info!("QN={} -> {} ({:?})", report.qn, report.outcome, report.elapsed);
        report
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        info!("TCP connecting to {addr} (timeout={:?})", self.timeouts.connect);

        let stream = timeout(self.timeouts.connect, TcpStream::connect(&addr))
            .await
            .map_err(|_| Hj212Error::ConnectionFailed(format!("Connection timeout to {addr}")))?
            .map_err(|e| Hj212Error::ConnectionFailed(format!("Failed to connect to {addr}: {e}")))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY not set: {e}");
        }
        Ok(stream)
    }
}

/// Validate a framed ASCII response before classifying it.
fn interpret(bytes: &[u8]) -> SessionOutcome {
    if bytes.starts_with(FRAME_MARKER) {
        let end = bytes
            .windows(FRAME_TERMINATOR.len())
            .position(|w| w == FRAME_TERMINATOR)
            .map_or(bytes.len(), |pos| pos + FRAME_TERMINATOR.len());

        match decode(&bytes[..end]) {
            Ok(frame) => debug!(
                "Framed response: QN={:?} ST={:?} CN={:?}",
                frame.field("QN"),
                frame.field("ST"),
                frame.field("CN")
            ),
            Err(e) => {
                warn!("Malformed response frame: {e}");
                return SessionOutcome::ProtocolError;
            }
        }
    }
    classify(bytes)
}

#[cfg(test)]
pub(crate) fn interpret_for_test(bytes: &[u8]) -> SessionOutcome {
    interpret(bytes)
}
