//! Unit and loopback tests for the HJ/T212 client.

use super::client::interpret_for_test;
use super::handshake::{HandshakeNegotiator, HandshakeProfile, HandshakeState, ReplyStyle};
use super::protocol::{Frame, checksum, crc16, decode, encode};
use super::types::{FrameVariant, HandshakeGreeting, SessionOutcome};
use super::{Hj212Error, ProtocolSession, TimeoutSet};
use crate::models::envelope::tests::fixed_builder;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const GREETING: [u8; 9] = [0x43, 0x4D, 0x03, 0x02, 0x02, 0x00, 0x00, 0x00, 0x00];
const CM_ACCEPTED: [u8; 9] = [0x43, 0x4D, 0x01, 0x02, 0x02, 0x00, 0x00, 0x00, 0x00];
const CM_REJECTED: [u8; 9] = [0x43, 0x4D, 0x8D, 0x02, 0x02, 0x00, 0x00, 0x00, 0x00];
const CM_INITIAL: [u8; 9] = [0x43, 0x4D, 0x03, 0x02, 0x02, 0x00, 0x00, 0x00, 0x00];

// ---------------------------------------------------------------------------
// Checksum

#[test]
fn test_checksum_empty_data() {
    assert_eq!(checksum(b""), "FFFF");
}

#[test]
fn test_checksum_known_vector() {
    // Standard check value for CRC-16/MODBUS.
    assert_eq!(crc16(b"123456789"), 0x4B37);
    assert_eq!(checksum(b"123456789"), "4B37");
}

#[test]
fn test_checksum_is_deterministic_and_bit_sensitive() {
    let segment = fixed_builder().build().data_segment().into_bytes();
    let reference = checksum(&segment);
    assert_eq!(checksum(&segment), reference);

    for index in [0, 7, segment.len() / 2, segment.len() - 1] {
        for bit in 0..8 {
            let mut mutated = segment.clone();
            mutated[index] ^= 1 << bit;
            assert_ne!(checksum(&mutated), reference, "flip of bit {bit} at {index} undetected");
        }
    }
}

#[test]
fn test_checksum_format_is_zero_padded_uppercase() {
    let value = checksum(b"QN=1");
    assert_eq!(value.len(), 4);
    assert!(value.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
}

// ---------------------------------------------------------------------------
// Frame codec

#[test]
fn test_encode_with_length_structure() {
    let envelope = fixed_builder().build();
    let segment = envelope.data_segment();
    let bytes = encode(&envelope, FrameVariant::WithLength).to_bytes();

    assert_eq!(&bytes[0..2], b"##");
    assert_eq!(&bytes[2..6], format!("{:04}", segment.len()).as_bytes());
    assert_eq!(&bytes[6..6 + segment.len()], segment.as_bytes());
    assert_eq!(&bytes[6 + segment.len()..bytes.len() - 2], checksum(segment.as_bytes()).as_bytes());
    assert!(bytes.ends_with(b"\r\n"));
}

#[test]
fn test_encode_no_length_structure() {
    let envelope = fixed_builder().build();
    let segment = envelope.data_segment();
    let bytes = encode(&envelope, FrameVariant::NoLength).to_bytes();

    assert_eq!(&bytes[0..2], b"##");
    assert!(bytes[2..].starts_with(b"QN="));
    assert_eq!(bytes.len(), 2 + segment.len() + 4 + 2);
}

#[test]
fn test_decode_recovers_segment_for_both_variants() {
    let envelope = fixed_builder().build();
    for variant in [FrameVariant::WithLength, FrameVariant::NoLength] {
        let frame = decode(&encode(&envelope, variant).to_bytes()).unwrap();
        assert_eq!(frame.variant, variant);
        assert_eq!(frame.segment, envelope.data_segment());
    }
}

#[test]
fn test_decode_detects_mutated_segment_no_length() {
    let bytes = encode(&fixed_builder().build(), FrameVariant::NoLength).to_bytes();
    for index in 2..bytes.len() - 6 {
        let mut mutated = bytes.clone();
        mutated[index] = if mutated[index] == b'X' { b'Y' } else { b'X' };
        assert!(decode(&mutated).is_err(), "mutation at {index} undetected");
    }
}

#[test]
fn test_decode_detects_mutated_segment_with_length() {
    let bytes = encode(&fixed_builder().build(), FrameVariant::WithLength).to_bytes();
    for index in [6, 10, 40, bytes.len() / 2, bytes.len() - 7] {
        let mut mutated = bytes.clone();
        mutated[index] = if mutated[index] == b'X' { b'Y' } else { b'X' };
        assert!(matches!(decode(&mutated), Err(Hj212Error::ChecksumMismatch { .. })));
    }
}

#[test]
fn test_decode_rejects_missing_delimiters() {
    let bytes = encode(&fixed_builder().build(), FrameVariant::WithLength).to_bytes();

    assert!(matches!(decode(&bytes[..bytes.len() - 2]), Err(Hj212Error::MissingTerminator)));
    assert!(matches!(decode(&bytes[1..]), Err(Hj212Error::MissingMarker)));
    assert!(matches!(decode(b"##QN=1;ST=91\r\n"), Err(Hj212Error::InvalidChecksumDigits(_))));
    assert!(matches!(decode(b"##1\r\n"), Err(Hj212Error::TooShort(_))));
}

#[test]
fn test_decode_accepts_lowercase_checksum() {
    let segment = "QN=2025112014300500001;ST=91;CN=9014";
    let wire = format!("##{segment}{}\r\n", checksum(segment.as_bytes()).to_lowercase());
    let frame = decode(wire.as_bytes()).unwrap();
    assert_eq!(frame.segment, segment);
}

#[test]
fn test_decode_inconsistent_length_prefix_reads_as_no_length() {
    let segment = "1234ABC";
    let wire = format!("##{segment}{}\r\n", checksum(segment.as_bytes()));
    let frame = decode(wire.as_bytes()).unwrap();
    assert_eq!(frame.variant, FrameVariant::NoLength);
    assert_eq!(frame.segment, segment);
}

#[test]
fn test_frame_field_lookup() {
    let frame = Frame::new(FrameVariant::WithLength, fixed_builder().build().data_segment());
    assert_eq!(frame.field("ST"), Some("61"));
    assert_eq!(frame.field("CN"), Some("3051"));
    assert_eq!(frame.field("MN"), Some("865229085145869"));
    assert_eq!(frame.field("Sig"), Some("1"));
    assert_eq!(frame.field("Flag"), None);
}

// ---------------------------------------------------------------------------
// Response classification

#[test]
fn test_classify_binary_statuses() {
    assert_eq!(super::classify(&CM_ACCEPTED), SessionOutcome::Accepted);
    assert_eq!(super::classify(&CM_REJECTED), SessionOutcome::Rejected);
    assert_eq!(super::classify(&CM_INITIAL), SessionOutcome::AmbiguousStatus);
    assert_eq!(
        super::classify(&[0x43, 0x4D, 0x7F, 0x02, 0x02, 0x00, 0x00, 0x00, 0x00]),
        SessionOutcome::AmbiguousStatus
    );
}

#[test]
fn test_classify_ascii_statuses() {
    assert_eq!(super::classify(b"##QN=1;ST=91;CN=9014\r\n"), SessionOutcome::Accepted);
    assert_eq!(super::classify(b"##QN=1;ST=92;CN=9014\r\n"), SessionOutcome::Rejected);
    assert_eq!(super::classify(b"OK\r\n"), SessionOutcome::AmbiguousStatus);
}

#[test]
fn test_classify_empty_is_connection_error() {
    assert_eq!(super::classify(&[]), SessionOutcome::ConnectionError);
}

#[test]
fn test_interpret_rejects_corrupt_framed_response() {
    let good = Frame::new(FrameVariant::WithLength, "QN=1;ST=91;CN=9014".to_string()).to_bytes();
    assert_eq!(interpret_for_test(&good), SessionOutcome::Accepted);

    let mut bad = good.clone();
    bad[8] = b'Z';
    assert_eq!(interpret_for_test(&bad), SessionOutcome::ProtocolError);
}

// ---------------------------------------------------------------------------
// Handshake negotiation

fn quick_profile(reply: ReplyStyle) -> HandshakeProfile {
    HandshakeProfile {
        reply,
        greeting_timeout: Duration::from_millis(100),
        ack_timeout: Duration::from_millis(100),
        write_timeout: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn test_handshake_ready_without_greeting() {
    let (mut client, _server) = duplex(256);
    let start = Instant::now();

    let report = HandshakeNegotiator::new(quick_profile(ReplyStyle::AsciiCm))
        .negotiate(&mut client)
        .await;

    assert!(start.elapsed() < Duration::from_millis(600));
    assert_eq!(
        report.states,
        vec![
            HandshakeState::Init,
            HandshakeState::AwaitingGreeting,
            HandshakeState::NoGreeting,
            HandshakeState::Ready
        ]
    );
    assert!(report.greeting.is_none());
    assert!(report.reply_sent.is_none());
}

#[tokio::test]
async fn test_handshake_ready_with_greeting_and_no_reply() {
    let (mut client, mut server) = duplex(256);
    server.write_all(&GREETING).await.unwrap();

    let report = HandshakeNegotiator::new(quick_profile(ReplyStyle::None))
        .negotiate(&mut client)
        .await;

    assert_eq!(report.final_state(), Some(HandshakeState::Ready));
    assert!(report.states.contains(&HandshakeState::GreetingBinaryCm));
    assert!(report.states.contains(&HandshakeState::RespondedOrSkipped));
    assert_eq!(report.greeting, HandshakeGreeting::parse(&GREETING));
    assert!(report.reply_sent.is_none());
    assert!(report.ack.is_none());
}

#[tokio::test]
async fn test_handshake_ascii_reply_and_ack() {
    let (mut client, mut server) = duplex(256);
    server.write_all(&GREETING).await.unwrap();

    let peer = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        let n = server.read(&mut buf).await.unwrap();
        server.write_all(&CM_ACCEPTED).await.unwrap();
        (buf[..n].to_vec(), server)
    });

    let report = HandshakeNegotiator::new(quick_profile(ReplyStyle::AsciiCm))
        .negotiate(&mut client)
        .await;
    let (received, _server) = peer.await.unwrap();

    assert_eq!(received, b"CM\r\n");
    assert_eq!(report.reply_sent.as_deref(), Some(&b"CM\r\n"[..]));
    assert_eq!(report.ack.as_deref(), Some(&CM_ACCEPTED[..]));
    assert_eq!(report.final_state(), Some(HandshakeState::Ready));
}

#[tokio::test]
async fn test_handshake_unacknowledged_reply_still_ready() {
    let (mut client, mut server) = duplex(256);
    server.write_all(&GREETING).await.unwrap();

    let report = HandshakeNegotiator::new(quick_profile(ReplyStyle::BinaryAck))
        .negotiate(&mut client)
        .await;

    assert_eq!(report.reply_sent.as_deref(), Some(&CM_ACCEPTED[..]));
    assert!(report.ack.is_none());
    assert_eq!(report.final_state(), Some(HandshakeState::Ready));
}

#[tokio::test]
async fn test_handshake_discards_unrecognised_bytes() {
    let (mut client, mut server) = duplex(256);
    server.write_all(b"HELLO").await.unwrap();

    let report = HandshakeNegotiator::new(quick_profile(ReplyStyle::AsciiCm))
        .negotiate(&mut client)
        .await;

    assert_eq!(report.discarded, b"HELLO");
    assert!(report.states.contains(&HandshakeState::NoGreeting));
    assert_eq!(report.final_state(), Some(HandshakeState::Ready));
}

#[tokio::test]
async fn test_handshake_peer_closed_is_ready() {
    let (mut client, server) = duplex(256);
    drop(server);

    let report = HandshakeNegotiator::new(quick_profile(ReplyStyle::Echo))
        .negotiate(&mut client)
        .await;

    assert_eq!(report.final_state(), Some(HandshakeState::Ready));
}

// ---------------------------------------------------------------------------
// Loopback sessions

/// Behaviour of the fake collection server for one connection.
#[derive(Clone, Default)]
struct Script {
    greeting: Option<Vec<u8>>,
    /// Sent after the client's handshake reply arrives.
    handshake_ack: Option<Vec<u8>>,
    /// Empty means close without answering.
    response: Vec<u8>,
    /// Hold the connection open without answering.
    silent: bool,
}

/// What the fake server read from one connection.
#[derive(Debug)]
struct Received {
    handshake_reply: Vec<u8>,
    frame: Vec<u8>,
}

async fn serve(scripts: Vec<Script>) -> (SocketAddr, JoinHandle<Vec<Received>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let mut received = Vec::new();
        for script in scripts {
            let (mut socket, _) = listener.accept().await.unwrap();
            if let Some(greeting) = &script.greeting {
                socket.write_all(greeting).await.unwrap();
            }

            let mut buffer = Vec::new();
            let mut chunk = [0u8; 1024];
            if let Some(ack) = &script.handshake_ack {
                let n = socket.read(&mut chunk).await.unwrap();
                buffer.extend_from_slice(&chunk[..n]);
                socket.write_all(ack).await.unwrap();
            }
            while !(buffer.windows(2).any(|w| w == b"##") && buffer.ends_with(b"\r\n")) {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buffer.extend_from_slice(&chunk[..n]);
            }

            let split = buffer.windows(2).position(|w| w == b"##").unwrap_or(buffer.len());
            let frame = buffer.split_off(split);
            received.push(Received {
                handshake_reply: buffer,
                frame,
            });

            if script.silent {
                tokio::time::sleep(Duration::from_millis(800)).await;
            } else if !script.response.is_empty() {
                socket.write_all(&script.response).await.unwrap();
            }
        }
        received
    });

    (addr, handle)
}

fn quick_timeouts() -> TimeoutSet {
    TimeoutSet {
        connect: Duration::from_secs(2),
        greeting: Duration::from_millis(500),
        handshake_ack: Duration::from_millis(200),
        write: Duration::from_secs(2),
        response: Duration::from_millis(400),
    }
}

fn session(addr: SocketAddr) -> ProtocolSession {
    ProtocolSession::new(&addr.ip().to_string(), addr.port(), quick_timeouts())
}

#[tokio::test]
async fn test_session_accepted_without_fallback() {
    let (addr, server) = serve(vec![Script {
        response: CM_ACCEPTED.to_vec(),
        ..Default::default()
    }])
    .await;

    let report = session(addr).run(&fixed_builder()).await;
    let received = server.await.unwrap();

    assert_eq!(report.outcome, SessionOutcome::Accepted);
    assert!(!report.fallback_used());
    let attempt = &report.attempts[0];
    assert_eq!(attempt.variant, FrameVariant::WithLength);
    assert_eq!(
        attempt.handshake.as_ref().and_then(|h| h.final_state()),
        Some(HandshakeState::Ready)
    );
    assert_eq!(decode(&received[0].frame).unwrap().variant, FrameVariant::WithLength);
}

#[tokio::test]
async fn test_session_empty_responses_end_in_connection_error() {
    let (addr, server) = serve(vec![Script::default(), Script::default()]).await;

    let report = session(addr).run(&fixed_builder()).await;
    let received = server.await.unwrap();

    assert_eq!(report.outcome, SessionOutcome::ConnectionError);
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(report.attempts[0].variant, FrameVariant::WithLength);
    assert_eq!(report.attempts[1].variant, FrameVariant::NoLength);
    assert_ne!(report.attempts[0].qn, report.attempts[1].qn);
    assert_ne!(received[0].frame, received[1].frame);
}

#[tokio::test]
async fn test_session_ambiguous_status_falls_back_with_new_qn() {
    let (addr, server) = serve(vec![
        Script {
            response: CM_INITIAL.to_vec(),
            ..Default::default()
        },
        Script {
            response: CM_ACCEPTED.to_vec(),
            ..Default::default()
        },
    ])
    .await;

    let report = session(addr).run(&fixed_builder()).await;
    let received = server.await.unwrap();

    assert_eq!(report.outcome, SessionOutcome::Accepted);
    assert_eq!(report.attempts[0].outcome, SessionOutcome::AmbiguousStatus);
    let first = decode(&received[0].frame).unwrap();
    let second = decode(&received[1].frame).unwrap();
    assert_eq!(first.variant, FrameVariant::WithLength);
    assert_eq!(second.variant, FrameVariant::NoLength);
    assert_ne!(first.field("QN"), second.field("QN"));
}

#[tokio::test]
async fn test_session_fallback_disabled_returns_first_outcome() {
    let (addr, server) = serve(vec![Script {
        response: CM_INITIAL.to_vec(),
        ..Default::default()
    }])
    .await;

    let report = session(addr).with_fallback(false).run(&fixed_builder()).await;
    server.await.unwrap();

    assert_eq!(report.outcome, SessionOutcome::AmbiguousStatus);
    assert_eq!(report.attempts.len(), 1);
}

#[tokio::test]
async fn test_session_ascii_rejection() {
    let response = Frame::new(
        FrameVariant::WithLength,
        "QN=20251120143005000011;ST=92;CN=9014;PW=123456;CP=&&&&".to_string(),
    )
    .to_bytes();
    let (addr, server) = serve(vec![Script {
        response,
        ..Default::default()
    }])
    .await;

    let report = session(addr).run(&fixed_builder()).await;
    server.await.unwrap();

    assert_eq!(report.outcome, SessionOutcome::Rejected);
    assert!(!report.fallback_used());
}

#[tokio::test]
async fn test_session_corrupt_response_is_protocol_error() {
    let corrupt = b"##QN=1;ST=91;CN=9014FFFF\r\n".to_vec();
    let (addr, server) = serve(vec![
        Script {
            response: corrupt.clone(),
            ..Default::default()
        },
        Script {
            response: corrupt,
            ..Default::default()
        },
    ])
    .await;

    let report = session(addr).run(&fixed_builder()).await;
    server.await.unwrap();

    assert_eq!(report.outcome, SessionOutcome::ProtocolError);
    assert_eq!(report.attempts.len(), 2);
}

#[tokio::test]
async fn test_session_silent_server_times_out() {
    let (addr, server) = serve(vec![Script {
        silent: true,
        ..Default::default()
    }])
    .await;

    let report = session(addr).run(&fixed_builder()).await;
    server.await.unwrap();

    assert_eq!(report.outcome, SessionOutcome::Timeout);
    assert!(!report.fallback_used());
    assert!(report.attempts[0].frame_sent);
}

#[tokio::test]
async fn test_session_refused_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let report = session(addr).run(&fixed_builder()).await;

    assert_eq!(report.outcome, SessionOutcome::ConnectionError);
    assert_eq!(report.attempts.len(), 1);
    assert!(report.attempts[0].handshake.is_none());
    assert!(!report.attempts[0].frame_sent);
}

#[tokio::test]
async fn test_session_answers_greeting_before_frame() {
    let (addr, server) = serve(vec![Script {
        greeting: Some(GREETING.to_vec()),
        handshake_ack: Some(CM_ACCEPTED.to_vec()),
        response: CM_ACCEPTED.to_vec(),
        ..Default::default()
    }])
    .await;

    let report = session(addr)
        .with_reply(ReplyStyle::AsciiCm)
        .run(&fixed_builder())
        .await;
    let received = server.await.unwrap();

    assert_eq!(report.outcome, SessionOutcome::Accepted);
    assert_eq!(received[0].handshake_reply, b"CM\r\n");
    let handshake = report.attempts[0].handshake.as_ref().unwrap();
    assert!(handshake.greeting.is_some());
    assert_eq!(handshake.ack.as_deref(), Some(&CM_ACCEPTED[..]));
}

#[tokio::test]
async fn test_session_no_length_primary_variant() {
    let unchecked = Script {
        response: b"##QN=1;ST=91\r\n".to_vec(),
        ..Default::default()
    };
    let (addr, server) = serve(vec![unchecked.clone(), unchecked]).await;

    let report = session(addr)
        .with_variant(FrameVariant::NoLength)
        .run(&fixed_builder())
        .await;
    let received = server.await.unwrap();

    // Unvalidated response frame: checksum digits are not hex.
    assert_eq!(report.outcome, SessionOutcome::ProtocolError);
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(report.attempts[1].variant, FrameVariant::WithLength);
    assert_eq!(decode(&received[0].frame).unwrap().variant, FrameVariant::NoLength);
}
