//! Server response classification.

use super::types::{
    ASCII_ACCEPTED, ASCII_REJECTED, CM_FRAME_SIZE, CM_STATUS_ACCEPTED, CM_STATUS_INITIAL, CM_STATUS_OFFSET,
    CM_STATUS_REJECTED, SessionOutcome, has_cm_magic,
};
use tracing::debug;

/// Classify a fully buffered server response.
///
/// Binary `CM` status frames take precedence over ASCII interpretation. An empty
/// buffer (or one holding only NUL bytes) means the peer closed without answering.
pub fn classify(bytes: &[u8]) -> SessionOutcome {
    if bytes.iter().all(|&b| b == 0) {
        return SessionOutcome::ConnectionError;
    }

    if bytes.len() >= CM_FRAME_SIZE && has_cm_magic(bytes) {
        return classify_binary(bytes[CM_STATUS_OFFSET]);
    }

    classify_ascii(bytes)
}

fn classify_binary(status: u8) -> SessionOutcome {
    match status {
        CM_STATUS_ACCEPTED => SessionOutcome::Accepted,
        CM_STATUS_REJECTED => SessionOutcome::Rejected,
        CM_STATUS_INITIAL => {
            // Server repeated its connect-time status: the data frame was not processed.
            debug!("Binary status 0x{CM_STATUS_INITIAL:02X}: frame not processed");
            SessionOutcome::AmbiguousStatus
        }
        other => {
            debug!("Unknown binary status 0x{other:02X}");
            SessionOutcome::AmbiguousStatus
        }
    }
}

fn classify_ascii(bytes: &[u8]) -> SessionOutcome {
    let text = String::from_utf8_lossy(bytes);
    if text.contains(ASCII_ACCEPTED) {
        SessionOutcome::Accepted
    } else if text.contains(ASCII_REJECTED) {
        SessionOutcome::Rejected
    } else {
        SessionOutcome::AmbiguousStatus
    }
}
