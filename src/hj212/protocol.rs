//! HJ/T212 frame building, parsing and checksum calculation.

use super::error::{Hj212Error, Result};
use super::types::{CHECKSUM_DIGITS, CP_SENTINEL, FRAME_MARKER, FRAME_TERMINATOR, FrameVariant, LENGTH_DIGITS};
use crate::models::RequestEnvelope;

const CRC_INIT: u16 = 0xFFFF;
const CRC_POLY: u16 = 0xA001;

/// CRC-16 (reflected, poly 0xA001, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC_INIT;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC_POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Frame checksum as 4 uppercase hex digits.
pub fn checksum(data: &[u8]) -> String {
    format!("{:04X}", crc16(data))
}

/// One HJ/T212 wire frame.
///
/// The checksum always covers the data segment alone; the length prefix of
/// `WithLength` frames is outside the checksummed range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub variant: FrameVariant,
    pub segment: String,
    pub checksum: String,
}

impl Frame {
    /// Build a frame around an already serialized data segment.
    pub fn new(variant: FrameVariant, segment: String) -> Self {
        let checksum = checksum(segment.as_bytes());
        Self {
            variant,
            segment,
            checksum,
        }
    }

    /// Decimal length field value (character count of the data segment).
    pub fn declared_length(&self) -> usize {
        self.segment.len()
    }

    /// Serialize to wire bytes: `##` + [length] + segment + checksum + `\r\n`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(
            FRAME_MARKER.len() + LENGTH_DIGITS + self.segment.len() + CHECKSUM_DIGITS + FRAME_TERMINATOR.len(),
        );
        frame.extend_from_slice(FRAME_MARKER);
        if self.variant == FrameVariant::WithLength {
            frame.extend_from_slice(format!("{:04}", self.declared_length()).as_bytes());
        }
        frame.extend_from_slice(self.segment.as_bytes());
        frame.extend_from_slice(self.checksum.as_bytes());
        frame.extend_from_slice(FRAME_TERMINATOR);
        frame
    }

    /// Look up a `key=value` pair in the segment, outer fields first, then inside CP.
    pub fn field(&self, key: &str) -> Option<&str> {
        let cp_start = format!("CP={CP_SENTINEL}");
        let (outer, inner) = match self.segment.find(&cp_start) {
            Some(idx) => {
                let rest = &self.segment[idx + cp_start.len()..];
                let inner = rest.rfind(CP_SENTINEL).map_or(rest, |end| &rest[..end]);
                (&self.segment[..idx], inner)
            }
            None => (self.segment.as_str(), ""),
        };

        outer
            .split(';')
            .chain(inner.split(';'))
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

/// Encode an envelope as a frame of the requested variant.
pub fn encode(envelope: &RequestEnvelope, variant: FrameVariant) -> Frame {
    Frame::new(variant, envelope.data_segment())
}

/// Decode and validate an inbound frame of either variant.
///
/// `WithLength` is tried first; if the leading digits do not match the segment
/// length, or the checksum fails under that reading, the whole body is treated
/// as a `NoLength` segment.
pub fn decode(bytes: &[u8]) -> Result<Frame> {
    let body = bytes.strip_suffix(FRAME_TERMINATOR).ok_or(Hj212Error::MissingTerminator)?;
    let body = body.strip_prefix(FRAME_MARKER).ok_or(Hj212Error::MissingMarker)?;

    if body.len() < CHECKSUM_DIGITS {
        return Err(Hj212Error::TooShort(bytes.len()));
    }
    if !body.is_ascii() {
        return Err(Hj212Error::NonAscii);
    }

    let (rest, crc_digits) = body.split_at(body.len() - CHECKSUM_DIGITS);
    let crc_text = String::from_utf8_lossy(crc_digits).into_owned();
    if !crc_digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(Hj212Error::InvalidChecksumDigits(crc_text));
    }
    let carried =
        u16::from_str_radix(&crc_text, 16).map_err(|_| Hj212Error::InvalidChecksumDigits(crc_text.clone()))?;

    if let Some(segment) = with_length_segment(rest)
        && crc16(segment) == carried
    {
        return Ok(Frame::new(FrameVariant::WithLength, ascii_string(segment)));
    }

    let computed = crc16(rest);
    if computed == carried {
        return Ok(Frame::new(FrameVariant::NoLength, ascii_string(rest)));
    }

    Err(Hj212Error::ChecksumMismatch {
        expected: crc_text.to_ascii_uppercase(),
        actual: format!("{computed:04X}"),
    })
}

/// Segment under the `WithLength` hypothesis, if the length prefix is consistent.
fn with_length_segment(rest: &[u8]) -> Option<&[u8]> {
    if rest.len() < LENGTH_DIGITS {
        return None;
    }
    let (digits, segment) = rest.split_at(LENGTH_DIGITS);
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let declared: usize = std::str::from_utf8(digits).ok()?.parse().ok()?;
    (declared == segment.len()).then_some(segment)
}

fn ascii_string(bytes: &[u8]) -> String {
    // Caller has already checked the bytes are ASCII.
    String::from_utf8_lossy(bytes).into_owned()
}
