//! Request envelope and QN (request number) generation.

use chrono::{Local, NaiveDateTime, TimeDelta, Timelike};
use std::sync::{Arc, Mutex};

use super::telemetry::TelemetryRecord;
use crate::error::{AppError, Result};

/// Trailing flag digit of every QN.
const QN_FLAG: u8 = 1;
/// 14-digit timestamp + 4-digit sequence + flag.
const QN_WIDTH: usize = 19;
const QN_SEQUENCE_LIMIT: u16 = 10_000;
/// Largest segment a 4-digit length field can declare.
pub const MAX_SEGMENT_LENGTH: usize = 9_999;

/// Protocol-level wrapper around a telemetry record.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    /// Request number: 14-digit timestamp + 4-digit sequence + flag digit.
    pub qn: String,
    /// System type (ST).
    pub system_type: String,
    /// Command code (CN).
    pub command: String,
    /// Access password (PW).
    pub password: String,
    pub record: TelemetryRecord,
}

impl RequestEnvelope {
    /// Serialized data segment: `QN=..;ST=..;CN=..;PW=..;CP=&&...&&`.
    pub fn data_segment(&self) -> String {
        format!(
            "QN={};ST={};CN={};PW={};CP=&&{}&&",
            self.qn,
            self.system_type,
            self.command,
            self.password,
            self.record.to_cp()
        )
    }
}

/// Time source for QN generation.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Issues strictly increasing QN values.
///
/// Within one second the sequence counts up from `0000`. When the clock stalls
/// or steps backwards the last timestamp is reused, and a sequence overflow
/// moves the logical timestamp one second forward.
pub struct QnGenerator {
    clock: Box<dyn Clock>,
    last: Mutex<Option<(NaiveDateTime, u16)>>,
}

impl QnGenerator {
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            last: Mutex::new(None),
        }
    }

    /// Generator backed by the local wall clock.
    pub fn system() -> Self {
        Self::new(SystemClock)
    }

    /// Next request number.
    pub fn next_qn(&self) -> String {
        let now = self.clock.now().with_nanosecond(0).unwrap_or_else(|| self.clock.now());
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());

        let (stamp, sequence) = match *last {
            Some((prev, seq)) if now <= prev => {
                if seq + 1 >= QN_SEQUENCE_LIMIT {
                    (prev + TimeDelta::seconds(1), 0)
                } else {
                    (prev, seq + 1)
                }
            }
            _ => (now, 0),
        };
        *last = Some((stamp, sequence));

        format!("{}{sequence:04}{QN_FLAG}", stamp.format("%Y%m%d%H%M%S"))
    }
}

impl std::fmt::Debug for QnGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QnGenerator").field("last", &self.last).finish_non_exhaustive()
    }
}

/// Produces a fresh envelope (new QN) for every attempt.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    system_type: String,
    command: String,
    password: String,
    record: TelemetryRecord,
    qn: Arc<QnGenerator>,
}

impl EnvelopeBuilder {
    /// Validate the protocol fields and the record, then build a reusable builder.
    pub fn new(
        system_type: &str,
        command: &str,
        password: &str,
        record: TelemetryRecord,
        qn: Arc<QnGenerator>,
    ) -> Result<Self> {
        if system_type.len() != 2 || !system_type.chars().all(|c| c.is_ascii_digit()) {
            return Err(AppError::validation(format!("ST must be two digits: {system_type:?}")));
        }
        if command.len() != 4 || !command.chars().all(|c| c.is_ascii_digit()) {
            return Err(AppError::validation(format!("CN must be four digits: {command:?}")));
        }
        if password.len() != 6 || !password.chars().all(|c| c.is_ascii_digit()) {
            return Err(AppError::validation("PW must be six digits"));
        }
        record.validate()?;

        let builder = Self {
            system_type: system_type.to_string(),
            command: command.to_string(),
            password: password.to_string(),
            record,
            qn,
        };

        // QN has a fixed width, so a placeholder QN sizes every later envelope.
        let length = builder.envelope_with_qn("0".repeat(QN_WIDTH)).data_segment().len();
        if length > MAX_SEGMENT_LENGTH {
            return Err(AppError::validation(format!(
                "Data segment is {length} characters, limit is {MAX_SEGMENT_LENGTH}"
            )));
        }
        Ok(builder)
    }

    pub fn record(&self) -> &TelemetryRecord {
        &self.record
    }

    /// Build an envelope carrying a newly issued QN.
    pub fn build(&self) -> RequestEnvelope {
        self.envelope_with_qn(self.qn.next_qn())
    }

    fn envelope_with_qn(&self, qn: String) -> RequestEnvelope {
        RequestEnvelope {
            qn,
            system_type: self.system_type.clone(),
            command: self.command.clone(),
            password: self.password.clone(),
            record: self.record.clone(),
        }
    }
}
