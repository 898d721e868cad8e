//! Data models for telemetry records and request envelopes.

pub mod envelope;
pub mod telemetry;

pub use envelope::{Clock, EnvelopeBuilder, QnGenerator, RequestEnvelope, SystemClock};
pub use telemetry::{Reading, TelemetryRecord, format_activity};
