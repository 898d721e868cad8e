//! Upload service orchestration.

use crate::config::AppConfig;
use crate::error::Result;
use crate::hj212::{FrameVariant, ProtocolSession, SessionOutcome, SessionReport};
use crate::models::{EnvelopeBuilder, QnGenerator, Reading, TelemetryRecord};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Result of an upload operation.
#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub outcome: SessionOutcome,
    /// Total connections opened across all sessions.
    pub attempts: usize,
    /// QN of every attempt, in order.
    pub qns: Vec<String>,
    pub sessions: usize,
    pub fallback_used: bool,
    /// Variant of the last attempt.
    pub variant: Option<FrameVariant>,
    pub duration_secs: f64,
}

impl UploadResult {
    /// Get summary message.
    pub fn summary(&self) -> String {
        let base = format!(
            "Outcome: {}, Attempts: {}, Sessions: {} (took {:.1}s)",
            self.outcome, self.attempts, self.sessions, self.duration_secs
        );
        if self.fallback_used {
            format!("{base} - Fallback used")
        } else {
            base
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.outcome == SessionOutcome::Accepted
    }
}

/// Per-upload overrides from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct UploadOptions {
    pub variant: Option<FrameVariant>,
    pub disable_fallback: bool,
}

/// Upload service for one configured collection server.
pub struct UploadService {
    config: AppConfig,
    qn: Arc<QnGenerator>,
}

impl UploadService {
    /// Create a new upload service.
    pub fn new(config: AppConfig, qn: Arc<QnGenerator>) -> Self {
        Self { config, qn }
    }

    /// Service backed by the local wall clock.
    pub fn with_system_clock(config: AppConfig) -> Self {
        Self::new(config, Arc::new(QnGenerator::system()))
    }

    /// Merge the configured source description with a reading.
    pub fn build_record(&self, reading: &Reading) -> Result<TelemetryRecord> {
        self.config.device.record_for(reading)
    }

    /// Envelope builder for a reading, validating every field up front.
    pub fn envelope_builder(&self, reading: &Reading) -> Result<EnvelopeBuilder> {
        let server = &self.config.server;
        EnvelopeBuilder::new(
            &server.system_type,
            &server.command,
            &server.password,
            self.build_record(reading)?,
            self.qn.clone(),
        )
    }

    fn session(&self, options: UploadOptions) -> ProtocolSession {
        let upload = &self.config.upload;
        ProtocolSession::new(
            &self.config.server.host,
            self.config.server.port,
            self.config.timeouts.to_timeout_set(),
        )
        .with_reply(self.config.handshake.reply)
        .with_variant(options.variant.unwrap_or(upload.primary_variant))
        .with_fallback(upload.fallback_enabled && !options.disable_fallback)
        .with_response_ceiling(upload.response_ceiling)
    }

    /// Upload one reading with the configured settings.
    pub async fn upload(&self, reading: &Reading) -> Result<UploadResult> {
        self.upload_with(reading, UploadOptions::default()).await
    }

    /// Upload one reading.
    ///
    /// Whole sessions are repeated up to `max_retries` times while the outcome is
    /// `ConnectionError` or `Timeout`. Server verdicts are never retried.
    pub async fn upload_with(&self, reading: &Reading, options: UploadOptions) -> Result<UploadResult> {
        let start = Instant::now();
        let builder = self.envelope_builder(reading)?;
        let session = self.session(options);
        let max_retries = self.config.upload.max_retries;
        let interval = Duration::from_millis(self.config.upload.retry_interval_ms);

        info!(
            "Starting upload to {}:{} (MN={})",
            self.config.server.host,
            self.config.server.port,
            builder.record().mn
        );

        let mut reports: Vec<SessionReport> = Vec::new();
        loop {
            let report = session.run(&builder).await;
            let outcome = report.outcome;
            reports.push(report);

            let retries_used = reports.len() as u32 - 1;
            if !is_transient(outcome) || retries_used >= max_retries {
                break;
            }
            warn!(
                "Upload {outcome}, retrying in {:?} ({}/{max_retries})",
                interval,
                retries_used + 1
            );
            tokio::time::sleep(interval).await;
        }

        let result = summarize(&reports, start.elapsed().as_secs_f64());
        info!("Upload complete: {}", result.summary());
        Ok(result)
    }
}

fn is_transient(outcome: SessionOutcome) -> bool {
    matches!(outcome, SessionOutcome::ConnectionError | SessionOutcome::Timeout)
}

fn summarize(reports: &[SessionReport], duration_secs: f64) -> UploadResult {
    let attempts: Vec<_> = reports.iter().flat_map(|r| r.attempts.iter()).collect();
    UploadResult {
        outcome: reports.last().map_or(SessionOutcome::ConnectionError, |r| r.outcome),
        attempts: attempts.len(),
        qns: attempts.iter().map(|a| a.qn.clone()).collect(),
        sessions: reports.len(),
        fallback_used: reports.iter().any(SessionReport::fallback_used),
        variant: attempts.last().map(|a| a.variant),
        duration_secs,
    }
}
