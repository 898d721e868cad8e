//! Radiation-source telemetry record and its CP field rendering.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Characters that delimit the data segment and may not appear in any field value.
const DELIMITERS: [char; 3] = [';', '=', '&'];

/// One measurement upload for a monitored radiation source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Device identifier (MN).
    pub mn: String,
    /// Detector identifier (Ma).
    pub ma: String,
    /// Source code (Rno).
    pub rno: String,
    /// Source-type code (Xtype), two digits.
    pub xtype: String,
    /// Activity at production, Bq.
    pub original_activity: f64,
    /// Current activity, Bq.
    pub current_activity: f64,
    pub source_date: NaiveDate,
    pub data_time: NaiveDateTime,
    /// Degree-minute longitude, e.g. `12102.1465`.
    pub longitude: String,
    /// Degree-minute latitude, e.g. `3740.5073`.
    pub latitude: String,
    pub dose_rate: f64,
    pub threshold: f64,
    pub alert_type: u8,
    pub battery: f64,
    pub gps_valid: bool,
}

/// Per-upload measurement values, merged with the static device description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub data_time: NaiveDateTime,
    pub dose_rate: f64,
    pub battery: f64,
    pub alert_type: u8,
    pub gps_valid: bool,
    /// Overrides the configured longitude when the device reports a fix.
    pub longitude: Option<String>,
    /// Overrides the configured latitude when the device reports a fix.
    pub latitude: Option<String>,
}

impl TelemetryRecord {
    /// CP fields in wire order, already rendered.
    pub fn cp_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("MN", self.mn.clone()),
            ("Ma", self.ma.clone()),
            ("Rno", self.rno.clone()),
            ("Xtype", self.xtype.clone()),
            ("LastAct", format_activity(self.original_activity)),
            ("NowAct", format_activity(self.current_activity)),
            ("SourceTime", self.source_date.format("%Y%m%d").to_string()),
            ("DataTime", self.data_time.format("%Y%m%d%H%M%S").to_string()),
            ("LONG", self.longitude.clone()),
            ("LAT", self.latitude.clone()),
            ("Xvalue", format!("{:.3}", self.dose_rate)),
            ("Thres", format!("{:.3}", self.threshold)),
            ("AlertType", format!("{:02}", self.alert_type)),
            ("BattChar", format!("{:.1}", self.battery)),
            ("Sig", if self.gps_valid { "1" } else { "0" }.to_string()),
        ]
    }

    /// CP content without the `&&` sentinels: `MN=...;Ma=...;...;Sig=1`.
    pub fn to_cp(&self) -> String {
        self.cp_fields()
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Check every field against its format rule.
    pub fn validate(&self) -> Result<()> {
        require(is_digits(&self.mn), "MN must be a non-empty numeric string")?;
        require(is_digits(&self.ma), "Ma must be a non-empty numeric string")?;
        require(
            !self.rno.is_empty() && self.rno.chars().all(|c| c.is_ascii_alphanumeric()),
            "Rno must be alphanumeric",
        )?;
        require(self.xtype.len() == 2 && is_digits(&self.xtype), "Xtype must be two digits")?;
        require(is_degree_minute(&self.longitude), "LONG must be in degree-minute form")?;
        require(is_degree_minute(&self.latitude), "LAT must be in degree-minute form")?;

        for (name, value) in [
            ("LastAct", self.original_activity),
            ("NowAct", self.current_activity),
            ("Xvalue", self.dose_rate),
            ("Thres", self.threshold),
            ("BattChar", self.battery),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(AppError::validation(format!("{name} must be a finite non-negative number")));
            }
        }
        require(self.alert_type < 100, "AlertType must fit in two digits")?;

        for (key, value) in self.cp_fields() {
            if !value.is_ascii() || value.contains(DELIMITERS) {
                return Err(AppError::validation(format!(
                    "{key} contains a delimiter or non-ASCII character: {value:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Render an activity in fixed-width scientific notation: `5.530E012`, `1.000E-003`.
pub fn format_activity(value: f64) -> String {
    let rendered = format!("{value:.3e}");
    match rendered.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            if exponent < 0 {
                format!("{mantissa}E-{:03}", exponent.unsigned_abs())
            } else {
                format!("{mantissa}E{exponent:03}")
            }
        }
        None => rendered,
    }
}

fn require(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(AppError::validation(message))
    }
}

fn is_digits(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
}

fn is_degree_minute(value: &str) -> bool {
    match value.split_once('.') {
        Some((whole, fraction)) => is_digits(whole) && is_digits(fraction),
        None => false,
    }
}
