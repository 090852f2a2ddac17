//! Error event data model

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Lowest accepted HTTP status code
pub const MIN_STATUS_CODE: u16 = 100;
/// Highest accepted HTTP status code
pub const MAX_STATUS_CODE: u16 = 599;

/// Severity of a reported error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Informational (status below 400)
    Info,
    /// Client-side failure (4xx)
    Warning,
    /// Server-side failure (5xx)
    Critical,
}

impl Severity {
    /// Stable string form used in storage and messages
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a status code to its severity.
///
/// Total over every `u16`; validation of the accepted range happens when an
/// [`ErrorEvent`] is built.
pub fn classify(status_code: u16) -> Severity {
    match status_code {
        500..=u16::MAX => Severity::Critical,
        400..=499 => Severity::Warning,
        _ => Severity::Info,
    }
}

/// An error report as submitted by a client application
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    /// Reporting application
    pub application_name: String,
    /// API endpoint that failed
    pub api_name: String,
    /// HTTP status code, 100 to 599
    pub status_code: u16,
    /// Free-form error message
    pub message: Option<String>,
    /// RFC 3339 or naive ISO-8601 date-time (read as UTC); falls back to now
    pub timestamp: Option<String>,
}

/// One ingested application failure.
///
/// Immutable once built. Severity is derived from the status code by every
/// constructor and cannot be set independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    id: Uuid,
    application_name: String,
    api_name: String,
    status_code: u16,
    message: Option<String>,
    severity: Severity,
    timestamp: DateTime<Utc>,
    occurrence_count: u32,
}

impl ErrorEvent {
    /// Validate a client report and build a new event stamped with a fresh id.
    ///
    /// `received_at` is used when the report carries no usable timestamp.
    pub fn from_report(report: ErrorReport, received_at: DateTime<Utc>) -> Result<Self> {
        let application_name = report.application_name.trim();
        if application_name.is_empty() {
            return Err(Error::validation("applicationName is required"));
        }
        let api_name = report.api_name.trim();
        if api_name.is_empty() {
            return Err(Error::validation("apiName is required"));
        }
        if !(MIN_STATUS_CODE..=MAX_STATUS_CODE).contains(&report.status_code) {
            return Err(Error::validation(format!(
                "statusCode must be between {MIN_STATUS_CODE} and {MAX_STATUS_CODE}, got {}",
                report.status_code
            )));
        }

        let timestamp = report
            .timestamp
            .as_deref()
            .and_then(parse_client_timestamp)
            .unwrap_or(received_at);

        Ok(Self::from_parts(
            Uuid::now_v7(),
            application_name.to_string(),
            api_name.to_string(),
            report.status_code,
            report.message,
            timestamp,
            1,
        ))
    }

    /// Rebuild an event read back from a store
    pub(crate) fn from_parts(
        id: Uuid,
        application_name: String,
        api_name: String,
        status_code: u16,
        message: Option<String>,
        timestamp: DateTime<Utc>,
        occurrence_count: u32,
    ) -> Self {
        Self {
            id,
            application_name,
            api_name,
            status_code,
            message,
            severity: classify(status_code),
            timestamp,
            occurrence_count: occurrence_count.max(1),
        }
    }

    /// Unique identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Reporting application
    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    /// API endpoint that failed
    pub fn api_name(&self) -> &str {
        &self.api_name
    }

    /// HTTP status code
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Error message, if one was reported
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Severity derived from the status code
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// When the error happened
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Times this error was seen; always at least 1
    pub fn occurrence_count(&self) -> u32 {
        self.occurrence_count
    }
}

/// Parse a client-supplied timestamp; `None` when blank or unparseable
fn parse_client_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
