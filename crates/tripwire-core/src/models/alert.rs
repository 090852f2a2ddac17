//! Alert data models

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which rule produced an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    /// A single error with a 5xx status
    Critical,
    /// A burst of matching errors inside the frequency window
    HighFrequency,
}

impl AlertKind {
    /// Stable string form used in storage
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::Critical => "CRITICAL",
            AlertKind::HighFrequency => "HIGH_FREQUENCY",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CRITICAL" => Ok(AlertKind::Critical),
            "HIGH_FREQUENCY" => Ok(AlertKind::HighFrequency),
            other => Err(crate::error::Error::internal(format!(
                "unknown alert kind: {other}"
            ))),
        }
    }
}

/// Outcome of a notification attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    /// Claimed by an evaluation whose delivery is still in flight
    Pending,
    /// The sink reported delivery
    Sent,
    /// The sink failed, refused, or timed out
    Failed,
}

impl DeliveryStatus {
    /// Stable string form used in storage
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(DeliveryStatus::Pending),
            "SENT" => Ok(DeliveryStatus::Sent),
            "FAILED" => Ok(DeliveryStatus::Failed),
            other => Err(crate::error::Error::internal(format!(
                "unknown delivery status: {other}"
            ))),
        }
    }
}

/// Audit record of one notification dispatch attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    /// Unique identifier
    pub id: Uuid,

    /// The error that triggered this alert
    pub error_id: Uuid,

    /// Rule that fired
    pub alert_kind: AlertKind,

    /// Where the notification was sent
    pub recipient: String,

    /// Subject line as sent
    pub subject: String,

    /// Message body as sent
    pub body: String,

    /// When the dispatch was attempted
    pub sent_at: DateTime<Utc>,

    /// Whether the sink delivered it
    pub delivery_status: DeliveryStatus,
}

impl AlertRecord {
    /// Whether this record counts toward cooldown suppression
    pub fn is_sent(&self) -> bool {
        self.delivery_status == DeliveryStatus::Sent
    }

    /// Whether this record blocks a new dispatch: delivered, or still being delivered
    pub fn holds_claim(&self) -> bool {
        matches!(
            self.delivery_status,
            DeliveryStatus::Sent | DeliveryStatus::Pending
        )
    }
}

/// Result of evaluating one error against every rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationResult {
    /// A critical alert was dispatched and delivered
    pub critical_fired: bool,
    /// A high-frequency alert was dispatched and delivered
    pub high_frequency_fired: bool,
}

impl EvaluationResult {
    /// Whether any alert went out
    pub fn any_fired(&self) -> bool {
        self.critical_fired || self.high_frequency_fired
    }
}

/// Alert counts over a time range
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlertStatistics {
    /// Delivered critical alerts
    pub critical_count: u64,
    /// Delivered high-frequency alerts
    pub high_frequency_count: u64,
    /// Delivered alerts of any kind
    pub total_count: u64,
    /// Dispatch attempts the sink did not deliver
    pub failed_count: u64,
}

impl AlertStatistics {
    /// Attach the number of failed deliveries
    pub fn with_failed(mut self, failed_count: u64) -> Self {
        self.failed_count = failed_count;
        self
    }
}

impl From<&HashMap<AlertKind, u64>> for AlertStatistics {
    fn from(counts: &HashMap<AlertKind, u64>) -> Self {
        let critical_count = counts.get(&AlertKind::Critical).copied().unwrap_or(0);
        let high_frequency_count = counts.get(&AlertKind::HighFrequency).copied().unwrap_or(0);

        Self {
            critical_count,
            high_frequency_count,
            total_count: critical_count + high_frequency_count,
            failed_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_storage_form() {
        for kind in [AlertKind::Critical, AlertKind::HighFrequency] {
            assert_eq!(kind.as_str().parse::<AlertKind>().unwrap(), kind);
        }
        assert!("THRESHOLD_EXCEEDED".parse::<AlertKind>().is_err());
    }

    #[test]
    fn test_pending_holds_claim_but_is_not_sent() {
        for (status, sent, claim) in [
            (DeliveryStatus::Pending, false, true),
            (DeliveryStatus::Sent, true, true),
            (DeliveryStatus::Failed, false, false),
        ] {
            let record = AlertRecord {
                id: Uuid::now_v7(),
                error_id: Uuid::now_v7(),
                alert_kind: AlertKind::Critical,
                recipient: "ops@example.com".to_string(),
                subject: String::new(),
                body: String::new(),
                sent_at: Utc::now(),
                delivery_status: status,
            };
            assert_eq!(record.is_sent(), sent);
            assert_eq!(record.holds_claim(), claim);
            assert_eq!(status.as_str().parse::<DeliveryStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_statistics_from_counts() {
        let mut counts = HashMap::new();
        counts.insert(AlertKind::Critical, 3);
        counts.insert(AlertKind::HighFrequency, 2);

        let stats = AlertStatistics::from(&counts);
        assert_eq!(stats.critical_count, 3);
        assert_eq!(stats.high_frequency_count, 2);
        assert_eq!(stats.total_count, 5);
        assert_eq!(stats.with_failed(4).failed_count, 4);
        assert_eq!(stats.with_failed(4).total_count, 5);

        assert_eq!(AlertStatistics::from(&HashMap::new()), AlertStatistics::default());
    }
}
