//! Alert decision engine
//!
//! Evaluates the critical and high-frequency rules for one error, dispatches
//! through the notification sink and records every attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{lookback, AlertingConfig, NotificationConfig};
use crate::db::{AlertHistoryStore, Database, ErrorRecordStore};
use crate::error::Result;
use crate::models::{AlertKind, AlertRecord, DeliveryStatus, ErrorEvent, EvaluationResult, Severity};

use super::message::{self, ComposedMessage};
use super::notifier::{deliver, NotificationSink};

/// Decides whether an error warrants an alert and sends it
pub struct AlertEngine {
    errors: Arc<dyn ErrorRecordStore>,
    alerts: Arc<dyn AlertHistoryStore>,
    sink: Arc<dyn NotificationSink>,
    config: AlertingConfig,
    recipient: String,
    delivery_timeout: Duration,
    /// Serialises check, claim, send and settle per (error, kind) inside this process
    dispatch_locks: DashMap<(Uuid, AlertKind), Arc<Mutex<()>>>,
}

impl AlertEngine {
    /// Create a new alert engine
    pub fn new(
        db: &Database,
        sink: Arc<dyn NotificationSink>,
        config: AlertingConfig,
        notification: &NotificationConfig,
    ) -> Self {
        Self {
            errors: db.errors.clone(),
            alerts: db.alerts.clone(),
            sink,
            config,
            recipient: notification.recipient.clone(),
            delivery_timeout: notification.timeout(),
            dispatch_locks: DashMap::new(),
        }
    }

    /// Evaluate every rule for `event` as of now
    pub async fn evaluate(&self, event: &ErrorEvent) -> Result<EvaluationResult> {
        self.evaluate_at(event, Utc::now()).await
    }

    /// Evaluate every rule for `event` as of `now`.
    ///
    /// Delivery failures are recorded and reported as "not fired". Store
    /// failures abort the evaluation and are returned to the caller.
    pub async fn evaluate_at(
        &self,
        event: &ErrorEvent,
        now: DateTime<Utc>,
    ) -> Result<EvaluationResult> {
        debug!(
            error_id = %event.id(),
            application = event.application_name(),
            api = event.api_name(),
            status = event.status_code(),
            "Evaluating error for alerting"
        );

        let mut result = EvaluationResult::default();

        if event.severity() == Severity::Critical {
            result.critical_fired = self
                .dispatch(event, AlertKind::Critical, now, None)
                .await?;
        }

        let window_start = lookback(now, self.config.high_frequency_window())?;
        let observed = self
            .errors
            .find_by_status_and_app_api_since(
                event.status_code(),
                event.application_name(),
                event.api_name(),
                window_start,
            )
            .await?
            .len();

        if observed >= self.config.high_frequency_threshold_count as usize {
            result.high_frequency_fired = self
                .dispatch(event, AlertKind::HighFrequency, now, Some(observed))
                .await?;
        }

        if result.any_fired() {
            info!(
                error_id = %event.id(),
                critical = result.critical_fired,
                high_frequency = result.high_frequency_fired,
                "Alert(s) sent"
            );
        } else {
            debug!(
                error_id = %event.id(),
                observed,
                "No alerts sent (cooldown active or threshold not met)"
            );
        }

        Ok(result)
    }

    fn cooldown(&self, kind: AlertKind) -> chrono::Duration {
        match kind {
            AlertKind::Critical => self.config.critical_cooldown(),
            AlertKind::HighFrequency => self.config.high_frequency_cooldown(),
        }
    }

    /// Run one rule's dispatch under the per-(error, kind) lock
    async fn dispatch(
        &self,
        event: &ErrorEvent,
        kind: AlertKind,
        now: DateTime<Utc>,
        observed: Option<usize>,
    ) -> Result<bool> {
        let key = (event.id(), kind);
        let lock = self.dispatch_locks.entry(key).or_default().clone();

        let outcome = {
            let _guard = lock.lock().await;
            self.dispatch_locked(event, kind, now, observed).await
        };

        drop(lock);
        self.dispatch_locks
            .remove_if(&key, |_, l| Arc::strong_count(l) == 1);

        outcome
    }

    async fn dispatch_locked(
        &self,
        event: &ErrorEvent,
        kind: AlertKind,
        now: DateTime<Utc>,
        observed: Option<usize>,
    ) -> Result<bool> {
        let cooldown_start = lookback(now, self.cooldown(kind))?;

        let already_sent = self
            .alerts
            .count_sent_since(event.id(), kind, cooldown_start)
            .await?;
        if already_sent > 0 {
            debug!(error_id = %event.id(), kind = %kind, "Alert suppressed by cooldown");
            return Ok(false);
        }

        let ComposedMessage { subject, body } = match kind {
            AlertKind::Critical => message::critical(event),
            AlertKind::HighFrequency => message::high_frequency(
                event,
                observed.unwrap_or_default(),
                self.config.high_frequency_threshold_count,
                self.config.high_frequency_window_minutes,
            ),
        };

        let record = AlertRecord {
            id: Uuid::now_v7(),
            error_id: event.id(),
            alert_kind: kind,
            recipient: self.recipient.clone(),
            subject,
            body,
            sent_at: now,
            delivery_status: DeliveryStatus::Pending,
        };

        // Another engine or process may have claimed it since the check above
        if self.alerts.claim(&record, cooldown_start).await?.is_none() {
            debug!(
                error_id = %event.id(),
                kind = %kind,
                "Alert already sent or in flight elsewhere"
            );
            return Ok(false);
        }

        let delivery = deliver(
            self.sink.as_ref(),
            &self.recipient,
            &record.subject,
            &record.body,
            self.delivery_timeout,
        )
        .await;

        let status = if delivery.delivered {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Failed
        };
        self.alerts.settle(record.id, status).await?;

        if !delivery.delivered {
            warn!(
                error_id = %event.id(),
                kind = %kind,
                channel = %delivery.channel_type,
                error = delivery.error.as_deref().unwrap_or("unknown"),
                "Alert delivery failed"
            );
            return Ok(false);
        }

        info!(
            error_id = %event.id(),
            alert_id = %record.id,
            kind = %kind,
            "Alert sent"
        );
        Ok(true)
    }
}
