//! In-memory implementation of both stores

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{AlertKind, AlertRecord, DeliveryStatus, ErrorEvent};

use super::{AlertHistoryStore, ErrorRecordStore};

/// Error events and alert records held in process memory.
///
/// Every alert write takes the same lock as the suppression check, which
/// makes `claim` atomic.
#[derive(Default)]
pub struct MemoryStore {
    errors: RwLock<Vec<ErrorEvent>>,
    alerts: RwLock<Vec<AlertRecord>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreUnavailable` (or recover)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of every alert record, oldest first
    pub fn alert_records(&self) -> Vec<AlertRecord> {
        self.alerts.read().clone()
    }

    /// Snapshot of every error event, in insertion order
    pub fn error_events(&self) -> Vec<ErrorEvent> {
        self.errors.read().clone()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::store_unavailable("memory store marked unavailable"));
        }
        Ok(())
    }
}

fn count_sent(
    alerts: &[AlertRecord],
    error_id: Uuid,
    kind: AlertKind,
    since: DateTime<Utc>,
) -> u64 {
    alerts
        .iter()
        .filter(|a| a.error_id == error_id && a.alert_kind == kind)
        .filter(|a| a.is_sent() && a.sent_at > since)
        .count() as u64
}

#[async_trait]
impl ErrorRecordStore for MemoryStore {
    async fn insert(&self, event: &ErrorEvent) -> Result<Uuid> {
        self.check_available()?;
        let mut errors = self.errors.write();
        if errors.iter().any(|e| e.id() == event.id()) {
            return Err(Error::internal(format!("duplicate error id {}", event.id())));
        }
        errors.push(event.clone());
        Ok(event.id())
    }

    async fn find_since(&self, since: DateTime<Utc>) -> Result<Vec<ErrorEvent>> {
        self.check_available()?;
        Ok(self
            .errors
            .read()
            .iter()
            .filter(|e| e.timestamp() > since)
            .cloned()
            .collect())
    }

    async fn find_by_status_and_app_api_since(
        &self,
        status_code: u16,
        application_name: &str,
        api_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ErrorEvent>> {
        self.check_available()?;
        Ok(self
            .errors
            .read()
            .iter()
            .filter(|e| {
                e.status_code() == status_code
                    && e.application_name() == application_name
                    && e.api_name() == api_name
                    && e.timestamp() > since
            })
            .cloned()
            .collect())
    }

    async fn count_all(&self) -> Result<u64> {
        self.check_available()?;
        Ok(self.errors.read().len() as u64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_available()?;
        let mut errors = self.errors.write();
        let before = errors.len();
        errors.retain(|e| e.timestamp() >= cutoff);
        Ok((before - errors.len()) as u64)
    }
}

#[async_trait]
impl AlertHistoryStore for MemoryStore {
    async fn count_sent_since(
        &self,
        error_id: Uuid,
        kind: AlertKind,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        self.check_available()?;
        Ok(count_sent(&self.alerts.read(), error_id, kind, since))
    }

    async fn insert(&self, record: &AlertRecord) -> Result<Uuid> {
        self.check_available()?;
        self.alerts.write().push(record.clone());
        Ok(record.id)
    }

    async fn claim(&self, record: &AlertRecord, since: DateTime<Utc>) -> Result<Option<Uuid>> {
        self.check_available()?;
        let mut alerts = self.alerts.write();
        let held = alerts.iter().any(|a| {
            a.error_id == record.error_id
                && a.alert_kind == record.alert_kind
                && a.holds_claim()
                && a.sent_at > since
        });
        if held {
            return Ok(None);
        }
        alerts.push(AlertRecord {
            delivery_status: DeliveryStatus::Pending,
            ..record.clone()
        });
        Ok(Some(record.id))
    }

    async fn settle(&self, id: Uuid, status: DeliveryStatus) -> Result<()> {
        self.check_available()?;
        let mut alerts = self.alerts.write();
        let record = alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| Error::internal(format!("no alert record {id} to settle")))?;
        record.delivery_status = status;
        Ok(())
    }

    async fn count_by_kind_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<AlertKind, u64>> {
        self.check_available()?;
        let mut counts = HashMap::new();
        for record in self
            .alerts
            .read()
            .iter()
            .filter(|a| a.is_sent() && a.sent_at >= start && a.sent_at <= end)
        {
            *counts.entry(record.alert_kind).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn count_failed_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<u64> {
        self.check_available()?;
        Ok(self
            .alerts
            .read()
            .iter()
            .filter(|a| a.delivery_status == DeliveryStatus::Failed)
            .filter(|a| a.sent_at >= start && a.sent_at <= end)
            .count() as u64)
    }

    async fn find_recent(&self, since: DateTime<Utc>) -> Result<Vec<AlertRecord>> {
        self.check_available()?;
        let mut recent: Vec<AlertRecord> = self
            .alerts
            .read()
            .iter()
            .filter(|a| a.sent_at > since)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        Ok(recent)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_available()?;
        let mut alerts = self.alerts.write();
        let before = alerts.len();
        alerts.retain(|a| a.sent_at >= cutoff);
        Ok((before - alerts.len()) as u64)
    }
}
