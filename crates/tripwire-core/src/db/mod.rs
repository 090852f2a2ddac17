//! Storage layer for Tripwire
//!
//! The alert engine only sees the two store traits below. PostgreSQL backs
//! them in production; an in-memory store backs tests and local trials.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgAlertStore, PgErrorStore, PostgresPool};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::models::{AlertKind, AlertRecord, DeliveryStatus, ErrorEvent};

/// Durable store of ingested errors
#[async_trait]
pub trait ErrorRecordStore: Send + Sync {
    /// Persist a new event and return its id
    async fn insert(&self, event: &ErrorEvent) -> Result<Uuid>;

    /// Events with `timestamp > since`
    async fn find_since(&self, since: DateTime<Utc>) -> Result<Vec<ErrorEvent>>;

    /// Events matching status, application and api with `timestamp > since`
    async fn find_by_status_and_app_api_since(
        &self,
        status_code: u16,
        application_name: &str,
        api_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ErrorEvent>>;

    /// Total number of stored events
    async fn count_all(&self) -> Result<u64>;

    /// Delete events with `timestamp < cutoff`, returning how many went
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Durable record of every alert dispatch attempt
#[async_trait]
pub trait AlertHistoryStore: Send + Sync {
    /// Number of SENT records for the error and kind with `sent_at > since`
    async fn count_sent_since(
        &self,
        error_id: Uuid,
        kind: AlertKind,
        since: DateTime<Utc>,
    ) -> Result<u64>;

    /// Append a record unconditionally
    async fn insert(&self, record: &AlertRecord) -> Result<Uuid>;

    /// Claim a dispatch by appending `record` as PENDING, unless a SENT or
    /// PENDING record for the same error and kind exists with `sent_at > since`.
    /// The check and the write happen as one atomic step; `None` means another
    /// evaluation holds the claim.
    async fn claim(&self, record: &AlertRecord, since: DateTime<Utc>) -> Result<Option<Uuid>>;

    /// Settle a claimed record with the delivery outcome
    async fn settle(&self, id: Uuid, status: DeliveryStatus) -> Result<()>;

    /// SENT record counts per kind with `start <= sent_at <= end`
    async fn count_by_kind_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<AlertKind, u64>>;

    /// FAILED record count with `start <= sent_at <= end`
    async fn count_failed_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<u64>;

    /// Records with `sent_at > since`, newest first
    async fn find_recent(&self, since: DateTime<Utc>) -> Result<Vec<AlertRecord>>;

    /// Delete records with `sent_at < cutoff`, returning how many went
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Store handles shared by the ingestion path, the engine and the scanner
#[derive(Clone)]
pub struct Database {
    /// Error record store
    pub errors: Arc<dyn ErrorRecordStore>,
    /// Alert history store
    pub alerts: Arc<dyn AlertHistoryStore>,
    postgres: Option<PostgresPool>,
}

impl Database {
    /// Connect to PostgreSQL
    pub async fn connect(config: &Config) -> Result<Self> {
        let postgres = PostgresPool::new(&config.database).await?;

        Ok(Self {
            errors: Arc::new(PgErrorStore::new(&postgres)),
            alerts: Arc::new(PgAlertStore::new(&postgres)),
            postgres: Some(postgres),
        })
    }

    /// Both stores backed by one in-memory store
    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            errors: store.clone(),
            alerts: store,
            postgres: None,
        }
    }

    /// Run database migrations (no-op for the in-memory store)
    pub async fn migrate(&self) -> Result<()> {
        match &self.postgres {
            Some(pg) => pg.migrate().await,
            None => Ok(()),
        }
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        match &self.postgres {
            Some(pg) => pg.health_check().await,
            None => self.errors.count_all().await.map(|_| ()),
        }
    }
}
