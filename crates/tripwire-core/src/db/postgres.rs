//! PostgreSQL connection and queries

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::debug;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::models::{AlertKind, AlertRecord, DeliveryStatus, ErrorEvent};

use super::{AlertHistoryStore, ErrorRecordStore};

/// PostgreSQL connection pool
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    /// Create a new PostgreSQL connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Error record store backed by the `error_events` table
#[derive(Clone)]
pub struct PgErrorStore {
    pool: PgPool,
}

impl PgErrorStore {
    /// Create a new error store
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool.clone(),
        }
    }
}

#[async_trait]
impl ErrorRecordStore for PgErrorStore {
    async fn insert(&self, event: &ErrorEvent) -> Result<Uuid> {
        sqlx::query(
            r#"
            INSERT INTO error_events (
                id, application_name, api_name, status_code, message,
                severity, timestamp, occurrence_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id())
        .bind(event.application_name())
        .bind(event.api_name())
        .bind(i32::from(event.status_code()))
        .bind(event.message())
        .bind(event.severity().as_str())
        .bind(event.timestamp())
        .bind(i64::from(event.occurrence_count()))
        .execute(&self.pool)
        .await?;

        Ok(event.id())
    }

    async fn find_since(&self, since: DateTime<Utc>) -> Result<Vec<ErrorEvent>> {
        let rows = sqlx::query_as::<_, ErrorEventRow>(
            r#"
            SELECT id, application_name, api_name, status_code, message, timestamp, occurrence_count
            FROM error_events
            WHERE timestamp > $1
            ORDER BY timestamp ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ErrorEvent::try_from).collect()
    }

    async fn find_by_status_and_app_api_since(
        &self,
        status_code: u16,
        application_name: &str,
        api_name: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ErrorEvent>> {
        let rows = sqlx::query_as::<_, ErrorEventRow>(
            r#"
            SELECT id, application_name, api_name, status_code, message, timestamp, occurrence_count
            FROM error_events
            WHERE status_code = $1
              AND application_name = $2
              AND api_name = $3
              AND timestamp > $4
            ORDER BY timestamp ASC
            "#,
        )
        .bind(i32::from(status_code))
        .bind(application_name)
        .bind(api_name)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ErrorEvent::try_from).collect()
    }

    async fn count_all(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM error_events")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM error_events WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// Alert history store backed by the `alert_records` table
#[derive(Clone)]
pub struct PgAlertStore {
    pool: PgPool,
}

impl PgAlertStore {
    /// Create a new alert history store
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool.clone(),
        }
    }
}

const INSERT_ALERT_SQL: &str = r#"
    INSERT INTO alert_records (
        id, error_id, alert_kind, recipient, subject, body, sent_at, delivery_status
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
"#;

const COUNT_SENT_SQL: &str = r#"
    SELECT COUNT(*) FROM alert_records
    WHERE error_id = $1
      AND alert_kind = $2
      AND delivery_status = 'SENT'
      AND sent_at > $3
"#;

const COUNT_CLAIMED_SQL: &str = r#"
    SELECT COUNT(*) FROM alert_records
    WHERE error_id = $1
      AND alert_kind = $2
      AND delivery_status IN ('SENT', 'PENDING')
      AND sent_at > $3
"#;

fn bind_record<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    record: &'q AlertRecord,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(record.id)
        .bind(record.error_id)
        .bind(record.alert_kind.as_str())
        .bind(&record.recipient)
        .bind(&record.subject)
        .bind(&record.body)
        .bind(record.sent_at)
        .bind(record.delivery_status.as_str())
}

#[async_trait]
impl AlertHistoryStore for PgAlertStore {
    async fn count_sent_since(
        &self,
        error_id: Uuid,
        kind: AlertKind,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(COUNT_SENT_SQL)
            .bind(error_id)
            .bind(kind.as_str())
            .bind(since)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }

    async fn insert(&self, record: &AlertRecord) -> Result<Uuid> {
        bind_record(sqlx::query(INSERT_ALERT_SQL), record)
            .execute(&self.pool)
            .await?;

        Ok(record.id)
    }

    async fn claim(&self, record: &AlertRecord, since: DateTime<Utc>) -> Result<Option<Uuid>> {
        let mut tx = self.pool.begin().await?;

        // Serialises concurrent claims for this (error, kind) pair until commit.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{}:{}", record.error_id, record.alert_kind))
            .execute(&mut *tx)
            .await?;

        let held: i64 = sqlx::query_scalar(COUNT_CLAIMED_SQL)
            .bind(record.error_id)
            .bind(record.alert_kind.as_str())
            .bind(since)
            .fetch_one(&mut *tx)
            .await?;

        if held > 0 {
            tx.rollback().await?;
            debug!(
                error_id = %record.error_id,
                kind = %record.alert_kind,
                "Alert already sent or in flight, not claiming"
            );
            return Ok(None);
        }

        let pending = AlertRecord {
            delivery_status: DeliveryStatus::Pending,
            ..record.clone()
        };
        bind_record(sqlx::query(INSERT_ALERT_SQL), &pending)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(record.id))
    }

    async fn settle(&self, id: Uuid, status: DeliveryStatus) -> Result<()> {
        let result = sqlx::query("UPDATE alert_records SET delivery_status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::internal(format!("no alert record {id} to settle")));
        }
        Ok(())
    }

    async fn count_by_kind_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HashMap<AlertKind, u64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT alert_kind, COUNT(*)
            FROM alert_records
            WHERE delivery_status = 'SENT'
              AND sent_at BETWEEN $1 AND $2
            GROUP BY alert_kind
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for (kind, count) in rows {
            counts.insert(kind.parse::<AlertKind>()?, count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn count_failed_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM alert_records
            WHERE delivery_status = 'FAILED'
              AND sent_at BETWEEN $1 AND $2
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn find_recent(&self, since: DateTime<Utc>) -> Result<Vec<AlertRecord>> {
        let rows = sqlx::query_as::<_, AlertRecordRow>(
            r#"
            SELECT * FROM alert_records
            WHERE sent_at > $1
            ORDER BY sent_at DESC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AlertRecord::try_from).collect()
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM alert_records WHERE sent_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

// Database row types for mapping

#[derive(sqlx::FromRow)]
struct ErrorEventRow {
    id: Uuid,
    application_name: String,
    api_name: String,
    status_code: i32,
    message: Option<String>,
    timestamp: DateTime<Utc>,
    occurrence_count: i64,
}

impl TryFrom<ErrorEventRow> for ErrorEvent {
    type Error = Error;

    fn try_from(row: ErrorEventRow) -> Result<Self> {
        let status_code = u16::try_from(row.status_code).map_err(|_| {
            Error::internal(format!("stored status code out of range: {}", row.status_code))
        })?;

        Ok(ErrorEvent::from_parts(
            row.id,
            row.application_name,
            row.api_name,
            status_code,
            row.message,
            row.timestamp,
            u32::try_from(row.occurrence_count).unwrap_or(1),
        ))
    }
}

#[derive(sqlx::FromRow)]
struct AlertRecordRow {
    id: Uuid,
    error_id: Uuid,
    alert_kind: String,
    recipient: String,
    subject: String,
    body: String,
    sent_at: DateTime<Utc>,
    delivery_status: String,
}

impl TryFrom<AlertRecordRow> for AlertRecord {
    type Error = Error;

    fn try_from(row: AlertRecordRow) -> Result<Self> {
        Ok(AlertRecord {
            id: row.id,
            error_id: row.error_id,
            alert_kind: row.alert_kind.parse()?,
            recipient: row.recipient,
            subject: row.subject,
            body: row.body,
            sent_at: row.sent_at,
            delivery_status: row.delivery_status.parse::<DeliveryStatus>()?,
        })
    }
}
