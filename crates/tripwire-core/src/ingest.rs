//! Error ingestion
//!
//! Stores a reported error and runs a best-effort alert evaluation. Alerting
//! trouble never rejects a report: once the event is stored, ingestion
//! succeeds and the periodic scanner picks up anything that was missed.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::alerting::AlertEngine;
use crate::db::ErrorRecordStore;
use crate::error::Result;
use crate::models::{ErrorEvent, ErrorReport, EvaluationResult};

/// What happened to one ingested report
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    /// The stored event
    pub event: ErrorEvent,
    /// Inline evaluation result, `None` when it was skipped or failed
    pub evaluation: Option<EvaluationResult>,
}

/// Validates, stores and evaluates incoming error reports
#[derive(Clone)]
pub struct IngestService {
    errors: Arc<dyn ErrorRecordStore>,
    engine: Option<Arc<AlertEngine>>,
}

impl IngestService {
    /// Create a service; pass `None` to rely on the scanner alone
    pub fn new(errors: Arc<dyn ErrorRecordStore>, engine: Option<Arc<AlertEngine>>) -> Self {
        Self { errors, engine }
    }

    /// Store a report and evaluate it inline.
    ///
    /// Fails only on validation or when the event cannot be stored.
    pub async fn ingest(&self, report: ErrorReport) -> Result<IngestOutcome> {
        let event = self.store(report).await?;

        let evaluation = match &self.engine {
            Some(engine) => evaluate_best_effort(engine, &event).await,
            None => None,
        };

        Ok(IngestOutcome { event, evaluation })
    }

    /// Store a report and evaluate it on a background task, returning as
    /// soon as the event is stored
    pub async fn ingest_detached(
        &self,
        report: ErrorReport,
    ) -> Result<(ErrorEvent, Option<JoinHandle<Option<EvaluationResult>>>)> {
        let event = self.store(report).await?;

        let handle = self.engine.clone().map(|engine| {
            let event = event.clone();
            tokio::spawn(async move { evaluate_best_effort(&engine, &event).await })
        });

        Ok((event, handle))
    }

    async fn store(&self, report: ErrorReport) -> Result<ErrorEvent> {
        let event = ErrorEvent::from_report(report, Utc::now())?;
        self.errors.insert(&event).await?;

        debug!(
            error_id = %event.id(),
            application = event.application_name(),
            api = event.api_name(),
            status = event.status_code(),
            severity = %event.severity(),
            "Error ingested"
        );

        Ok(event)
    }
}

async fn evaluate_best_effort(engine: &AlertEngine, event: &ErrorEvent) -> Option<EvaluationResult> {
    match engine.evaluate(event).await {
        Ok(result) => Some(result),
        Err(e) => {
            warn!(
                error_id = %event.id(),
                error = %e,
                "Alert processing failed, deferring to scanner"
            );
            None
        }
    }
}
