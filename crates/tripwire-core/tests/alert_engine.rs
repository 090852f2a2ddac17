//! End-to-end behaviour of ingestion, the alert engine and the scanner
//! against the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use tokio_test::assert_ok;

use tripwire::alerting::{AlertEngine, NotificationError, NotificationSink, Scanner};
use tripwire::config::{AlertingConfig, NotificationConfig, SchedulerConfig};
use tripwire::db::{AlertHistoryStore, Database, ErrorRecordStore, MemoryStore};
use tripwire::ingest::IngestService;
use tripwire::models::{AlertKind, DeliveryStatus, ErrorEvent, ErrorReport, EvaluationResult};

/// Counts deliveries, optionally failing or stalling each one
#[derive(Default)]
struct CountingSink {
    calls: AtomicUsize,
    fail: bool,
    delay: Option<Duration>,
}

impl CountingSink {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSink for CountingSink {
    fn channel_type(&self) -> &'static str {
        "counting"
    }

    async fn send(&self, _: &str, _: &str, _: &str) -> Result<bool, NotificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(NotificationError::SmtpError("relay unreachable".to_string()));
        }
        Ok(true)
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    db: Database,
    engine: Arc<AlertEngine>,
}

impl Harness {
    fn new(sink: Arc<CountingSink>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let db = Database::in_memory(store.clone());
        let engine = Arc::new(engine_for(&db, sink));
        Self { store, db, engine }
    }

    async fn record(&self, app: &str, api: &str, status: u16, at: DateTime<Utc>) -> ErrorEvent {
        let event = ErrorEvent::from_report(report(app, api, status), at).unwrap();
        self.db.errors.insert(&event).await.unwrap();
        event
    }

    async fn sent(&self, event: &ErrorEvent, kind: AlertKind, since: DateTime<Utc>) -> u64 {
        self.db
            .alerts
            .count_sent_since(event.id(), kind, since)
            .await
            .unwrap()
    }
}

fn engine_for(db: &Database, sink: Arc<CountingSink>) -> AlertEngine {
    AlertEngine::new(
        db,
        sink,
        AlertingConfig::default(),
        &NotificationConfig::default(),
    )
}

fn report(app: &str, api: &str, status: u16) -> ErrorReport {
    ErrorReport {
        application_name: app.to_string(),
        api_name: api.to_string(),
        status_code: status,
        message: Some("upstream timeout".to_string()),
        timestamp: None,
    }
}

#[tokio::test]
async fn first_critical_error_fires_once_with_one_record() {
    let sink = Arc::new(CountingSink::default());
    let h = Harness::new(sink.clone());
    let now = Utc::now();

    let event = h.record("checkout", "/api/cart", 500, now).await;
    let result = h.engine.evaluate_at(&event, now).await.unwrap();

    assert!(result.critical_fired);
    assert!(!result.high_frequency_fired);
    let records = h.store.alert_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].alert_kind, AlertKind::Critical);
    assert_eq!(records[0].delivery_status, DeliveryStatus::Sent);
    assert_eq!(records[0].error_id, event.id());
    assert_eq!(records[0].recipient, "admin@company.com");
}

#[tokio::test]
async fn re_evaluating_within_cooldown_does_not_refire() {
    let sink = Arc::new(CountingSink::default());
    let h = Harness::new(sink.clone());
    let now = Utc::now();

    let event = h.record("checkout", "/api/cart", 503, now).await;
    assert!(h.engine.evaluate_at(&event, now).await.unwrap().critical_fired);

    let again = h
        .engine
        .evaluate_at(&event, now + ChronoDuration::minutes(10))
        .await
        .unwrap();

    assert!(!again.critical_fired);
    assert_eq!(sink.calls(), 1);
    assert_eq!(h.store.alert_records().len(), 1);
}

#[tokio::test]
async fn burst_of_five_fires_high_frequency_exactly_once() {
    let sink = Arc::new(CountingSink::default());
    let h = Harness::new(sink.clone());
    let now = Utc::now();

    let mut fired = Vec::new();
    let mut last = None;
    for i in 0..5 {
        let at = now - ChronoDuration::minutes(4 - i);
        let event = h.record("payment-service", "/api/pay", 503, at).await;
        fired.push(h.engine.evaluate_at(&event, at).await.unwrap().high_frequency_fired);
        last = Some((event, at));
    }
    assert_eq!(fired, vec![false, false, false, false, true]);

    // Same triggering error again inside the 60 minute cooldown
    let (fifth, at) = last.unwrap();
    let again = h
        .engine
        .evaluate_at(&fifth, at + ChronoDuration::minutes(1))
        .await
        .unwrap();
    assert!(!again.high_frequency_fired);

    assert_eq!(h.sent(&fifth, AlertKind::HighFrequency, now - ChronoDuration::hours(1)).await, 1);
}

#[tokio::test]
async fn distinct_errors_in_one_burst_each_get_their_own_cooldown() {
    let sink = Arc::new(CountingSink::default());
    let h = Harness::new(sink.clone());
    let now = Utc::now();

    for _ in 0..4 {
        h.record("payment-service", "/api/pay", 429, now).await;
    }
    let fifth = h.record("payment-service", "/api/pay", 429, now).await;
    let sixth = h.record("payment-service", "/api/pay", 429, now).await;

    assert!(h.engine.evaluate_at(&fifth, now).await.unwrap().high_frequency_fired);
    assert!(h.engine.evaluate_at(&sixth, now).await.unwrap().high_frequency_fired);
}

#[tokio::test]
async fn failing_sink_records_failure_and_does_not_block_later_alerts() {
    let failing = Arc::new(CountingSink::failing());
    let h = Harness::new(failing.clone());
    let now = Utc::now();

    let first = h.record("billing", "/api/invoice", 502, now).await;
    let result = assert_ok!(h.engine.evaluate_at(&first, now).await);
    assert!(!result.critical_fired);

    let records = h.store.alert_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].delivery_status, DeliveryStatus::Failed);

    // Same store, working sink: the FAILED record must not count as a cooldown
    let working = Arc::new(CountingSink::default());
    let engine = engine_for(&h.db, working.clone());
    let second = h.record("billing", "/api/invoice", 502, now).await;

    assert!(engine.evaluate_at(&second, now).await.unwrap().critical_fired);
    assert!(engine.evaluate_at(&first, now).await.unwrap().critical_fired);
    assert_eq!(working.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_evaluations_send_one_alert_per_kind() {
    let sink = Arc::new(CountingSink::slow(Duration::from_millis(50)));
    let h = Harness::new(sink.clone());
    let now = Utc::now();

    for _ in 0..4 {
        h.record("search", "/api/query", 500, now).await;
    }
    let event = h.record("search", "/api/query", 500, now).await;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let engine = h.engine.clone();
            let event = event.clone();
            tokio::spawn(async move { engine.evaluate_at(&event, now).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let since = now - ChronoDuration::hours(1);
    assert_eq!(h.sent(&event, AlertKind::Critical, since).await, 1);
    assert_eq!(h.sent(&event, AlertKind::HighFrequency, since).await, 1);
    assert_eq!(sink.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn separate_engines_sharing_a_store_dispatch_once() {
    let sink = Arc::new(CountingSink::slow(Duration::from_millis(50)));
    let h = Harness::new(sink.clone());
    let other = Arc::new(engine_for(&h.db, sink.clone()));
    let now = Utc::now();

    let event = h.record("search", "/api/query", 504, now).await;

    let (a, b) = tokio::join!(
        h.engine.evaluate_at(&event, now),
        other.evaluate_at(&event, now)
    );
    let fired = [a.unwrap().critical_fired, b.unwrap().critical_fired];

    assert_eq!(fired.iter().filter(|f| **f).count(), 1);
    assert_eq!(sink.calls(), 1);
    assert_eq!(
        h.sent(&event, AlertKind::Critical, now - ChronoDuration::hours(1)).await,
        1
    );

    // Every delivery attempt has exactly one settled record
    let records = h.store.alert_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].delivery_status, DeliveryStatus::Sent);
}

#[tokio::test]
async fn delivery_failure_does_not_stop_the_other_rule() {
    let sink = Arc::new(CountingSink::failing());
    let h = Harness::new(sink.clone());
    let now = Utc::now();

    for _ in 0..4 {
        h.record("payment-service", "/api/pay", 503, now).await;
    }
    let event = h.record("payment-service", "/api/pay", 503, now).await;

    let result = assert_ok!(h.engine.evaluate_at(&event, now).await);
    assert_eq!(result, EvaluationResult::default());
    assert_eq!(sink.calls(), 2);

    let mut records: Vec<_> = h
        .store
        .alert_records()
        .into_iter()
        .map(|r| (r.alert_kind, r.delivery_status, r.error_id))
        .collect();
    records.sort_by_key(|(kind, _, _)| kind.as_str());
    assert_eq!(
        records,
        vec![
            (AlertKind::Critical, DeliveryStatus::Failed, event.id()),
            (AlertKind::HighFrequency, DeliveryStatus::Failed, event.id()),
        ]
    );
}

#[tokio::test]
async fn health_check_flags_errors_with_nothing_delivered() {
    let sink = Arc::new(CountingSink::failing());
    let h = Harness::new(sink);
    let now = Utc::now();

    for _ in 0..11 {
        let event = h
            .record("orders", "/api/submit", 500, now - ChronoDuration::minutes(2))
            .await;
        h.engine.evaluate_at(&event, now).await.unwrap();
    }

    let scanner = Scanner::new(h.engine.clone(), h.db.clone(), SchedulerConfig::default());
    let report = scanner.health_check_at(now).await.unwrap();

    assert_eq!(report.recent_errors, 11);
    assert_eq!(report.alerts_24h.total_count, 0);
    assert!(report.alerts_24h.failed_count >= 11);
    assert!(report.alerting_looks_quiet());
}

#[tokio::test]
async fn scan_continues_past_failed_evaluations() {
    let sink = Arc::new(CountingSink::default());
    let h = Harness::new(sink.clone());
    let now = Utc::now();

    h.record("catalog", "/api/items", 500, now - ChronoDuration::minutes(1)).await;
    h.record("catalog", "/api/items", 404, now - ChronoDuration::minutes(2)).await;
    h.record("catalog", "/api/items", 500, now - ChronoDuration::minutes(10)).await;

    let scanner = Scanner::new(h.engine.clone(), h.db.clone(), SchedulerConfig::default());
    let summary = scanner.scan_at(now).await.unwrap();

    // The 10 minute old error is outside the 5 minute scan window
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.critical_sent, 1);
    assert_eq!(summary.failed, 0);

    // A second cycle finds everything already alerted
    let summary = scanner.scan_at(now).await.unwrap();
    assert_eq!(summary.critical_sent, 0);
    assert_eq!(sink.calls(), 1);
}

#[tokio::test]
async fn scan_reports_store_outage() {
    let sink = Arc::new(CountingSink::default());
    let h = Harness::new(sink);
    let scanner = Scanner::new(h.engine.clone(), h.db.clone(), SchedulerConfig::default());

    h.store.set_unavailable(true);
    let err = scanner.scan().await.unwrap_err();
    assert!(err.is_store_unavailable());
}

#[tokio::test]
async fn retention_deletes_only_strictly_older_rows() {
    let sink = Arc::new(CountingSink::default());
    let h = Harness::new(sink);
    let now = Utc::now();
    let config = SchedulerConfig::default();
    let cutoff = now - config.retention();

    let old = h.record("ledger", "/api/post", 500, cutoff - ChronoDuration::seconds(1)).await;
    let at_cutoff = h.record("ledger", "/api/post", 500, cutoff).await;
    let fresh = h.record("ledger", "/api/post", 500, now).await;

    let evaluations = [
        (&old, cutoff - ChronoDuration::seconds(1)),
        (&at_cutoff, cutoff),
        (&fresh, now),
    ];
    for (event, at) in evaluations {
        assert!(h.engine.evaluate_at(event, at).await.unwrap().critical_fired);
    }

    let scanner = Scanner::new(h.engine.clone(), h.db.clone(), config);
    let summary = scanner.cleanup_at(now).await.unwrap();

    assert_eq!(summary.cutoff, cutoff);
    assert_eq!(summary.errors_deleted, 1);
    assert_eq!(summary.alerts_deleted, 1);

    let remaining: Vec<_> = h.store.error_events().iter().map(ErrorEvent::id).collect();
    assert_eq!(remaining, vec![at_cutoff.id(), fresh.id()]);
    assert!(h
        .store
        .alert_records()
        .iter()
        .all(|r| r.error_id != old.id()));
}

#[tokio::test]
async fn health_check_counts_recent_errors_and_alerts() {
    let sink = Arc::new(CountingSink::default());
    let h = Harness::new(sink);
    let now = Utc::now();

    let event = h.record("auth", "/api/login", 500, now - ChronoDuration::minutes(5)).await;
    h.record("auth", "/api/login", 401, now - ChronoDuration::hours(3)).await;
    h.engine.evaluate_at(&event, now).await.unwrap();

    let scanner = Scanner::new(h.engine.clone(), h.db.clone(), SchedulerConfig::default());
    let report = scanner.health_check_at(now).await.unwrap();

    assert_eq!(report.total_errors, 2);
    assert_eq!(report.recent_errors, 1);
    assert_eq!(report.alerts_24h.critical_count, 1);
    assert_eq!(report.alerts_24h.total_count, 1);
    assert!(!report.alerting_looks_quiet());
}

#[tokio::test]
async fn ingestion_succeeds_when_alert_history_is_unavailable() {
    let sink = Arc::new(CountingSink::default());
    let h = Harness::new(sink.clone());
    let service = IngestService::new(
        Arc::new(StoreThatOnlyWrites(h.store.clone())),
        Some(h.engine.clone()),
    );

    // The event lands, then every read the engine makes fails
    let outcome = service.ingest(report("orders", "/api/submit", 500)).await;
    h.store.set_unavailable(false);

    let outcome = outcome.unwrap();
    assert!(outcome.evaluation.is_none());
    assert_eq!(sink.calls(), 0);
    assert_eq!(h.store.error_events().len(), 1);
}

/// Error store that keeps accepting inserts while the backing store is down
struct StoreThatOnlyWrites(Arc<MemoryStore>);

#[async_trait]
impl ErrorRecordStore for StoreThatOnlyWrites {
    async fn insert(&self, event: &ErrorEvent) -> tripwire::Result<uuid::Uuid> {
        self.0.set_unavailable(false);
        let id = ErrorRecordStore::insert(self.0.as_ref(), event).await;
        self.0.set_unavailable(true);
        id
    }

    async fn find_since(&self, since: DateTime<Utc>) -> tripwire::Result<Vec<ErrorEvent>> {
        self.0.find_since(since).await
    }

    async fn find_by_status_and_app_api_since(
        &self,
        status_code: u16,
        application_name: &str,
        api_name: &str,
        since: DateTime<Utc>,
    ) -> tripwire::Result<Vec<ErrorEvent>> {
        self.0
            .find_by_status_and_app_api_since(status_code, application_name, api_name, since)
            .await
    }

    async fn count_all(&self) -> tripwire::Result<u64> {
        self.0.count_all().await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> tripwire::Result<u64> {
        ErrorRecordStore::delete_older_than(self.0.as_ref(), cutoff).await
    }
}
