//! Alerting system for Tripwire
//!
//! Critical and high-frequency rule evaluation, cooldown-based
//! deduplication, notification delivery and the periodic scanner.

mod engine;
pub mod message;
mod notifier;
mod scheduler;

pub use engine::AlertEngine;
pub use notifier::{
    build_sink, deliver, EmailSink, LogSink, NotificationError, NotificationResult,
    NotificationSink, WebhookSink,
};
pub use scheduler::{CleanupSummary, HealthReport, ScanSummary, Scanner, ScannerHandle};
