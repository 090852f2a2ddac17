//! # Tripwire
//!
//! Alert decision and deduplication engine for application error reports.
//!
//! Tripwire receives error reports (application, API endpoint, HTTP status),
//! classifies their severity and decides whether an alert goes out, so that
//! on-call engineers hear about real problems without being flooded.
//!
//! ## Architecture
//!
//! - **Ingest**: validates and stores reports, then evaluates them inline
//! - **Alerting**: critical and high-frequency rules with per-kind cooldowns
//! - **Scanner**: periodic re-evaluation, health checks and retention
//! - **Storage**: PostgreSQL in production, an in-memory store for tests
//!
//! ## Quick Start
//!
//! ```bash
//! # Run the scanner against PostgreSQL
//! tripwire db migrate
//! tripwire serve
//!
//! # Report an error
//! tripwire ingest --app payment-service --api /api/pay --status 503
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod alerting;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod models;

pub use config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::alerting::{AlertEngine, NotificationSink, Scanner};
    pub use crate::config::Config;
    pub use crate::db::{Database, MemoryStore};
    pub use crate::error::{Error, Result};
    pub use crate::ingest::{IngestOutcome, IngestService};
    pub use crate::models::*;
}
