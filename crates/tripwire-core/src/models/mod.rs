//! Data models for Tripwire

mod alert;
mod error_event;

pub use alert::*;
pub use error_event::*;
