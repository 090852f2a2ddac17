//! Alert subject and body composition

use chrono::SecondsFormat;

use crate::models::ErrorEvent;

/// Subject and body of an outgoing alert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    /// Subject line
    pub subject: String,
    /// Plain-text body
    pub body: String,
}

/// Message for a single critical error
pub fn critical(event: &ErrorEvent) -> ComposedMessage {
    let subject = format!(
        "CRITICAL ERROR: {} - {}",
        event.application_name(),
        event.api_name()
    );

    let body = format!(
        "CRITICAL ERROR ALERT\n\
         \n\
         Application: {}\n\
         API: {}\n\
         Status Code: {}\n\
         Severity: {}\n\
         Time: {}\n\
         Message: {}\n\
         \n\
         This is a critical error that requires immediate attention.\n",
        event.application_name(),
        event.api_name(),
        event.status_code(),
        event.severity(),
        event
            .timestamp()
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        message_or_placeholder(event),
    );

    ComposedMessage { subject, body }
}

/// Message for a burst of matching errors
pub fn high_frequency(
    event: &ErrorEvent,
    observed: usize,
    threshold: u32,
    window_minutes: u32,
) -> ComposedMessage {
    let subject = format!(
        "HIGH FREQUENCY ERROR: {} - {}",
        event.application_name(),
        event.api_name()
    );

    let body = format!(
        "HIGH FREQUENCY ERROR ALERT\n\
         \n\
         Application: {}\n\
         API: {}\n\
         Status Code: {}\n\
         Severity: {}\n\
         Time Window: Last {} minutes\n\
         Error Count: {} (threshold: {})\n\
         \n\
         Most Recent Error:\n\
         Time: {}\n\
         Message: {}\n\
         \n\
         This endpoint is experiencing a high volume of errors.\n",
        event.application_name(),
        event.api_name(),
        event.status_code(),
        event.severity(),
        window_minutes,
        observed,
        threshold,
        event
            .timestamp()
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        message_or_placeholder(event),
    );

    ComposedMessage { subject, body }
}

fn message_or_placeholder(event: &ErrorEvent) -> &str {
    match event.message() {
        Some(m) if !m.trim().is_empty() => m,
        _ => "(no message)",
    }
}
