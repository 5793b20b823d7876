use std::time::SystemTime;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

/// Health check payloads.
pub mod health;
/// Room replies and broadcast events.
pub mod room;
/// Sandbox reports and language listing.
pub mod sandbox;
/// Custom field validators.
pub mod validation;
/// WebSocket frames.
pub mod ws;

fn format_system_time(time: SystemTime) -> String {
    OffsetDateTime::from(time)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "invalid-timestamp".into())
}
