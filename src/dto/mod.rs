//! Request and response payloads exposed over HTTP.

use time::{OffsetDateTime, format_description::well_known::Rfc3339};

pub mod currency;
pub mod health;
pub mod participant;
pub mod session;
pub mod trigger;
pub mod validation;
pub mod ws;

pub(crate) fn format_timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| "invalid-timestamp".into())
}

pub(crate) fn format_optional(at: Option<OffsetDateTime>) -> Option<String> {
    at.map(format_timestamp)
}
