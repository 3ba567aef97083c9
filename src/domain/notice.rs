//! Owner notice formatting
//!
//! Violation timestamps are rendered in one reference time zone (daylight
//! saving included) rather than the local zone of the violation.

use crate::domain::types::{EnrichedViolation, NotificationMessage};
use chrono::DateTime;
use chrono_tz::Tz;
use tracing::warn;

const DATE_FORMAT: &str = "%-m/%-d/%Y, %-I:%M:%S %p";

pub const DEFAULT_TIME_ZONE: &str = "America/Los_Angeles";

#[derive(Debug, Clone)]
pub struct NoticeFormatter {
    zone: Tz,
}

impl Default for NoticeFormatter {
    fn default() -> Self {
        Self::new(Tz::America__Los_Angeles)
    }
}

impl NoticeFormatter {
    pub fn new(zone: Tz) -> Self {
        Self { zone }
    }

    /// Formatter for an IANA zone name such as `America/Los_Angeles`
    pub fn for_zone_name(name: &str) -> anyhow::Result<Self> {
        let zone: Tz = name.parse().map_err(|e| anyhow::anyhow!("unknown time zone {name:?}: {e}"))?;
        Ok(Self::new(zone))
    }

    /// Render an RFC 3339 timestamp in the reference zone; unparseable input is kept verbatim
    pub fn render_timestamp(&self, timestamp: &str) -> String {
        match DateTime::parse_from_rfc3339(timestamp) {
            Ok(dt) => dt.with_timezone(&self.zone).format(DATE_FORMAT).to_string(),
            Err(e) => {
                warn!(timestamp = %timestamp, error = %e, "notice_timestamp_unparsed");
                timestamp.to_string()
            }
        }
    }

    pub fn format(&self, violation: &EnrichedViolation, amount: u32) -> NotificationMessage {
        let body = format!(
            "Hello {name},\n\
             Your vehicle was involved in a traffic violation. Please pay the specified ticket amount by 30 days:\n\
             Vehicle: {color} {make} {model}\n\
             License plate: {plate}\n\
             Date: {date}\n\
             Violation address: {location}\n\
             Violation type: {violation_type}\n\
             Ticket amount: ${amount}",
            name = violation.owner.name,
            color = violation.color,
            make = violation.make,
            model = violation.model,
            plate = violation.plate,
            date = self.render_timestamp(&violation.timestamp),
            location = violation.location,
            violation_type = violation.violation_type,
        );
        NotificationMessage { recipient_contact: violation.owner.contact.clone(), body }
    }
}
