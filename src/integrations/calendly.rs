//! Calendly embed bridge.
//!
//! The inline widget posts messages to the page; the page forwards them here
//! together with the message origin. Only Calendly's own origins count, and a
//! session converts at most once.

use anyhow::Result;
use serde::Deserialize;
use tracing::{info, instrument};

use crate::db::{self, Pool};

pub const ALLOWED_ORIGINS: [&str; 2] = ["https://calendly.com", "https://www.calendly.com"];

pub fn is_calendly_origin(origin: &str) -> bool {
    let origin = origin.trim().trim_end_matches('/');
    ALLOWED_ORIGINS.iter().any(|allowed| origin.eq_ignore_ascii_case(allowed))
}

/// Message forwarded from the widget.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendlyMessage {
    pub origin: String,
    pub session_id: String,
    pub event: String,
    #[serde(default)]
    pub payload: Option<EventPayload>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventPayload {
    #[serde(default)]
    pub event: Option<UriRef>,
    #[serde(default)]
    pub invitee: Option<UriRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UriRef {
    pub uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Origin is not Calendly; the message was dropped.
    Rejected,
    /// Not a scheduling event.
    Ignored,
    /// Scheduling event for a session that already converted.
    Duplicate,
    Recorded,
}

impl BridgeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeOutcome::Rejected => "rejected",
            BridgeOutcome::Ignored => "ignored",
            BridgeOutcome::Duplicate => "duplicate",
            BridgeOutcome::Recorded => "recorded",
        }
    }
}

impl CalendlyMessage {
    /// Widget events are namespaced `calendly.<name>`.
    pub fn event_name(&self) -> &str {
        self.event.strip_prefix("calendly.").unwrap_or(&self.event)
    }
}

#[instrument(skip_all)]
pub async fn handle_message(pool: &Pool, msg: &CalendlyMessage) -> Result<BridgeOutcome> {
    if !is_calendly_origin(&msg.origin) {
        return Ok(BridgeOutcome::Rejected);
    }
    if msg.event_name() != "event_scheduled" || msg.session_id.trim().is_empty() {
        return Ok(BridgeOutcome::Ignored);
    }
    let payload = msg.payload.clone().unwrap_or_default();
    let recorded = db::record_conversion(
        pool,
        msg.session_id.trim(),
        payload.event.as_ref().map(|e| e.uri.as_str()),
        payload.invitee.as_ref().map(|i| i.uri.as_str()),
    )
    .await?;
    if recorded {
        info!("calendly conversion recorded");
        Ok(BridgeOutcome::Recorded)
    } else {
        Ok(BridgeOutcome::Duplicate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(origin: &str, event: &str) -> CalendlyMessage {
        CalendlyMessage {
            origin: origin.into(),
            session_id: "sess-1".into(),
            event: event.into(),
            payload: None,
        }
    }

    #[test]
    fn only_calendly_origins() {
        assert!(is_calendly_origin("https://calendly.com"));
        assert!(is_calendly_origin("https://www.calendly.com/"));
        assert!(!is_calendly_origin("https://calendly.com.evil.test"));
        assert!(!is_calendly_origin("http://calendly.com"));
    }

    #[tokio::test]
    async fn conversion_fires_once() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let evil = message("https://evil.test", "calendly.event_scheduled");
        assert_eq!(handle_message(&pool, &evil).await.unwrap(), BridgeOutcome::Rejected);

        let viewed = message("https://calendly.com", "calendly.date_and_time_selected");
        assert_eq!(handle_message(&pool, &viewed).await.unwrap(), BridgeOutcome::Ignored);

        let scheduled = message("https://calendly.com", "calendly.event_scheduled");
        assert_eq!(handle_message(&pool, &scheduled).await.unwrap(), BridgeOutcome::Recorded);
        assert_eq!(handle_message(&pool, &scheduled).await.unwrap(), BridgeOutcome::Duplicate);
    }
}
