//! Events published to observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::progress::ProgressSnapshot;
use super::session::SessionState;
use crate::errors::ErrorKind;

/// Typed event payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum EventPayload {
    /// A lifecycle transition was applied.
    StateChanged {
        /// State before the transition.
        from: SessionState,
        /// State after the transition.
        to: SessionState,
    },
    /// A new progress snapshot was accepted.
    Progress(ProgressSnapshot),
    /// A failure or rejected condition worth surfacing.
    Error {
        /// Stable error kind.
        kind: ErrorKind,
        /// Human-readable detail.
        detail: String,
    },
    /// The engine recovered a digest.
    Recovered {
        /// Target digest as written to the potfile.
        hash: String,
        /// Recovered plaintext.
        plain: String,
    },
}

/// Envelope delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Session the event belongs to.
    pub session_id: String,
    /// Publication timestamp.
    pub at: DateTime<Utc>,
    /// Event body.
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    /// Stamp a payload for `session_id`.
    #[must_use]
    pub fn new(session_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            session_id: session_id.into(),
            at: Utc::now(),
            payload,
        }
    }
}
