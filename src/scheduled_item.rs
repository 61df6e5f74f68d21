// Scheduled items: the unit of deferred work handed to the dispatch loop

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::executor::TransportError;

// HTTP verb of a deferred call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One deferred call waiting for its eligible time.
///
/// `id` is caller-assigned and repeats across retries of the same logical item.
/// `max_attempts` left as `None` is filled in from the scheduler's retry config on submission.
#[derive(Debug, Clone)]
pub struct ScheduledItem {
    pub id: String,
    pub method: Method,
    pub target: String,
    pub payload: Option<serde_json::Value>,
    pub eligible_at: Instant,
    pub attempt_count: u32,
    pub max_attempts: Option<u32>,
    pub owner_id: Option<String>,
}

impl ScheduledItem {
    // Eligible immediately, no payload, no owner
    pub fn new(id: impl Into<String>, method: Method, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method,
            target: target.into(),
            payload: None,
            eligible_at: Instant::now(),
            attempt_count: 0,
            max_attempts: None,
            owner_id: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn eligible_at(mut self, at: Instant) -> Self {
        self.eligible_at = at;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_attempt_count(mut self, attempt_count: u32) -> Self {
        self.attempt_count = attempt_count;
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }
}

/// Lifecycle of a scheduled item.
///
/// `Created -> Enqueued -> Due -> Executing -> {Succeeded | RetryScheduled -> Enqueued | Exhausted}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Created,
    Enqueued,
    Due,
    Executing,
    RetryScheduled,
    Succeeded,
    Exhausted,
}

impl ItemState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Succeeded | ItemState::Exhausted)
    }
}

// Reported once per logical item on its terminal transition
#[derive(Debug)]
pub struct Outcome {
    pub id: String,
    pub state: ItemState,
    pub attempts: u32,
    pub last_error: Option<TransportError>,
}
