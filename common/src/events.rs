// Job lifecycle events published by the backend

use crate::backend::MessageStream;
use crate::errors::WorkerError;
use futures::StreamExt;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Put,
    Popped,
    Stalled,
    Completed,
    Failed,
    Canceled,
    Track,
    Untrack,
    /// Lease handed to another worker
    LockLost,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::Put,
        EventKind::Popped,
        EventKind::Stalled,
        EventKind::Completed,
        EventKind::Failed,
        EventKind::Canceled,
        EventKind::Track,
        EventKind::Untrack,
        EventKind::LockLost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Put => "put",
            EventKind::Popped => "popped",
            EventKind::Stalled => "stalled",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Canceled => "canceled",
            EventKind::Track => "track",
            EventKind::Untrack => "untrack",
            EventKind::LockLost => "lock_lost",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| WorkerError::Configuration(format!("Unknown event kind: {}", s)))
    }
}

// Envelope fields are strings in practice; tolerate scalars of other types
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default, deserialize_with = "lenient_string")]
    jid: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    worker: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    queue: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    to: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    group: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    message: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    option: Option<String>,
}

/// A decoded lifecycle notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub jid: Option<String>,
    pub worker: Option<String>,
    pub queue: Option<String>,
    /// Destination queue for moves
    pub to: Option<String>,
    pub group: Option<String>,
    pub message: Option<String>,
    pub option: Option<String>,
}

impl Event {
    /// Decode a raw envelope.
    ///
    /// Empty, non-JSON, kind-less or unknown-kind payloads are not events and
    /// yield `None`.
    pub fn from_data(raw: Option<&str>) -> Option<Event> {
        let raw = raw?.trim();
        if raw.is_empty() {
            return None;
        }

        let envelope: Envelope = serde_json::from_str(raw).ok()?;
        let kind = envelope.event.parse::<EventKind>().ok()?;

        Some(Event {
            kind,
            jid: envelope.jid,
            worker: envelope.worker,
            queue: envelope.queue,
            to: envelope.to,
            group: envelope.group,
            message: envelope.message,
            option: envelope.option,
        })
    }

    pub fn is_for_job(&self, jid: &str) -> bool {
        self.jid.as_deref() == Some(jid)
    }

    pub fn is_for_worker(&self, worker: &str) -> bool {
        self.worker.as_deref() == Some(worker)
    }
}

pub type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;

/// Fans decoded events out to callbacks registered per kind
#[derive(Default)]
pub struct EventSubscriber {
    callbacks: HashMap<EventKind, Vec<EventCallback>>,
}

impl EventSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for events of `kind`; unknown kinds are a usage error
    pub fn on<F>(&mut self, kind: &str, callback: F) -> Result<&mut Self, WorkerError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let kind = kind.parse::<EventKind>()?;
        self.callbacks
            .entry(kind)
            .or_default()
            .push(Box::new(callback));
        Ok(self)
    }

    /// Invoke the callbacks for `event`, returning how many ran
    pub fn dispatch(&self, event: &Event) -> usize {
        match self.callbacks.get(&event.kind) {
            Some(callbacks) => {
                for callback in callbacks {
                    callback(event);
                }
                callbacks.len()
            }
            None => 0,
        }
    }

    /// Dispatch every decodable payload until the stream ends
    pub async fn listen(&self, mut messages: MessageStream) -> usize {
        let mut dispatched = 0;
        while let Some(payload) = messages.next().await {
            match Event::from_data(Some(&payload)) {
                Some(event) => dispatched += self.dispatch(&event),
                None => debug!(payload = %payload, "Ignoring undecodable event payload"),
            }
        }
        dispatched
    }
}

impl fmt::Debug for EventSubscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<&str> = self.callbacks.keys().map(|k| k.as_str()).collect();
        f.debug_struct("EventSubscriber").field("kinds", &kinds).finish()
    }
}
