//! # Session Registry
//!
//! The one shared structure between the ingest, bridge, subscriber and HTTP
//! sides of a call. Maps a call identifier to its live session: the fan-out
//! list of subscriber sinks and the handle used to inject audio back into the
//! telephony stream.
//!
//! ## Thread Safety:
//! The map sits behind `Arc<RwLock>` and every lock is scoped to a single
//! lookup or mutation. Sends into subscriber queues happen outside the lock,
//! so a slow or dead subscriber can never stall another connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Event delivered to one subscriber's queue.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberEvent {
    /// A speech result payload, forwarded verbatim.
    Result(String),
    /// The session ended; no further results will arrive.
    SessionClosed,
}

/// A serialized media message ready to be written to the telephony stream.
#[derive(Debug, Clone)]
pub struct OutboundFrame(pub String);

/// Write access to one call's telephony connection.
#[derive(Debug, Clone)]
pub struct OutboundHandle {
    /// Stream identifier the telephony provider expects on injected media.
    pub stream_sid: String,
    pub sender: mpsc::UnboundedSender<OutboundFrame>,
}

#[derive(Debug, PartialEq)]
pub enum RegistryError {
    SessionNotFound(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::SessionNotFound(call_sid) => {
                write!(f, "No active session for call '{}'", call_sid)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug)]
struct Subscriber {
    id: Uuid,
    sink: mpsc::UnboundedSender<SubscriberEvent>,
}

#[derive(Debug)]
struct SessionEntry {
    subscribers: Vec<Subscriber>,
    outbound: OutboundHandle,
}

/// Registry of live call sessions, cheap to clone and share.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a session for `call_sid`.
    ///
    /// Returns false (and changes nothing) when the call is already
    /// registered, so a duplicate start event cannot drop an existing
    /// subscriber list or outbound handle.
    pub fn begin_session(&self, call_sid: &str, outbound: OutboundHandle) -> bool {
        let mut sessions = self.sessions.write().unwrap();
        if sessions.contains_key(call_sid) {
            warn!(call_sid = %call_sid, "Session already registered, keeping existing entry");
            return false;
        }

        sessions.insert(
            call_sid.to_string(),
            SessionEntry {
                subscribers: Vec::new(),
                outbound,
            },
        );
        info!(call_sid = %call_sid, total_sessions = sessions.len(), "Session registered");
        true
    }

    /// Attach a subscriber sink to a live session.
    pub fn subscribe(
        &self,
        call_sid: &str,
        sink: mpsc::UnboundedSender<SubscriberEvent>,
    ) -> Result<Uuid, RegistryError> {
        let mut sessions = self.sessions.write().unwrap();
        let entry = sessions
            .get_mut(call_sid)
            .ok_or_else(|| RegistryError::SessionNotFound(call_sid.to_string()))?;

        let id = Uuid::new_v4();
        entry.subscribers.push(Subscriber { id, sink });
        info!(
            call_sid = %call_sid,
            subscriber_id = %id,
            subscribers = entry.subscribers.len(),
            "Subscriber attached"
        );
        Ok(id)
    }

    /// Detach one subscriber. A no-op when the session or the subscriber is
    /// already gone.
    pub fn unsubscribe(&self, call_sid: &str, subscriber_id: Uuid) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(entry) = sessions.get_mut(call_sid) {
            let before = entry.subscribers.len();
            entry.subscribers.retain(|s| s.id != subscriber_id);
            if entry.subscribers.len() < before {
                debug!(call_sid = %call_sid, subscriber_id = %subscriber_id, "Subscriber detached");
            }
        }
    }

    /// Deliver one result payload to every current subscriber of a session.
    ///
    /// Subscribers whose queues are closed are pruned afterwards. Returns the
    /// number of successful deliveries; zero when the session is unknown.
    pub fn broadcast(&self, call_sid: &str, payload: &str) -> usize {
        let snapshot: Vec<(Uuid, mpsc::UnboundedSender<SubscriberEvent>)> = {
            let sessions = self.sessions.read().unwrap();
            match sessions.get(call_sid) {
                Some(entry) => entry
                    .subscribers
                    .iter()
                    .map(|s| (s.id, s.sink.clone()))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, sink) in snapshot {
            if sink
                .send(SubscriberEvent::Result(payload.to_string()))
                .is_ok()
            {
                delivered += 1;
            } else {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            warn!(call_sid = %call_sid, pruned = dead.len(), "Pruned subscribers with closed queues");
            let mut sessions = self.sessions.write().unwrap();
            if let Some(entry) = sessions.get_mut(call_sid) {
                entry.subscribers.retain(|s| !dead.contains(&s.id));
            }
        }

        delivered
    }

    /// Remove a session and tell its subscribers it is over.
    ///
    /// The entry is taken out of the map before any sentinel is sent, so a
    /// concurrent `end_session` for the same call delivers the sentinels
    /// exactly once. Returns false when the session was already gone.
    pub fn end_session(&self, call_sid: &str) -> bool {
        let entry = { self.sessions.write().unwrap().remove(call_sid) };
        match entry {
            Some(entry) => {
                for subscriber in &entry.subscribers {
                    let _ = subscriber.sink.send(SubscriberEvent::SessionClosed);
                }
                info!(
                    call_sid = %call_sid,
                    notified = entry.subscribers.len(),
                    "Session ended"
                );
                true
            }
            None => false,
        }
    }

    /// The outbound handle for a live call, if any.
    pub fn outbound_handle(&self, call_sid: &str) -> Option<OutboundHandle> {
        let sessions = self.sessions.read().unwrap();
        sessions.get(call_sid).map(|entry| entry.outbound.clone())
    }

    /// Identifiers of every live call.
    pub fn active_calls(&self) -> Vec<String> {
        let sessions = self.sessions.read().unwrap();
        sessions.keys().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Total subscribers across all sessions.
    pub fn subscriber_count(&self) -> usize {
        let sessions = self.sessions.read().unwrap();
        sessions.values().map(|entry| entry.subscribers.len()).sum()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
