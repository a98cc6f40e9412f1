//! Priority-ordered, capacity-bounded buffer of pending publishes
//!
//! Messages live in one of three places:
//!
//! - **unpublished**: waiting for the publisher, ordered by (priority, id);
//! - **in-flight**: handed to the transport with QoS > 0, waiting for the
//!   broker's confirmation under a [`TransportToken`];
//! - **dropped**: in-flight messages abandoned after a new session under
//!   [`InFlightPolicy::Drop`], kept for diagnostics until purged.
//!
//! All state sits behind one mutex, so every listing and snapshot is a
//! consistent point-in-time view.

use crate::error::{CloudError, CloudResult};
use crate::transport::{Qos, TransportToken};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stable id assigned at enqueue time; survives reconnects
pub type MessageId = u64;

/// Lifecycle certificates (birth, disconnect, apps)
pub const LIFECYCLE_PRIORITY: u8 = 0;
/// Cloudlet replies
pub const REPLY_PRIORITY: u8 = 1;
/// Messages below this priority are never rejected for capacity
pub const CAPACITY_EXEMPT_BELOW: u8 = 2;
/// Suggested priority for application data
pub const DEFAULT_PRIORITY: u8 = 5;

/// What happens to in-flight messages when the broker starts a new session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InFlightPolicy {
    /// Put them back in the queue at their original position
    Republish,
    /// Move them to the dropped list
    Drop,
}

/// A message to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retain: bool,
    pub priority: u8,
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: Qos,
        retain: bool,
        priority: u8,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            priority,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    fn counts_against_capacity(&self) -> bool {
        self.priority >= CAPACITY_EXEMPT_BELOW
    }
}

/// A queued message with its assigned id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub id: MessageId,
    pub message: Message,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn topic(&self) -> &str {
        &self.message.topic
    }

    fn position(&self) -> (u8, MessageId) {
        (self.message.priority, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightEntry {
    pub token: TransportToken,
    pub message: OutboundMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedEntry {
    pub message: OutboundMessage,
    pub dropped_at: DateTime<Utc>,
}

/// Result of asking the queue for work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextMessage {
    Ready(OutboundMessage),
    /// The head needs an ack and the in-flight window is full
    Congested,
    Empty,
}

/// Outcome of [`OutboundQueue::mark_published`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publication {
    /// QoS 0: nothing left to track
    Sent,
    /// Waiting for the broker's confirmation
    InFlight,
    /// The confirmation had already arrived
    Confirmed,
    /// Accepted by a session that has since been replaced; stays queued
    Requeued,
}

/// Counts returned by [`OutboundQueue::begin_session`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOutcome {
    pub republished: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub unpublished: Vec<OutboundMessage>,
    pub in_flight: Vec<InFlightEntry>,
    pub dropped: Vec<DroppedEntry>,
}

#[derive(Default)]
struct QueueState {
    next_id: MessageId,
    session_id: String,
    unpublished: BTreeMap<(u8, MessageId), OutboundMessage>,
    in_flight: BTreeMap<MessageId, InFlightEntry>,
    by_token: HashMap<TransportToken, MessageId>,
    /// Message handed to the transport and not yet recorded
    publishing: Option<MessageId>,
    /// Confirmations that beat `mark_published` for the publish in progress
    early_acks: HashSet<TransportToken>,
    dropped: Vec<DroppedEntry>,
}

impl QueueState {
    fn held(&self) -> usize {
        let unpublished = self
            .unpublished
            .values()
            .filter(|m| m.message.counts_against_capacity())
            .count();
        let in_flight = self
            .in_flight
            .values()
            .filter(|e| e.message.message.counts_against_capacity())
            .count();
        unpublished + in_flight
    }

    fn take_in_flight(&mut self) -> Vec<InFlightEntry> {
        self.by_token.clear();
        std::mem::take(&mut self.in_flight).into_values().collect()
    }
}

pub struct OutboundQueue {
    capacity: usize,
    state: Mutex<QueueState>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState {
                next_id: 1,
                ..QueueState::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a message; priorities below 2 bypass the capacity check
    pub fn enqueue(&self, message: Message) -> CloudResult<MessageId> {
        let mut state = self.lock();

        if message.counts_against_capacity() && state.held() >= self.capacity {
            return Err(CloudError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        let id = state.next_id;
        state.next_id += 1;

        let entry = OutboundMessage {
            id,
            message,
            enqueued_at: Utc::now(),
        };
        debug!(
            message_id = id,
            topic = %entry.message.topic,
            priority = entry.message.priority,
            "Message queued"
        );
        state.unpublished.insert(entry.position(), entry);
        Ok(id)
    }

    /// Peek at the most urgent unpublished message
    ///
    /// The message stays queued until [`mark_published`](Self::mark_published).
    pub fn next_unpublished(&self, max_in_flight: usize) -> NextMessage {
        let state = self.lock();
        match state.unpublished.values().next() {
            None => NextMessage::Empty,
            Some(head) if head.message.qos.requires_ack() && state.in_flight.len() >= max_in_flight => {
                NextMessage::Congested
            }
            Some(head) => NextMessage::Ready(head.clone()),
        }
    }

    /// Note that message `id` is being handed to the transport
    ///
    /// Until [`mark_published`](Self::mark_published) or
    /// [`abandon_publish`](Self::abandon_publish), unknown confirmations of the
    /// current session are held back for it.
    pub fn begin_publish(&self, id: MessageId) {
        let mut state = self.lock();
        state.publishing = Some(id);
        state.early_acks.clear();
    }

    /// The transport did not accept message `id`; it stays queued
    pub fn abandon_publish(&self, id: MessageId) {
        let mut state = self.lock();
        if state.publishing == Some(id) {
            state.publishing = None;
            state.early_acks.clear();
        }
    }

    /// Record that the transport accepted message `id`
    pub fn mark_published(
        &self,
        id: MessageId,
        token: Option<TransportToken>,
    ) -> CloudResult<Publication> {
        let mut state = self.lock();
        let early_acks = if state.publishing.take() == Some(id) {
            std::mem::take(&mut state.early_acks)
        } else {
            state.early_acks.clear();
            HashSet::new()
        };

        let key = state
            .unpublished
            .iter()
            .find(|(_, m)| m.id == id)
            .map(|(key, _)| *key)
            .ok_or_else(|| CloudError::internal_error(format!("message {id} is not queued")))?;

        let Some(token) = token else {
            state.unpublished.remove(&key);
            return Ok(Publication::Sent);
        };

        if token.session_id != state.session_id {
            // Accepted by a session that has already been replaced
            warn!(
                message_id = id,
                session_id = %token.session_id,
                "Publish completed on a previous session, keeping message queued"
            );
            return Ok(Publication::Requeued);
        }

        let Some(message) = state.unpublished.remove(&key) else {
            return Err(CloudError::internal_error(format!("message {id} vanished")));
        };

        if early_acks.contains(&token) {
            debug!(message_id = id, "Confirmation arrived before publish was recorded");
            return Ok(Publication::Confirmed);
        }

        state.by_token.insert(token.clone(), id);
        state.in_flight.insert(id, InFlightEntry { token, message });
        Ok(Publication::InFlight)
    }

    /// Apply a broker confirmation
    ///
    /// Returns the confirmed message, or `None` when the token is unknown.
    /// An unknown token is remembered only while a publish is in progress,
    /// since it may belong to that publish; otherwise it is a late
    /// confirmation of a publish that timed out, and is discarded.
    pub fn confirm(&self, token: &TransportToken) -> CloudResult<Option<OutboundMessage>> {
        let mut state = self.lock();

        if token.session_id != state.session_id {
            return Err(CloudError::StaleConfirmation {
                message_id: token.message_id,
                session_id: token.session_id.clone(),
            });
        }

        match state.by_token.remove(token) {
            Some(id) => Ok(state.in_flight.remove(&id).map(|entry| entry.message)),
            None => {
                if state.publishing.is_some() {
                    state.early_acks.insert(token.clone());
                }
                Ok(None)
            }
        }
    }

    /// Reconcile in-flight messages with the session the transport just opened
    pub fn begin_session(
        &self,
        session_id: &str,
        new_session: bool,
        policy: InFlightPolicy,
    ) -> SessionOutcome {
        let mut state = self.lock();

        // Tokens of another session can never be confirmed
        let new_session = new_session || state.session_id != session_id;
        state.session_id = session_id.to_string();

        if !new_session {
            debug!(
                in_flight = state.in_flight.len(),
                "Session resumed, in-flight messages await confirmation"
            );
            return SessionOutcome::default();
        }

        state.early_acks.clear();
        let entries = state.take_in_flight();
        let mut outcome = SessionOutcome::default();

        match policy {
            InFlightPolicy::Republish => {
                for entry in entries {
                    state
                        .unpublished
                        .insert(entry.message.position(), entry.message);
                    outcome.republished += 1;
                }
            }
            InFlightPolicy::Drop => {
                let now = Utc::now();
                for entry in entries {
                    state.dropped.push(DroppedEntry {
                        message: entry.message,
                        dropped_at: now,
                    });
                    outcome.dropped += 1;
                }
            }
        }

        if outcome != SessionOutcome::default() {
            info!(
                session_id = session_id,
                policy = ?policy,
                republished = outcome.republished,
                dropped = outcome.dropped,
                "New session, in-flight messages reconciled"
            );
        }
        outcome
    }

    /// Purge dropped records older than `max_age`
    pub fn purge_dropped(&self, max_age: Duration) -> usize {
        let age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let cutoff = Utc::now().checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.purge_dropped_before(cutoff)
    }

    pub fn purge_dropped_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.lock();
        let before = state.dropped.len();
        state.dropped.retain(|d| d.dropped_at >= cutoff);
        before - state.dropped.len()
    }

    pub fn session_id(&self) -> String {
        self.lock().session_id.clone()
    }

    pub fn unpublished_len(&self) -> usize {
        self.lock().unpublished.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// True when nothing is waiting to be published or confirmed
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.unpublished.is_empty() && state.in_flight.is_empty()
    }

    /// Unpublished messages in publish order
    pub fn list_unpublished(&self) -> Vec<OutboundMessage> {
        self.lock().unpublished.values().cloned().collect()
    }

    pub fn list_in_flight(&self) -> Vec<InFlightEntry> {
        self.lock().in_flight.values().cloned().collect()
    }

    pub fn list_dropped(&self) -> Vec<DroppedEntry> {
        self.lock().dropped.clone()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.lock();
        QueueSnapshot {
            unpublished: state.unpublished.values().cloned().collect(),
            in_flight: state.in_flight.values().cloned().collect(),
            dropped: state.dropped.clone(),
        }
    }
}
