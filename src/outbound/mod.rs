//! Outbound path: the priority queue, the publisher service and its
//! reconnect policy

pub mod queue;
pub mod reconnect;
pub mod service;

pub use queue::{
    DroppedEntry, InFlightEntry, InFlightPolicy, Message, MessageId, NextMessage, OutboundMessage,
    OutboundQueue, Publication, QueueSnapshot, SessionOutcome, CAPACITY_EXEMPT_BELOW,
    DEFAULT_PRIORITY, LIFECYCLE_PRIORITY, REPLY_PRIORITY,
};
pub use reconnect::ReconnectPolicy;
pub use service::{DataService, DataServiceListener};
