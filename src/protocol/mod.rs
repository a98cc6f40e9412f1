//! Wire-level conventions: the topic namespace and the message envelope

pub mod payload;
pub mod topics;

pub use payload::CloudPayload;
pub use topics::*;
