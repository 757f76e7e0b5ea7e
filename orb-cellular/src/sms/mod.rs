//! SMS pipeline: reading and reassembling incoming messages, scheduling and
//! submitting outgoing ones.

pub mod outgoing;
pub mod parser;
pub mod queue;
pub mod ucs2;

use crate::phone_number::PhoneNumber;
use chrono::{DateTime, FixedOffset};
use derive_more::Display;

pub use parser::SmsParser;
pub use queue::{SendEffects, SendQueue};

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsState {
    Queued,
    Outbox,
    Failed,
    Inbox,
}

/// Outgoing message as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsRecord {
    pub id: u32,
    pub number: PhoneNumber,
    pub body: String,
    pub state: SmsState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingSms {
    pub number: PhoneNumber,
    pub body: String,
    pub date: DateTime<FixedOffset>,
}
