use crate::{at::response::CallDir, phone_number::PhoneNumber};
use chrono::{DateTime, Utc};
use derive_more::Display;
use std::time::Duration;

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    Incoming,
    Outgoing,
    Missed,
    Rejected,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presentation {
    Allowed,
    Unknown,
}

/// Call log entry. `id` is set once the database has stored it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub id: Option<u32>,
    pub direction: CallDir,
    pub call_type: CallType,
    pub number: PhoneNumber,
    pub name: Option<String>,
    pub date: DateTime<Utc>,
    pub duration: Duration,
    pub is_read: bool,
    pub presentation: Presentation,
}

impl CallRecord {
    fn new(direction: CallDir, call_type: CallType, number: PhoneNumber) -> Self {
        let presentation = if number.is_empty() {
            Presentation::Unknown
        } else {
            Presentation::Allowed
        };

        Self {
            id: None,
            direction,
            call_type,
            number,
            name: None,
            date: Utc::now(),
            duration: Duration::ZERO,
            is_read: true,
            presentation,
        }
    }

    pub fn outgoing(number: PhoneNumber) -> Self {
        Self::new(CallDir::Mo, CallType::Outgoing, number)
    }

    pub fn incoming(number: PhoneNumber) -> Self {
        Self::new(CallDir::Mt, CallType::Incoming, number)
    }

    pub fn set_number(&mut self, number: PhoneNumber) {
        self.presentation = if number.is_empty() {
            Presentation::Unknown
        } else {
            Presentation::Allowed
        };
        self.number = number;
    }

    pub fn is_valid(&self) -> bool {
        self.id.is_some()
    }
}
