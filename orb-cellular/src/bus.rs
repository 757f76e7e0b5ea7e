//! Outbound traffic of the cellular service: notifications for other services,
//! database requests and platform requests.

use crate::{
    at::{response::Contact, urc::UssdStatus},
    call::record::CallRecord,
    connection::{ConnectionState, PhoneMode},
    phone_number::PhoneNumber,
    sim::{SimEvent, store::SignalQuality},
    sms::{IncomingSms, SmsRecord},
    volte::SupportStatus,
};
use derive_more::Display;
use tracing::warn;
use uuid::Uuid;

/// Correlation id pairing a database request with its response.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbQuery {
    AddCallRecord(CallRecord),
    UpdateCallRecord(CallRecord),
    /// Next SMS waiting in the outbox, answered with `Event::DbSmsRecord` or
    /// `Event::DbNoMoreSms`.
    NextQueuedSms,
    UpdateSms(SmsRecord),
    AddIncomingSms(IncomingSms),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioRequest {
    StartRinging,
    StartRingback,
    StopRinging,
    StartRouting,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Ringing(PhoneNumber),
    CallStarted(PhoneNumber),
    CallActive,
    CallHeld,
    CallMissed(PhoneNumber),
    CallEnded,
    Sim(SimEvent),
    SignalQuality(SignalQuality),
    Connection {
        mode: PhoneMode,
        state: ConnectionState,
    },
    NetworkIndicatorCleared,
    FlightMode(bool),
    Ussd {
        status: Option<UssdStatus>,
        message: String,
    },
    SmsReceived(PhoneNumber),
    SmsSent { id: u32, ok: bool },
    Tethering(bool),
    Volte { enabled: bool, reboot_required: bool },
    VolteSupport(SupportStatus),
    Phonebook(Vec<Contact>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Notification(Notification),
    Db { request: RequestId, query: DbQuery },
    HoldCpuFrequency,
    ReleaseCpuFrequency,
    Passthrough(bool),
    Audio(AudioRequest),
}

pub trait Bus: Send + Sync {
    fn send(&self, msg: Outbound);

    fn notify(&self, notification: Notification) {
        self.send(Outbound::Notification(notification));
    }

    /// Sends a database query and returns the id its response will carry.
    fn query(&self, query: DbQuery) -> RequestId {
        let request = RequestId::new();
        self.send(Outbound::Db { request, query });
        request
    }
}

/// [`Bus`] forwarding every message into a `flume` channel.
#[derive(Debug, Clone)]
pub struct ChannelBus {
    tx: flume::Sender<Outbound>,
}

impl ChannelBus {
    pub fn new() -> (Self, flume::Receiver<Outbound>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }
}

impl Bus for ChannelBus {
    fn send(&self, msg: Outbound) {
        if let Err(e) = self.tx.send(msg) {
            warn!("failed to send outbound message: {e}");
        }
    }
}
