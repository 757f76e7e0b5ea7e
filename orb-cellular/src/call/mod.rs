//! Per-call state machine. Only one call is tracked at a time.

pub mod dtmf;
pub mod record;

use crate::{
    at::{
        AtChannel, Cmd,
        response::{CallMode, CallState, ClccEntry},
    },
    bus::{AudioRequest, Bus, DbQuery, Notification, Outbound, RequestId},
    connection::PhoneMode,
    phone_number::PhoneNumber,
};
use color_eyre::{
    Result,
    eyre::{bail, eyre},
};
use derive_more::Display;
use dtmf::DtmfCode;
use record::{CallRecord, CallType};
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const ANSWER_TIMEOUT: Duration = Duration::from_secs(5);
const HANGUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallStatus {
    #[default]
    Idle,
    Dialing,
    Incoming,
    Active,
    Held,
}

#[derive(Debug, Default)]
pub struct CallController {
    status: CallStatus,
    record: Option<CallRecord>,
    /// In-flight request persisting `record`.
    pending: Option<RequestId>,
    /// Finished calls whose records were not persisted yet when they ended.
    orphans: HashMap<RequestId, CallRecord>,
    ringing: bool,
    active_since: Option<Instant>,
    phone_mode: PhoneMode,
    tethering: bool,
    calls_from_favourites: bool,
    favourites: HashSet<PhoneNumber>,
}

impl CallController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn record(&self) -> Option<&CallRecord> {
        self.record.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.status != CallStatus::Idle
    }

    pub fn set_phone_mode(&mut self, mode: PhoneMode) {
        self.phone_mode = mode;
    }

    pub fn set_tethering(&mut self, enabled: bool) {
        self.tethering = enabled;
    }

    pub fn set_favourites(&mut self, enabled: bool, numbers: impl IntoIterator<Item = PhoneNumber>) {
        self.calls_from_favourites = enabled;
        self.favourites = numbers.into_iter().collect();
    }

    fn persist(&mut self, bus: &dyn Bus) {
        if let Some(record) = &self.record {
            self.pending = Some(bus.query(DbQuery::AddCallRecord(record.clone())));
        }
    }

    /// Dials `number` and starts tracking the outgoing call.
    pub async fn start_outgoing(
        &mut self,
        channel: &mut dyn AtChannel,
        bus: &dyn Bus,
        number: PhoneNumber,
    ) -> Result<()> {
        if self.is_active() {
            bail!("cannot dial {number}: a call is already {}", self.status);
        }
        if number.is_empty() {
            bail!("cannot dial an empty number");
        }

        let cmd = Cmd::new(format!("ATD{};", number.normalized())).with_timeout(DIAL_TIMEOUT);
        let result = channel.cmd(&cmd).await;
        if !result.is_ok() {
            return Err(eyre!("failed to dial {number}: {}", result.code));
        }

        info!("outgoing call to {number}");
        self.status = CallStatus::Dialing;
        self.record = Some(CallRecord::outgoing(number.clone()));
        self.persist(bus);
        bus.send(Outbound::Audio(AudioRequest::StartRingback));
        bus.notify(Notification::CallStarted(number));
        bus.send(Outbound::HoldCpuFrequency);

        Ok(())
    }

    fn start_ringing(&mut self, bus: &dyn Bus, number: Option<PhoneNumber>) {
        if self.ringing {
            return;
        }

        self.ringing = true;
        self.status = CallStatus::Incoming;
        let record = self
            .record
            .get_or_insert_with(|| CallRecord::incoming(PhoneNumber::default()));
        if let Some(number) = number {
            record.set_number(number);
        }
        let number = record.number.clone();

        self.persist(bus);
        bus.send(Outbound::Audio(AudioRequest::StartRinging));
        bus.notify(Notification::Ringing(number));
        bus.send(Outbound::HoldCpuFrequency);
    }

    /// `RING` from the modem. Only the first one of a call has an effect.
    pub fn handle_ring(&mut self, bus: &dyn Bus) {
        if self.phone_mode != PhoneMode::Connected || self.tethering {
            debug!("ignoring RING in {} mode", self.phone_mode);
            return;
        }
        if !matches!(self.status, CallStatus::Idle | CallStatus::Incoming) {
            return;
        }

        self.start_ringing(bus, None);
    }

    /// Caller id, which may arrive before or after `RING`.
    pub async fn handle_clip(
        &mut self,
        channel: &mut dyn AtChannel,
        bus: &dyn Bus,
        number: PhoneNumber,
    ) {
        match self.status {
            CallStatus::Idle | CallStatus::Incoming => {}
            _ => {
                if let Some(record) = self.record.as_mut().filter(|r| r.number.is_empty()) {
                    record.set_number(number);
                }
                return;
            }
        }

        let favourite = self.calls_from_favourites && self.favourites.contains(&number);
        let allowed = !self.tethering
            && match self.phone_mode {
                PhoneMode::Connected => true,
                PhoneMode::DoNotDisturb => favourite,
                PhoneMode::Offline => false,
            };

        if !allowed {
            self.reject(channel, bus, number).await;
            return;
        }

        if self.ringing {
            if let Some(record) = self.record.as_mut() {
                if record.number != number {
                    record.set_number(number.clone());
                    if record.is_valid() {
                        bus.query(DbQuery::UpdateCallRecord(record.clone()));
                    }
                }
            }
            return;
        }

        self.start_ringing(bus, Some(number));
    }

    async fn reject(&mut self, channel: &mut dyn AtChannel, bus: &dyn Bus, number: PhoneNumber) {
        info!(
            "rejecting call from {number} (mode: {}, tethering: {})",
            self.phone_mode, self.tethering
        );
        hang_up(channel).await;

        let mut record = CallRecord::incoming(number.clone());
        record.call_type = CallType::Missed;
        record.is_read = false;
        bus.query(DbQuery::AddCallRecord(record));
        bus.notify(Notification::CallMissed(number));

        self.clear();
    }

    pub fn set_active(&mut self, bus: &dyn Bus) {
        self.status = CallStatus::Active;
        self.active_since = Some(Instant::now());
        if std::mem::take(&mut self.ringing) {
            bus.send(Outbound::Audio(AudioRequest::StopRinging));
        }
        bus.send(Outbound::Audio(AudioRequest::StartRouting));
        bus.notify(Notification::CallActive);
    }

    /// Answers the ringing call.
    pub async fn answer(&mut self, channel: &mut dyn AtChannel, bus: &dyn Bus) -> Result<()> {
        if self.status != CallStatus::Incoming {
            bail!("no incoming call to answer, call is {}", self.status);
        }

        let result = channel
            .cmd(&Cmd::new("ATA").with_timeout(ANSWER_TIMEOUT))
            .await;
        if !result.is_ok() {
            bail!("failed to answer call: {}", result.code);
        }

        self.set_active(bus);

        Ok(())
    }

    /// Reconciles the tracked call with a polled call list.
    pub async fn on_clcc(
        &mut self,
        channel: &mut dyn AtChannel,
        bus: &dyn Bus,
        entries: &[ClccEntry],
    ) {
        let entry = entries.iter().find(|e| e.mode == CallMode::Voice);
        match (self.status, entry.map(|e| e.state)) {
            (CallStatus::Idle, _) => {}
            (_, None) => self.end_call(channel, bus, false).await,
            (CallStatus::Dialing, Some(CallState::Active)) => self.set_active(bus),
            (CallStatus::Active, Some(CallState::Held)) => {
                self.status = CallStatus::Held;
                bus.notify(Notification::CallHeld);
            }
            (CallStatus::Held, Some(CallState::Active)) => {
                self.status = CallStatus::Active;
                bus.notify(Notification::CallActive);
            }
            _ => {}
        }
    }

    /// Ends the current call. `forced` means the user hung up or rejected it.
    /// Internal state is always cleared, even when hanging up fails.
    pub async fn end_call(&mut self, channel: &mut dyn AtChannel, bus: &dyn Bus, forced: bool) {
        if self.status == CallStatus::Idle {
            return;
        }

        if forced {
            hang_up(channel).await;
        }

        let duration = self
            .active_since
            .map(|since| since.elapsed())
            .unwrap_or_default();

        if let Some(mut record) = self.record.take() {
            record.duration = duration;
            if record.call_type == CallType::Incoming && self.active_since.is_none() {
                record.call_type = if forced {
                    CallType::Rejected
                } else {
                    CallType::Missed
                };
                record.is_read = forced;
            }
            info!(
                "call with {} ended: {}, {}s",
                record.number,
                record.call_type,
                duration.as_secs()
            );

            match (record.is_valid(), self.pending.take()) {
                (true, _) => {
                    bus.query(DbQuery::UpdateCallRecord(record));
                }
                (false, Some(request)) => {
                    self.orphans.insert(request, record);
                }
                (false, None) => warn!("dropping call record that was never persisted"),
            }
        }

        bus.send(Outbound::Audio(AudioRequest::Stop));
        bus.notify(Notification::CallEnded);
        bus.send(Outbound::ReleaseCpuFrequency);

        self.clear();
    }

    fn clear(&mut self) {
        self.status = CallStatus::Idle;
        self.record = None;
        self.pending = None;
        self.ringing = false;
        self.active_since = None;
    }

    /// Database response to a call record insert.
    pub fn on_record_persisted(&mut self, bus: &dyn Bus, request: RequestId, id: u32) {
        if self.pending == Some(request) {
            self.pending = None;
            if let Some(record) = self.record.as_mut() {
                record.id = Some(id);
            }
            return;
        }

        if let Some(mut record) = self.orphans.remove(&request) {
            record.id = Some(id);
            bus.query(DbQuery::UpdateCallRecord(record));
            return;
        }

        debug!("ignoring stale call record response {request}");
    }

    pub async fn send_dtmf(&mut self, channel: &mut dyn AtChannel, code: DtmfCode) -> Result<()> {
        if self.status != CallStatus::Active {
            bail!("cannot send DTMF, call is {}", self.status);
        }

        let result = channel.cmd(&Cmd::new(format!("AT+VTS={code}"))).await;
        if !result.is_ok() {
            bail!("failed to send DTMF {code}: {}", result.code);
        }

        Ok(())
    }
}

async fn hang_up(channel: &mut dyn AtChannel) {
    let result = channel
        .cmd(&Cmd::new("ATH").with_timeout(HANGUP_TIMEOUT))
        .await;
    if !result.is_ok() {
        warn!("failed to hang up: {}", result.code);
    }
}
