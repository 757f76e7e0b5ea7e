//! SIM authentication: PIN/PUK unlock flows, CME error classification and the
//! reaction to `+CPIN` state reports. Also tracks slot selection, tray and card
//! insertion.

pub mod store;

use crate::at::{
    AtChannel, AtResult, Cmd, Code, EquipmentErrorCode,
    response::{self, AttemptsCounters, SimInsertion, SimState},
};
use derive_more::Display;
use num_traits::FromPrimitive;
use std::{fmt, time::Duration};
use store::{GsmStore, Sim, Tray};
use thiserror::Error;
use tracing::{error, info, warn};

const SIM_CMD_TIMEOUT: Duration = Duration::from_secs(5);

/// Issued once the SIM reports ready: text mode SMS in UCS2 and caller id.
const SIM_INIT_COMMANDS: &[&str] = &["AT+CMGF=1", "AT+CSCS=\"UCS2\"", "AT+CLIP=1"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimCodeError {
    #[error("SIM code must have {expected} digits, got {got}")]
    Length { expected: &'static str, got: usize },
    #[error("SIM code may only contain digits")]
    NotNumeric,
}

/// A validated PIN or PUK. The digits never show up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct SimCode(String);

impl SimCode {
    pub fn pin(code: &str) -> Result<Self, SimCodeError> {
        Self::new(code, 4..=8, "4 to 8")
    }

    pub fn puk(code: &str) -> Result<Self, SimCodeError> {
        Self::new(code, 8..=8, "8")
    }

    fn new(
        code: &str,
        len: std::ops::RangeInclusive<usize>,
        expected: &'static str,
    ) -> Result<Self, SimCodeError> {
        if !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(SimCodeError::NotNumeric);
        }
        if !len.contains(&code.len()) {
            return Err(SimCodeError::Length {
                expected,
                got: code.len(),
            });
        }

        Ok(Self(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SimCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SimCode({})", "*".repeat(self.0.len()))
    }
}

/// QPINC facility: PIN1 (`"SC"`) or PIN2 (`"P2"`).
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facility {
    #[display("SC")]
    Pin1,
    #[display("P2")]
    Pin2,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockState {
    Locked,
    Unlocking,
    Unlocked,
    Blocked,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Ready,
    NeedPin { attempts: u32 },
    NeedPuk { attempts: u32 },
    Blocked,
    Failure,
    Unknown,
    PinLockChanged(bool),
    StateChanged(SimState),
    /// No card in the selected slot.
    NotPresent,
    SlotSelected(Sim),
    /// A CME error the controller has no handling for.
    UnhandledCme(u32),
}

/// Which counter must be non-zero before a code is sent to the SIM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockType {
    Pin,
    Puk,
}

/// Outcome of a SIM command after CME classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimResult {
    Ok,
    IncorrectPassword,
    /// Not sent: the counter guarding the command is exhausted.
    Locked(LockType),
    Cme(u32),
    Unknown,
}

impl SimResult {
    fn classify(result: &AtResult) -> Self {
        match result.code {
            Code::Ok => Self::Ok,
            Code::CmeError => match result.equipment_error() {
                Some(code) => match EquipmentErrorCode::from_u32(code) {
                    Some(EquipmentErrorCode::IncorrectPassword) => Self::IncorrectPassword,
                    _ => Self::Cme(code),
                },
                None => Self::Unknown,
            },
            _ => Self::Unknown,
        }
    }

    fn cme_code(self) -> u32 {
        let code = match self {
            Self::Cme(code) => return code,
            Self::Locked(LockType::Pin) => EquipmentErrorCode::SimPukRequired,
            Self::Locked(LockType::Puk) => EquipmentErrorCode::SimFailure,
            _ => EquipmentErrorCode::Unknown,
        };

        code as u32
    }
}

pub struct SimCard {
    store: GsmStore,
    events: flume::Sender<SimEvent>,
    state: UnlockState,
    /// Last known card insertion status. `None` until read or after a slot switch.
    inserted: Option<SimInsertion>,
    select_in_progress: bool,
}

impl SimCard {
    pub fn new(store: GsmStore, events: flume::Sender<SimEvent>) -> Self {
        Self {
            store,
            events,
            state: UnlockState::Locked,
            inserted: None,
            select_in_progress: false,
        }
    }

    pub fn state(&self) -> UnlockState {
        self.state
    }

    pub fn is_select_in_progress(&self) -> bool {
        self.select_in_progress
    }

    fn emit(&self, event: SimEvent) {
        if let Err(e) = self.events.send(event) {
            warn!("failed to publish sim event: {e}");
        }
    }

    async fn attempts_raw(
        channel: &mut dyn AtChannel,
        facility: Facility,
    ) -> (AtResult, response::ParseResult<AttemptsCounters>) {
        let cmd = Cmd::new(format!("AT+QPINC=\"{facility}\""));
        let result = channel.cmd(&cmd).await;
        let counters = response::parse_qpinc(&result);
        (result, counters)
    }

    /// Remaining PIN/PUK attempts for `facility`.
    pub async fn attempts_counters(
        &self,
        channel: &mut dyn AtChannel,
        facility: Facility,
    ) -> response::ParseResult<AttemptsCounters> {
        Self::attempts_raw(channel, facility).await.1
    }

    /// Sends `cmd` unless the `check` counter of PIN1 is exhausted.
    async fn send_guarded(
        channel: &mut dyn AtChannel,
        check: LockType,
        cmd: Cmd,
    ) -> SimResult {
        let (raw, counters) = Self::attempts_raw(channel, Facility::Pin1).await;
        let counters = match counters {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to read pin counters: {e}");
                return SimResult::classify(&raw);
            }
        };
        let left = match check {
            LockType::Pin => counters.pin,
            LockType::Puk => counters.puk,
        };
        if left == 0 {
            warn!("no {check:?} attempts left, not sending the code");
            return SimResult::Locked(check);
        }

        let result = channel.cmd(&cmd.with_timeout(SIM_CMD_TIMEOUT)).await;
        SimResult::classify(&result)
    }

    /// Unlocks the SIM with `pin`. Returns `true` on success.
    pub async fn handle_pin_unlock(
        &mut self,
        channel: &mut dyn AtChannel,
        pin: &SimCode,
    ) -> bool {
        self.state = UnlockState::Unlocking;
        let cmd = Cmd::new(format!("AT+CPIN=\"{}\"", pin.as_str()));
        let result = Self::send_guarded(channel, LockType::Pin, cmd).await;
        self.process(channel, result).await
    }

    /// Unblocks a PUK-locked SIM and sets `new_pin`.
    pub async fn handle_unblock_with_puk(
        &mut self,
        channel: &mut dyn AtChannel,
        puk: &SimCode,
        new_pin: &SimCode,
    ) -> bool {
        self.state = UnlockState::Unlocking;
        let cmd = Cmd::new(format!(
            "AT+CPIN=\"{}\",\"{}\"",
            puk.as_str(),
            new_pin.as_str()
        ));
        let result = Self::send_guarded(channel, LockType::Puk, cmd).await;
        self.process(channel, result).await
    }

    pub async fn handle_change_pin(
        &mut self,
        channel: &mut dyn AtChannel,
        old_pin: &SimCode,
        new_pin: &SimCode,
    ) -> bool {
        let cmd = Cmd::new(format!(
            "AT+CPWD=\"SC\",\"{}\",\"{}\"",
            old_pin.as_str(),
            new_pin.as_str()
        ));
        let result = Self::send_guarded(channel, LockType::Pin, cmd).await;
        self.process(channel, result).await
    }

    pub async fn handle_set_pin_lock(
        &mut self,
        channel: &mut dyn AtChannel,
        pin: &SimCode,
        enabled: bool,
    ) -> bool {
        let cmd = Cmd::new(format!(
            "AT+CLCK=\"SC\",{},\"{}\"",
            u8::from(enabled),
            pin.as_str()
        ));
        let result = Self::send_guarded(channel, LockType::Pin, cmd).await;
        let ok = self.process(channel, result).await;
        if ok {
            self.emit(SimEvent::PinLockChanged(enabled));
        }

        ok
    }

    /// Whether PIN protection is enabled. Assumes it is when the query fails.
    pub async fn is_pin_locked(&self, channel: &mut dyn AtChannel) -> bool {
        let result = channel.cmd(&Cmd::new("AT+CLCK=\"SC\",2")).await;
        response::parse_clck(&result).unwrap_or_else(|e| {
            warn!("failed to read pin lock state: {e}");
            true
        })
    }

    /// Re-reads the SIM state and reacts to it.
    pub async fn refresh_state(&mut self, channel: &mut dyn AtChannel) {
        let result = channel
            .cmd(&Cmd::new("AT+CPIN?").with_timeout(SIM_CMD_TIMEOUT))
            .await;
        match response::parse_cpin(&result) {
            Ok(state) => self.handle_sim_state(channel, state).await,
            Err(e) => warn!("failed to read sim state: {e}"),
        }
    }

    /// Reacts to a SIM state reported by `+CPIN`.
    pub async fn handle_sim_state(&mut self, channel: &mut dyn AtChannel, state: SimState) {
        info!("sim state: {state}");

        match state {
            SimState::Ready => {
                if Self::init_sim_card(channel).await {
                    self.store.set_sim(self.store.selected());
                    self.state = UnlockState::Unlocked;
                    self.emit(SimEvent::Ready);
                } else {
                    error!("sim initialization failed");
                    self.store.set_sim(Sim::Failure);
                    self.emit(SimEvent::Failure);
                }
            }
            SimState::NotReady => {
                self.store.set_sim(Sim::Failure);
                self.emit(SimEvent::Failure);
            }
            SimState::Locked => {
                self.store.set_sim(Sim::Failure);
                self.state = UnlockState::Blocked;
                self.emit(SimEvent::Blocked);
            }
            SimState::SimPin | SimState::SimPin2 | SimState::SimPuk | SimState::SimPuk2 => {
                let facility = match state {
                    SimState::SimPin2 | SimState::SimPuk2 => Facility::Pin2,
                    _ => Facility::Pin1,
                };
                match self.attempts_counters(channel, facility).await {
                    Ok(counters) if counters.puk == 0 => {
                        self.state = UnlockState::Blocked;
                        self.emit(SimEvent::Blocked);
                    }
                    Ok(counters) => {
                        self.state = UnlockState::Locked;
                        let event = match state {
                            SimState::SimPin | SimState::SimPin2 => SimEvent::NeedPin {
                                attempts: counters.pin,
                            },
                            _ => SimEvent::NeedPuk {
                                attempts: counters.puk,
                            },
                        };
                        self.emit(event);
                    }
                    Err(e) => {
                        warn!("failed to read {facility} counters: {e}");
                        self.store.set_sim(Sim::Unknown);
                        self.emit(SimEvent::Unknown);
                    }
                }
            }
            _ => {
                self.store.set_sim(Sim::Unknown);
                self.emit(SimEvent::Unknown);
            }
        }

        self.emit(SimEvent::StateChanged(state));
    }

    async fn init_sim_card(channel: &mut dyn AtChannel) -> bool {
        for cmd in SIM_INIT_COMMANDS {
            let result = channel.cmd(&Cmd::new(*cmd)).await;
            if !result.is_ok() {
                warn!("`{cmd}` failed: {}", result.code);
                return false;
            }
        }

        true
    }

    /// Switches to `slot`. The card in the new slot reports itself through
    /// `+CPIN`; [`Self::handle_sim_timer`] checks later whether one is there at all.
    pub async fn handle_set_active_sim(&mut self, channel: &mut dyn AtChannel, slot: Sim) -> bool {
        let index = match slot {
            Sim::Sim1 => 0,
            Sim::Sim2 => 1,
            other => {
                warn!("cannot select {other} as the active sim");
                return false;
            }
        };

        let result = channel
            .cmd(&Cmd::new(format!("AT+QDSIM={index}")).with_timeout(SIM_CMD_TIMEOUT))
            .await;
        if !result.is_ok() {
            warn!("failed to select {slot}: {}", result.code);
            return false;
        }

        info!("selected {slot}");
        self.store.set_selected(slot);
        self.store.set_sim(Sim::None);
        self.inserted = None;
        self.select_in_progress = true;
        self.emit(SimEvent::SlotSelected(slot));

        true
    }

    /// Card insertion status as reported by `AT+QSIMSTAT?`.
    pub async fn read_sim_card_insert_status(
        channel: &mut dyn AtChannel,
    ) -> Option<SimInsertion> {
        let result = channel.cmd(&Cmd::new("AT+QSIMSTAT?")).await;
        response::parse_qsimstat(&result)
            .inspect_err(|e| warn!("failed to read sim insertion status: {e}"))
            .ok()
    }

    /// Whether a card may be in the selected slot. An unknown status counts as
    /// inserted, a failed read as not.
    pub async fn is_sim_card_inserted(&mut self, channel: &mut dyn AtChannel) -> bool {
        if self.inserted.is_none() {
            self.inserted = Self::read_sim_card_insert_status(channel).await;
        }

        matches!(
            self.inserted,
            Some(SimInsertion::Inserted | SimInsertion::Unknown)
        )
    }

    /// End of the grace period after a slot switch.
    pub async fn handle_sim_timer(&mut self, channel: &mut dyn AtChannel) {
        self.select_in_progress = false;
        if !self.is_sim_card_inserted(channel).await {
            self.not_present();
        }
    }

    /// Reacts to an unsolicited `+QSIMSTAT` report.
    pub fn handle_sim_insertion_notification(&mut self, status: SimInsertion) {
        let previous = self.inserted.replace(status);
        info!("sim insertion status: {status}");
        if previous.is_some_and(|p| p != status) && status == SimInsertion::Removed {
            self.not_present();
        }
    }

    /// Reacts to the SIM tray being opened or closed.
    pub async fn handle_tray_state(&mut self, channel: &mut dyn AtChannel, tray: Tray) {
        info!("sim tray {tray}");
        self.store.set_tray(tray);
        match tray {
            Tray::Out => {
                self.inserted = Some(SimInsertion::Removed);
                self.not_present();
            }
            Tray::In => {
                self.inserted = None;
                self.refresh_state(channel).await;
            }
        }
    }

    fn not_present(&mut self) {
        self.store.set_sim(Sim::None);
        self.state = UnlockState::Locked;
        self.emit(SimEvent::NotPresent);
    }

    async fn process(&mut self, channel: &mut dyn AtChannel, result: SimResult) -> bool {
        match result {
            SimResult::Ok => {
                self.state = UnlockState::Unlocked;
                true
            }
            SimResult::IncorrectPassword => {
                info!("incorrect sim code");
                self.state = UnlockState::Locked;
                self.refresh_state(channel).await;
                false
            }
            other => self.unhandled(other),
        }
    }

    fn unhandled(&mut self, result: SimResult) -> bool {
        let code = result.cme_code();
        warn!("unhandled sim error, cme {code}");
        self.state = UnlockState::Error;
        self.emit(SimEvent::UnhandledCme(code));
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::at::testing::ScriptedChannel;

    fn sim() -> (SimCard, flume::Receiver<SimEvent>, GsmStore) {
        let (tx, rx) = flume::unbounded();
        let store = GsmStore::default();
        (SimCard::new(store.clone(), tx), rx, store)
    }

    fn pin() -> SimCode {
        SimCode::pin("1234").unwrap()
    }

    #[test]
    fn it_validates_sim_codes() {
        assert!(SimCode::pin("1234").is_ok());
        assert!(SimCode::pin("12345678").is_ok());
        assert_eq!(
            SimCode::pin("123"),
            Err(SimCodeError::Length {
                expected: "4 to 8",
                got: 3
            })
        );
        assert_eq!(SimCode::pin("12a4"), Err(SimCodeError::NotNumeric));
        assert!(SimCode::puk("1234567").is_err());
        assert_eq!(format!("{:?}", pin()), "SimCode(****)");
    }

    #[tokio::test]
    async fn it_unlocks_with_correct_pin() {
        // Arrange
        let (mut sim, events, _) = sim();
        let mut channel = ScriptedChannel::new()
            .expect("AT+QPINC=\"SC\"", &[r#"+QPINC: "SC",3,10"#, "OK"])
            .expect("AT+CPIN=\"1234\"", &["OK"]);

        // Act
        let ok = sim.handle_pin_unlock(&mut channel, &pin()).await;

        // Assert
        assert!(ok);
        assert_eq!(sim.state(), UnlockState::Unlocked);
        assert!(events.try_iter().next().is_none());
        assert!(channel.is_done());
    }

    #[tokio::test]
    async fn it_rereads_state_after_incorrect_pin() {
        let (mut sim, events, _) = sim();
        let mut channel = ScriptedChannel::new()
            .expect("AT+QPINC", &[r#"+QPINC: "SC",3,10"#, "OK"])
            .expect("AT+CPIN=\"1234\"", &["+CME ERROR: 16"])
            .expect("AT+CPIN?", &["+CPIN: SIM PIN", "OK"])
            .expect("AT+QPINC", &[r#"+QPINC: "SC",2,10"#, "OK"]);

        let ok = sim.handle_pin_unlock(&mut channel, &pin()).await;

        assert!(!ok);
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![
                SimEvent::NeedPin { attempts: 2 },
                SimEvent::StateChanged(SimState::SimPin)
            ]
        );
        assert!(channel.is_done());
    }

    #[tokio::test]
    async fn it_reports_unhandled_cme() {
        let (mut sim, events, _) = sim();
        let mut channel = ScriptedChannel::new()
            .expect("AT+QPINC", &[r#"+QPINC: "SC",3,10"#, "OK"])
            .expect("AT+CPIN=", &["+CME ERROR: 13"]);

        let ok = sim.handle_pin_unlock(&mut channel, &pin()).await;

        assert!(!ok);
        assert_eq!(sim.state(), UnlockState::Error);
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![SimEvent::UnhandledCme(13)]
        );
    }

    #[tokio::test]
    async fn it_reports_unknown_error_when_counters_fail() {
        let (mut sim, events, _) = sim();
        let mut channel = ScriptedChannel::new().expect("AT+QPINC", &["ERROR"]);

        assert!(!sim.handle_pin_unlock(&mut channel, &pin()).await);
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![SimEvent::UnhandledCme(100)]
        );
    }

    #[tokio::test]
    async fn it_refuses_pin_when_no_attempts_left() {
        let (mut sim, events, _) = sim();
        let mut channel = ScriptedChannel::new()
            .expect("AT+QPINC", &[r#"+QPINC: "SC",0,10"#, "OK"]);

        assert!(!sim.handle_pin_unlock(&mut channel, &pin()).await);
        assert_eq!(sim.state(), UnlockState::Error);
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![SimEvent::UnhandledCme(12)]
        );
        assert!(channel.is_done());
    }

    #[tokio::test]
    async fn it_reports_puk_required_as_unhandled_cme() {
        // Arrange
        let (mut sim, events, _) = sim();
        let mut channel = ScriptedChannel::new()
            .expect("AT+QPINC", &[r#"+QPINC: "SC",3,10"#, "OK"])
            .expect("AT+CPIN=\"1234\"", &["+CME ERROR: 12"]);

        // Act
        let ok = sim.handle_pin_unlock(&mut channel, &pin()).await;

        // Assert
        assert!(!ok);
        assert_eq!(sim.state(), UnlockState::Error);
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![SimEvent::UnhandledCme(12)]
        );
    }

    #[tokio::test]
    async fn it_guards_pin_changes_with_the_pin_counter() {
        // Arrange
        let (mut sim, events, _) = sim();
        let new_pin = SimCode::pin("4321").unwrap();
        let mut channel = ScriptedChannel::new()
            .expect("AT+QPINC=\"SC\"", &[r#"+QPINC: "SC",2,10"#, "OK"])
            .expect("AT+CPWD=\"SC\",\"1234\",\"4321\"", &["OK"])
            .expect("AT+QPINC=\"SC\"", &[r#"+QPINC: "SC",0,10"#, "OK"])
            .expect("AT+QPINC=\"SC\"", &[r#"+QPINC: "SC",0,10"#, "OK"]);

        // Act
        let changed = sim.handle_change_pin(&mut channel, &pin(), &new_pin).await;
        let changed_when_locked = sim.handle_change_pin(&mut channel, &pin(), &new_pin).await;
        let lock_when_locked = sim.handle_set_pin_lock(&mut channel, &pin(), false).await;

        // Assert
        assert!(changed);
        assert!(!changed_when_locked);
        assert!(!lock_when_locked);
        assert!(channel.is_done());
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![SimEvent::UnhandledCme(12), SimEvent::UnhandledCme(12)]
        );
    }

    #[tokio::test]
    async fn it_unblocks_with_puk() {
        let (mut sim, _, _) = sim();
        let mut channel = ScriptedChannel::new()
            .expect("AT+QPINC", &[r#"+QPINC: "SC",0,10"#, "OK"])
            .expect("AT+CPIN=\"12345678\",\"1234\"", &["OK"]);
        let puk = SimCode::puk("12345678").unwrap();

        assert!(sim.handle_unblock_with_puk(&mut channel, &puk, &pin()).await);
        assert!(channel.is_done());
    }

    #[tokio::test]
    async fn it_handles_sim_states() {
        let (mut sim, events, store) = sim();
        let mut channel = ScriptedChannel::new()
            .expect("AT+CMGF=1", &["OK"])
            .expect("AT+CSCS", &["OK"])
            .expect("AT+CLIP=1", &["OK"])
            .expect("AT+QPINC=\"SC\"", &[r#"+QPINC: "SC",3,0"#, "OK"])
            .expect("AT+QPINC=\"P2\"", &[r#"+QPINC: "P2",3,10"#, "OK"]);

        sim.handle_sim_state(&mut channel, SimState::Ready).await;
        assert!(store.is_sim_initialized());

        sim.handle_sim_state(&mut channel, SimState::SimPuk).await;
        sim.handle_sim_state(&mut channel, SimState::SimPuk2).await;
        sim.handle_sim_state(&mut channel, SimState::NotReady).await;
        assert!(!store.is_sim_initialized());

        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![
                SimEvent::Ready,
                SimEvent::StateChanged(SimState::Ready),
                SimEvent::Blocked,
                SimEvent::StateChanged(SimState::SimPuk),
                SimEvent::NeedPuk { attempts: 10 },
                SimEvent::StateChanged(SimState::SimPuk2),
                SimEvent::Failure,
                SimEvent::StateChanged(SimState::NotReady),
            ]
        );
    }

    #[tokio::test]
    async fn it_toggles_pin_lock() {
        let (mut sim, events, _) = sim();
        let mut channel = ScriptedChannel::new()
            .expect("AT+QPINC", &[r#"+QPINC: "SC",3,10"#, "OK"])
            .expect("AT+CLCK=\"SC\",1,\"1234\"", &["OK"])
            .expect("AT+CLCK=\"SC\",2", &["+CLCK: 1", "OK"])
            .expect("AT+CLCK=\"SC\",2", &["ERROR"]);

        assert!(sim.handle_set_pin_lock(&mut channel, &pin(), true).await);
        assert!(sim.is_pin_locked(&mut channel).await);
        assert!(sim.is_pin_locked(&mut channel).await);
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![SimEvent::PinLockChanged(true)]
        );
    }

    #[tokio::test]
    async fn it_fails_the_sim_when_initialization_fails() {
        let (mut sim, events, store) = sim();
        let mut channel = ScriptedChannel::new()
            .expect("AT+CMGF=1", &["OK"])
            .expect("AT+CSCS", &["ERROR"]);

        sim.handle_sim_state(&mut channel, SimState::Ready).await;

        assert_eq!(store.sim(), Sim::Failure);
        assert!(!store.is_sim_initialized());
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![SimEvent::Failure, SimEvent::StateChanged(SimState::Ready)]
        );
    }

    #[tokio::test]
    async fn it_selects_a_slot_and_reports_a_missing_card() {
        // Arrange
        let (mut sim, events, store) = sim();
        let mut channel = ScriptedChannel::new()
            .expect("AT+QDSIM=1", &["OK"])
            .expect("AT+QSIMSTAT?", &["+QSIMSTAT: 1,0", "OK"]);

        // Act
        assert!(sim.handle_set_active_sim(&mut channel, Sim::Sim2).await);
        assert!(sim.is_select_in_progress());
        sim.handle_sim_timer(&mut channel).await;

        // Assert
        assert_eq!(store.selected(), Sim::Sim2);
        assert!(!sim.is_select_in_progress());
        assert!(!sim.handle_set_active_sim(&mut channel, Sim::Failure).await);
        assert!(channel.is_done());
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![SimEvent::SlotSelected(Sim::Sim2), SimEvent::NotPresent]
        );
    }

    #[tokio::test]
    async fn it_treats_unknown_insertion_status_as_inserted() {
        let (mut sim, events, _) = sim();
        let mut channel = ScriptedChannel::new()
            .expect("AT+QSIMSTAT?", &["+QSIMSTAT: 1,2", "OK"]);

        sim.handle_sim_timer(&mut channel).await;
        assert!(sim.is_sim_card_inserted(&mut channel).await);

        assert!(channel.is_done());
        assert!(events.try_iter().next().is_none());
    }

    #[test]
    fn it_reports_card_removal_only_on_change() {
        let (mut sim, events, _) = sim();

        sim.handle_sim_insertion_notification(SimInsertion::Removed);
        sim.handle_sim_insertion_notification(SimInsertion::Inserted);
        sim.handle_sim_insertion_notification(SimInsertion::Removed);
        sim.handle_sim_insertion_notification(SimInsertion::Removed);

        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![SimEvent::NotPresent]
        );
    }

    #[tokio::test]
    async fn it_follows_the_tray() {
        let (mut sim, events, store) = sim();
        let mut channel =
            ScriptedChannel::new().expect("AT+CPIN?", &["+CPIN: NOT READY", "OK"]);

        sim.handle_tray_state(&mut channel, Tray::Out).await;
        assert_eq!(store.tray(), Tray::Out);
        sim.handle_tray_state(&mut channel, Tray::In).await;

        assert_eq!(store.tray(), Tray::In);
        assert!(channel.is_done());
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![
                SimEvent::NotPresent,
                SimEvent::Failure,
                SimEvent::StateChanged(SimState::NotReady),
            ]
        );
    }
}
