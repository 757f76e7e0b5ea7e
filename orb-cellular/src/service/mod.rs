//! The cellular service: one mailbox, one task, every component.
//!
//! Events are handled one at a time. Each handler borrows the AT channel for the
//! duration of its modem exchanges, so commands never overlap.

mod effects;
pub mod timer;

use crate::{
    at::{
        AtChannel, Cmd,
        response::{self, CommandKind, Response},
        urc::Urc,
    },
    bus::{Bus, DbQuery, Notification, RequestId},
    call::{CallController, dtmf::DtmfCode},
    config::CellularConfig,
    connection::{ConnectionManager, ConnectionState, PhoneMode},
    phone_number::PhoneNumber,
    sim::{
        SimCard, SimCode, SimEvent,
        store::{GsmStore, SignalQuality, Sim, Tray},
    },
    sms::{SendQueue, SmsParser, SmsRecord, SmsState, outgoing},
    tethering, volte,
};
use color_eyre::{
    Result,
    eyre::{WrapErr as _, bail},
};
use effects::{ServiceCommands, SmsEffects};
use std::{collections::HashSet, time::Duration};
use timer::Timers;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SMS_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Modem setup issued once at startup: no echo, numeric CME errors, SIM
/// detection with insertion reports and signal quality reports. SIM dependent
/// settings follow once the SIM is ready.
const INIT_COMMANDS: &[&str] = &[
    "ATE0",
    "AT+CMEE=1",
    "AT+QSIMDET=1,0",
    "AT+QSIMSTAT=1",
    "AT+QINDCFG=\"csq\",1",
];

/// Everything the service reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PhoneMode(PhoneMode),
    FlightMode(bool),
    /// Message-only cycle length in minutes.
    ConnectionInterval(u32),
    Tethering(bool),
    Favourites {
        enabled: bool,
        numbers: Vec<PhoneNumber>,
    },
    /// A line the modem sent on its own.
    Urc(String),
    ConnectionTick,
    CallPollTick,
    Dial(PhoneNumber),
    Answer,
    HangUp,
    Dtmf(DtmfCode),
    UnlockPin(SimCode),
    UnblockPuk {
        puk: SimCode,
        new_pin: SimCode,
    },
    ChangePin {
        old_pin: SimCode,
        new_pin: SimCode,
    },
    SetPinLock {
        pin: SimCode,
        enabled: bool,
    },
    SelectSim(Sim),
    TrayState(Tray),
    /// Grace period after a SIM slot switch is over.
    SimTimer,
    ReadPhonebook {
        first: u16,
        last: u16,
    },
    /// The outbox changed.
    SmsDbNotification,
    DbSmsRecord {
        request: RequestId,
        record: SmsRecord,
        send_on_delay: bool,
    },
    DbNoMoreSms {
        request: RequestId,
    },
    SendDelayedSms,
    DbCallRecordPersisted {
        request: RequestId,
        id: u32,
    },
    SwitchVolte(bool),
    QueryVolteSupport,
    Shutdown,
}

/// Sender and receiver of the service's event queue.
#[derive(Debug, Clone)]
pub struct Mailbox {
    tx: flume::Sender<Event>,
    rx: flume::Receiver<Event>,
}

impl Mailbox {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    pub fn sender(&self) -> flume::Sender<Event> {
        self.tx.clone()
    }
}

pub struct CellularService {
    channel: Box<dyn AtChannel>,
    bus: Box<dyn Bus>,
    config: CellularConfig,
    store: GsmStore,
    sim: SimCard,
    sim_events: flume::Receiver<SimEvent>,
    calls: CallController,
    connection: ConnectionManager,
    sms_parser: SmsParser,
    send_queue: SendQueue,
    /// Outstanding `NextQueuedSms` requests.
    sms_queries: HashSet<RequestId>,
    tethering: bool,
    mailbox: Mailbox,
    timers: Timers,
}

impl CellularService {
    pub fn new(
        channel: impl AtChannel + 'static,
        bus: impl Bus + 'static,
        store: GsmStore,
        config: CellularConfig,
        mailbox: Mailbox,
    ) -> Self {
        let (sim_tx, sim_events) = flume::unbounded();

        Self {
            channel: Box::new(channel),
            bus: Box::new(bus),
            sim: SimCard::new(store.clone(), sim_tx),
            sim_events,
            calls: CallController::new(),
            connection: ConnectionManager::new(&config),
            sms_parser: SmsParser::new(),
            send_queue: SendQueue::new(),
            sms_queries: HashSet::new(),
            tethering: false,
            timers: Timers::default(),
            config,
            store,
            mailbox,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> Result<()> {
        self.initialize().await;

        while let Ok(event) = self.mailbox.rx.recv_async().await {
            if event == Event::Shutdown {
                info!("cellular service shutting down");
                break;
            }

            debug!("handling {event:?}");
            if let Err(e) = self.handle(event).await {
                error!("failed to handle event: {e:?}");
            }
            self.publish_sim_events().await;
        }

        self.timers.stop_all();

        Ok(())
    }

    async fn initialize(&mut self) {
        for cmd in INIT_COMMANDS {
            let result = self.channel.cmd(&Cmd::new(*cmd)).await;
            if !result.is_ok() {
                warn!("failed to configure modem with `{cmd}`: {}", result.code);
            }
        }

        self.sim.refresh_state(&mut *self.channel).await;

        if self.config.flight_mode {
            let (connection, mut cmds) = self.connection_commands();
            connection.set_flight_mode(&mut cmds, true).await;
        }
        self.change_phone_mode(PhoneMode::Connected).await;
        self.publish_sim_events().await;
    }

    async fn handle(&mut self, event: Event) -> Result<()> {
        match event {
            Event::PhoneMode(mode) => self.change_phone_mode(mode).await,
            Event::FlightMode(enabled) => {
                let (connection, mut cmds) = self.connection_commands();
                connection.set_flight_mode(&mut cmds, enabled).await;
            }
            Event::ConnectionInterval(minutes) => {
                let (connection, mut cmds) = self.connection_commands();
                connection.set_connection_interval(&mut cmds, minutes).await;
            }
            Event::Tethering(enabled) => self.set_tethering(enabled).await?,
            Event::Favourites { enabled, numbers } => {
                self.calls.set_favourites(enabled, numbers);
            }
            Event::Urc(line) => self.handle_urc(&line).await?,
            Event::ConnectionTick => {
                let was_online = self.connection.is_online_period();
                let (connection, mut cmds) = self.connection_commands();
                connection.on_timer_tick(&mut cmds).await;
                if !was_online && self.connection.is_online_period() {
                    self.drive_sms(|queue, fx| queue.handle_db_notification(fx))
                        .await;
                }
            }
            Event::CallPollTick => self.poll_calls().await?,
            Event::Dial(number) => {
                self.calls
                    .start_outgoing(&mut *self.channel, &*self.bus, number)
                    .await?;
                self.follow_call();
            }
            Event::Answer => {
                self.calls.answer(&mut *self.channel, &*self.bus).await?;
                self.follow_call();
            }
            Event::HangUp => {
                self.calls
                    .end_call(&mut *self.channel, &*self.bus, true)
                    .await;
                self.follow_call();
            }
            Event::Dtmf(code) => self.calls.send_dtmf(&mut *self.channel, code).await?,
            Event::UnlockPin(pin) => {
                if !self.sim.handle_pin_unlock(&mut *self.channel, &pin).await {
                    warn!("sim unlock with PIN failed");
                }
            }
            Event::UnblockPuk { puk, new_pin } => {
                if !self
                    .sim
                    .handle_unblock_with_puk(&mut *self.channel, &puk, &new_pin)
                    .await
                {
                    warn!("sim unblock with PUK failed");
                }
            }
            Event::ChangePin { old_pin, new_pin } => {
                if !self
                    .sim
                    .handle_change_pin(&mut *self.channel, &old_pin, &new_pin)
                    .await
                {
                    warn!("changing PIN failed");
                }
            }
            Event::SetPinLock { pin, enabled } => {
                if !self
                    .sim
                    .handle_set_pin_lock(&mut *self.channel, &pin, enabled)
                    .await
                {
                    warn!("changing PIN lock failed");
                }
            }
            Event::SelectSim(slot) => {
                if self
                    .sim
                    .handle_set_active_sim(&mut *self.channel, slot)
                    .await
                {
                    self.timers
                        .start_sim_select(self.config.sim_select_timeout, self.mailbox.sender());
                }
            }
            Event::TrayState(tray) => {
                self.sim.handle_tray_state(&mut *self.channel, tray).await;
            }
            Event::SimTimer => self.sim.handle_sim_timer(&mut *self.channel).await,
            Event::ReadPhonebook { first, last } => {
                let cmd = Cmd::new(format!("AT+CPBR={first},{last}"));
                let Response::Cpbr(contacts) = self.query(CommandKind::Cpbr, cmd).await? else {
                    bail!("unexpected phonebook response");
                };
                self.bus.notify(Notification::Phonebook(contacts));
            }
            Event::SmsDbNotification => {
                self.drive_sms(|queue, fx| queue.handle_db_notification(fx))
                    .await;
            }
            Event::DbSmsRecord {
                request,
                record,
                send_on_delay,
            } => {
                if !self.sms_queries.remove(&request) {
                    debug!("ignoring stale sms record response {request}");
                    return Ok(());
                }
                self.drive_sms(|queue, fx| {
                    queue.handle_incoming_db_record(fx, &record, send_on_delay)
                })
                .await;
            }
            Event::DbNoMoreSms { request } => {
                if self.sms_queries.remove(&request) {
                    self.send_queue.handle_no_more_db_records();
                }
            }
            Event::SendDelayedSms => {
                self.drive_sms(|queue, fx| queue.send_message_if_delayed(fx))
                    .await;
            }
            Event::DbCallRecordPersisted { request, id } => {
                self.calls.on_record_persisted(&*self.bus, request, id);
            }
            Event::SwitchVolte(enable) => self.switch_volte(enable).await?,
            Event::QueryVolteSupport => {
                let status = volte::support_status(&mut *self.channel).await;
                self.bus.notify(Notification::VolteSupport(status));
            }
            Event::Shutdown => {}
        }

        Ok(())
    }

    fn connection_commands(&mut self) -> (&mut ConnectionManager, ServiceCommands<'_>) {
        (
            &mut self.connection,
            ServiceCommands {
                channel: &mut *self.channel,
                bus: &*self.bus,
                calls: &mut self.calls,
                timers: &mut self.timers,
                mailbox: &self.mailbox.tx,
                tick_period: self.config.tick_period,
            },
        )
    }

    async fn change_phone_mode(&mut self, mode: PhoneMode) {
        self.calls.set_phone_mode(mode);
        let (connection, mut cmds) = self.connection_commands();
        let reached = connection.on_phone_mode_change(&mut cmds, mode).await;

        self.bus.notify(Notification::Connection {
            mode,
            state: self.connection.state(),
        });
        if reached && self.is_online() {
            self.drive_sms(|queue, fx| queue.handle_db_notification(fx))
                .await;
        }
    }

    fn is_online(&self) -> bool {
        !self.tethering
            && (self.connection.state() == ConnectionState::Connected
                || self.connection.is_online_period())
    }

    /// Sends `cmd` and parses its result as `kind`.
    async fn query(&mut self, kind: CommandKind, cmd: Cmd) -> Result<Response> {
        let result = self.channel.cmd(&cmd).await;
        response::parse(kind, &result).wrap_err_with(|| format!("`{cmd}` failed"))
    }

    async fn publish_sim_events(&mut self) {
        let events: Vec<_> = self.sim_events.drain().collect();
        for event in events {
            match event {
                SimEvent::Ready => self.read_own_number().await,
                SimEvent::NotPresent | SimEvent::Failure => self.store.set_own_number(None),
                _ => {}
            }
            self.bus.notify(Notification::Sim(event));
        }
    }

    async fn read_own_number(&mut self) {
        match self.query(CommandKind::Cnum, Cmd::new("AT+CNUM")).await {
            Ok(Response::Cnum(number)) => self.store.set_own_number(Some(number)),
            Ok(other) => warn!("unexpected own number response {other:?}"),
            Err(e) => warn!("failed to read own number: {e:?}"),
        }
    }

    /// Keeps the call list poll running exactly while a call is tracked.
    fn follow_call(&mut self) {
        if self.calls.is_active() {
            self.timers
                .start_call_poll(self.config.call_poll_period, self.mailbox.sender());
        } else {
            self.timers.stop_call_poll();
        }
    }

    async fn poll_calls(&mut self) -> Result<()> {
        let Response::Clcc(entries) = self
            .query(CommandKind::Clcc, Cmd::new("AT+CLCC"))
            .await
            .wrap_err("failed to poll call list")?
        else {
            bail!("unexpected call list response");
        };
        self.calls
            .on_clcc(&mut *self.channel, &*self.bus, &entries)
            .await;
        self.follow_call();

        Ok(())
    }

    async fn handle_urc(&mut self, line: &str) -> Result<()> {
        let Some(urc) = Urc::parse(line) else {
            debug!("ignoring unrecognized modem line `{line}`");
            return Ok(());
        };

        match urc {
            Urc::Ring => {
                self.calls.handle_ring(&*self.bus);
                self.follow_call();
            }
            Urc::Clip(number) => {
                self.calls
                    .handle_clip(&mut *self.channel, &*self.bus, number)
                    .await;
                self.follow_call();
            }
            Urc::CallAborted(reason) => {
                info!("call aborted by modem: {reason:?}");
                self.calls
                    .end_call(&mut *self.channel, &*self.bus, false)
                    .await;
                self.follow_call();
            }
            Urc::NewSms { storage, index } => {
                debug!("new sms {index} in {storage}");
                self.read_sms(index).await?;
            }
            Urc::SimState(state) => {
                self.sim.handle_sim_state(&mut *self.channel, state).await;
            }
            Urc::SimInsertion(status) => self.sim.handle_sim_insertion_notification(status),
            Urc::SignalQuality { rssi, ber } => {
                let quality = SignalQuality { rssi, ber };
                self.store.set_signal(quality);
                self.bus.notify(Notification::SignalQuality(quality));
            }
            Urc::Ussd {
                status, message, ..
            } => {
                self.bus.notify(Notification::Ussd { status, message });
            }
        }

        Ok(())
    }

    /// Reads the message at `index`, publishes it once complete and frees the slot.
    async fn read_sms(&mut self, index: u32) -> Result<()> {
        let result = self
            .channel
            .cmd(&Cmd::new(format!("AT+QCMGR={index}")).with_timeout(SMS_READ_TIMEOUT))
            .await;
        if !result.is_ok() {
            bail!("failed to read sms {index}: {}", result.code);
        }

        if let Some(sms) = self.sms_parser.parse(&result.response) {
            info!("received sms from {}", sms.number);
            let number = sms.number.clone();
            self.bus.query(DbQuery::AddIncomingSms(sms));
            self.bus.notify(Notification::SmsReceived(number));
        }

        let result = self
            .channel
            .cmd(&Cmd::new(format!("AT+CMGD={index}")).with_timeout(SMS_READ_TIMEOUT))
            .await;
        if !result.is_ok() {
            warn!("failed to delete sms {index}: {}", result.code);
        }

        Ok(())
    }

    /// Runs one send queue step, then carries out the sends and queries it asked
    /// for, in that order.
    async fn drive_sms(&mut self, step: impl FnOnce(&mut SendQueue, &mut SmsEffects)) {
        let mut fx = SmsEffects {
            online: self.is_online(),
            sim_ready: self.store.is_sim_initialized(),
            ..Default::default()
        };
        step(&mut self.send_queue, &mut fx);

        for record in fx.sends {
            self.send_sms(record).await;
        }
        for _ in 0..fx.queries {
            let request = self.bus.query(DbQuery::NextQueuedSms);
            self.sms_queries.insert(request);
        }
    }

    async fn send_sms(&mut self, record: SmsRecord) {
        let uid = (record.id & 0xff) as u8;
        let ok = match outgoing::send(&mut *self.channel, &record.number, &record.body, uid).await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to send sms {}: {e}", record.id);
                false
            }
        };

        let id = record.id;
        let state = if ok { SmsState::Outbox } else { SmsState::Failed };
        self.bus
            .query(DbQuery::UpdateSms(SmsRecord { state, ..record }));
        self.bus.notify(Notification::SmsSent { id, ok });
    }

    async fn set_tethering(&mut self, enabled: bool) -> Result<()> {
        if enabled == self.tethering {
            return Ok(());
        }

        if enabled {
            if !tethering::configure(&mut *self.channel).await {
                info!("usbnet switched to RNDIS, the host has to re-enumerate the modem");
            }
            if !tethering::enable(&mut *self.channel, &*self.bus).await {
                bail!("failed to enable tethering");
            }
            self.apply_tethering(true);
        } else {
            let unread = tethering::disable(&mut *self.channel, &*self.bus).await;
            self.apply_tethering(false);
            for index in unread {
                if let Err(e) = self.read_sms(index).await {
                    warn!("{e}");
                }
            }
        }

        Ok(())
    }

    fn apply_tethering(&mut self, enabled: bool) {
        info!("tethering {}", if enabled { "enabled" } else { "disabled" });
        self.tethering = enabled;
        self.connection.set_tethering(enabled);
        self.calls.set_tethering(enabled);
        self.bus.notify(Notification::Tethering(enabled));
    }

    async fn switch_volte(&mut self, enable: bool) -> Result<()> {
        if enable && !volte::is_volte_allowed(&mut *self.channel).await {
            bail!("VoLTE is not offered by the current carrier");
        }

        let already = volte::switch_volte(&mut *self.channel, enable)
            .await
            .wrap_err("failed to switch VoLTE")?;
        self.bus.notify(Notification::Volte {
            enabled: enable,
            reboot_required: !already,
        });

        Ok(())
    }
}
