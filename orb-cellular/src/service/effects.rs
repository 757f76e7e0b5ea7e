//! Service-side implementations of the component side-effect traits.

use super::{Event, timer::Timers};
use crate::{
    at::{AtChannel, Cmd, response},
    bus::{Bus, Notification, Outbound},
    call::CallController,
    connection::{ConnectionCommands, PhoneMode},
    sms::{SendEffects, SmsRecord},
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Attach and detach can take the network a long time.
const ATTACH_TIMEOUT: Duration = Duration::from_secs(75);

pub(super) struct ServiceCommands<'a> {
    pub channel: &'a mut dyn AtChannel,
    pub bus: &'a dyn Bus,
    pub calls: &'a mut CallController,
    pub timers: &'a mut Timers,
    pub mailbox: &'a flume::Sender<Event>,
    pub tick_period: Duration,
}

#[async_trait]
impl ConnectionCommands for ServiceCommands<'_> {
    async fn is_attached(&mut self) -> Option<bool> {
        let result = self.channel.cmd(&Cmd::new("AT+CGATT?")).await;
        response::parse_cgatt(&result)
            .inspect_err(|e| warn!("failed to read attach state: {e}"))
            .ok()
    }

    async fn attach(&mut self) -> bool {
        self.channel
            .cmd(&Cmd::new("AT+CGATT=1").with_timeout(ATTACH_TIMEOUT))
            .await
            .is_ok()
    }

    async fn detach(&mut self) -> bool {
        self.channel
            .cmd(&Cmd::new("AT+CGATT=0").with_timeout(ATTACH_TIMEOUT))
            .await
            .is_ok()
    }

    async fn hang_up_calls(&mut self) {
        self.calls.end_call(&mut *self.channel, self.bus, true).await;
        self.timers.stop_call_poll();
    }

    fn clear_network_indicator(&mut self) {
        self.bus.notify(Notification::NetworkIndicatorCleared);
    }

    fn start_cycle_timer(&mut self) {
        self.timers
            .start_connection(self.tick_period, self.mailbox.clone());
    }

    fn stop_cycle_timer(&mut self) {
        self.timers.stop_connection();
    }

    fn hold_minimum_cpu_frequency(&mut self) {
        self.bus.send(Outbound::HoldCpuFrequency);
    }

    fn release_minimum_cpu_frequency(&mut self) {
        self.bus.send(Outbound::ReleaseCpuFrequency);
    }

    fn retry_phone_mode_change(&mut self, mode: PhoneMode) {
        if let Err(e) = self.mailbox.send(Event::PhoneMode(mode)) {
            warn!("failed to re-queue phone mode change: {e}");
        }
    }

    fn report_flight_mode(&mut self, enabled: bool) {
        self.bus.notify(Notification::FlightMode(enabled));
    }
}

/// Snapshot of the send conditions plus the effects requested by the send queue,
/// carried out by the service once the queue returns.
#[derive(Debug, Default)]
pub(super) struct SmsEffects {
    pub online: bool,
    pub sim_ready: bool,
    pub sends: Vec<SmsRecord>,
    pub queries: usize,
}

impl SendEffects for SmsEffects {
    fn is_online(&self) -> bool {
        self.online
    }

    fn is_sim_ready(&self) -> bool {
        self.sim_ready
    }

    fn send(&mut self, record: &SmsRecord) {
        self.sends.push(record.clone());
    }

    fn query_next(&mut self) {
        self.queries += 1;
    }
}
