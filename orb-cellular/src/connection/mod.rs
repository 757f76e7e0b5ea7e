//! Network attach policy against the phone mode, including the duty-cycled
//! message-only mode used while offline.

use crate::config::CellularConfig;
use async_trait::async_trait;
use derive_more::Display;
use tracing::{error, info, warn};

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhoneMode {
    #[default]
    Connected,
    DoNotDisturb,
    Offline,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Connected,
    MessageOnlyOffline,
    FullOffline,
}

/// Side effects of the connection policy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionCommands: Send {
    /// `None` when the attach state could not be read.
    async fn is_attached(&mut self) -> Option<bool>;
    async fn attach(&mut self) -> bool;
    async fn detach(&mut self) -> bool;
    async fn hang_up_calls(&mut self);
    fn clear_network_indicator(&mut self);
    fn start_cycle_timer(&mut self);
    fn stop_cycle_timer(&mut self);
    fn hold_minimum_cpu_frequency(&mut self);
    fn release_minimum_cpu_frequency(&mut self);
    fn retry_phone_mode_change(&mut self, mode: PhoneMode);
    fn report_flight_mode(&mut self, enabled: bool);
}

#[derive(Debug)]
pub struct ConnectionManager {
    mode: PhoneMode,
    state: ConnectionState,
    flight_mode: bool,
    tethering: bool,
    connection_interval: u32,
    connected_period: u32,
    max_fail_retries: u32,
    retries: u32,
    minutes_offline: u32,
    minutes_online: u32,
    online_period: bool,
    /// The CPU frequency hold taken for a mode change that has not settled yet.
    cpu_held: bool,
}

impl ConnectionManager {
    pub fn new(config: &CellularConfig) -> Self {
        Self {
            mode: PhoneMode::Connected,
            state: ConnectionState::Connected,
            flight_mode: config.flight_mode,
            tethering: false,
            connection_interval: config.connection_interval,
            connected_period: config.connected_period,
            max_fail_retries: config.max_fail_retries,
            retries: 0,
            minutes_offline: 0,
            minutes_online: 0,
            online_period: false,
            cpu_held: false,
        }
    }

    pub fn mode(&self) -> PhoneMode {
        self.mode
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_flight_mode(&self) -> bool {
        self.flight_mode
    }

    pub fn is_tethering(&self) -> bool {
        self.tethering
    }

    pub fn is_online_period(&self) -> bool {
        self.online_period
    }

    pub fn is_messages_only_mode(&self) -> bool {
        !self.flight_mode && self.connection_interval != 0
    }

    /// Applies a phone mode. Returns `true` once the modem reached the matching
    /// attach state.
    ///
    /// The minimum CPU frequency is held from the first attempt until the change
    /// either succeeds or runs out of retries.
    pub async fn on_phone_mode_change(
        &mut self,
        cmds: &mut dyn ConnectionCommands,
        mode: PhoneMode,
    ) -> bool {
        info!("phone mode change: {} -> {mode}", self.mode);
        self.mode = mode;
        if !self.cpu_held {
            cmds.hold_minimum_cpu_frequency();
            self.cpu_held = true;
        }

        let reached = match mode {
            PhoneMode::Offline => self.handle_offline(cmds).await,
            PhoneMode::Connected | PhoneMode::DoNotDisturb => self.handle_connected(cmds).await,
        };

        // A pending retry keeps the count above zero.
        if self.retries == 0 {
            cmds.release_minimum_cpu_frequency();
            self.cpu_held = false;
        }

        reached
    }

    async fn handle_offline(&mut self, cmds: &mut dyn ConnectionCommands) -> bool {
        let Some(attached) = cmds.is_attached().await else {
            warn!("failed to read attach state");
            self.retry_on_fail(cmds);
            return false;
        };

        if attached {
            cmds.hang_up_calls().await;
            if !cmds.detach().await {
                warn!("failed to detach from network");
                self.retry_on_fail(cmds);
                return false;
            }
        }

        cmds.clear_network_indicator();
        self.retries = 0;
        self.minutes_offline = 0;
        self.minutes_online = 0;
        self.online_period = false;

        if self.is_messages_only_mode() {
            cmds.start_cycle_timer();
            self.state = ConnectionState::MessageOnlyOffline;
        } else {
            cmds.stop_cycle_timer();
            self.state = ConnectionState::FullOffline;
        }

        true
    }

    async fn handle_connected(&mut self, cmds: &mut dyn ConnectionCommands) -> bool {
        cmds.stop_cycle_timer();
        self.online_period = false;

        let Some(attached) = cmds.is_attached().await else {
            warn!("failed to read attach state");
            self.retry_on_fail(cmds);
            return false;
        };

        if !attached && !cmds.attach().await {
            warn!("failed to attach to network");
            self.retry_on_fail(cmds);
            return false;
        }

        self.retries = 0;
        self.state = ConnectionState::Connected;

        true
    }

    /// Re-issues the current mode change, up to `max_fail_retries` times in a row.
    pub fn retry_on_fail(&mut self, cmds: &mut dyn ConnectionCommands) {
        if self.retries < self.max_fail_retries {
            self.retries += 1;
            info!(
                "retrying phone mode change to {} ({}/{})",
                self.mode, self.retries, self.max_fail_retries
            );
            cmds.retry_phone_mode_change(self.mode);
        } else {
            error!(
                "fatal: phone mode change to {} failed {} times, giving up",
                self.mode, self.max_fail_retries
            );
            self.retries = 0;
        }
    }

    /// One minute of the message-only cycle.
    pub async fn on_timer_tick(&mut self, cmds: &mut dyn ConnectionCommands) {
        if self.state != ConnectionState::MessageOnlyOffline || self.connection_interval == 0 {
            return;
        }

        if self.online_period {
            self.minutes_online += 1;
            if self.minutes_online >= self.connected_period {
                if cmds.detach().await {
                    info!("message-only window closed");
                    self.online_period = false;
                    self.minutes_online = 0;
                } else {
                    warn!("failed to detach at end of message-only window");
                }
            }
        } else {
            self.minutes_offline += 1;
            if self.minutes_offline >= self.connection_interval {
                if cmds.attach().await {
                    info!("message-only window opened");
                    self.online_period = true;
                    self.minutes_offline = 0;
                    self.minutes_online = 0;
                } else {
                    warn!("failed to attach for message-only window");
                }
            }
        }
    }

    pub async fn set_connection_interval(
        &mut self,
        cmds: &mut dyn ConnectionCommands,
        minutes: u32,
    ) {
        self.connection_interval = minutes;
        if self.mode == PhoneMode::Offline {
            self.handle_offline(cmds).await;
        }
    }

    pub async fn set_flight_mode(&mut self, cmds: &mut dyn ConnectionCommands, enabled: bool) {
        self.flight_mode = enabled;
        cmds.report_flight_mode(enabled);
        if self.mode == PhoneMode::Offline {
            self.handle_offline(cmds).await;
        }
    }

    pub fn set_tethering(&mut self, enabled: bool) {
        self.tethering = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn manager(connection_interval: u32) -> ConnectionManager {
        let config = CellularConfig::builder()
            .connection_interval(connection_interval)
            .connected_period(2)
            .max_fail_retries(3)
            .build();
        ConnectionManager::new(&config)
    }

    #[test]
    fn it_bounds_retries() {
        // Arrange
        let mut mgr = manager(0);
        let mut cmds = MockConnectionCommands::new();
        cmds.expect_retry_phone_mode_change()
            .with(eq(PhoneMode::Connected))
            .times(3)
            .return_const(());

        // Act
        for _ in 0..3 {
            mgr.retry_on_fail(&mut cmds);
        }
        assert_eq!(mgr.retries(), 3);
        mgr.retry_on_fail(&mut cmds);

        // Assert
        assert_eq!(mgr.retries(), 0);
    }

    #[tokio::test]
    async fn it_enters_message_only_mode_when_going_offline() {
        let mut mgr = manager(10);
        let mut cmds = MockConnectionCommands::new();
        cmds.expect_hold_minimum_cpu_frequency().return_const(());
        cmds.expect_release_minimum_cpu_frequency().return_const(());
        cmds.expect_is_attached().return_const(Some(true));
        cmds.expect_hang_up_calls().times(1).return_const(());
        cmds.expect_detach().times(1).return_const(true);
        cmds.expect_clear_network_indicator().times(1).return_const(());
        cmds.expect_start_cycle_timer().times(1).return_const(());

        assert!(mgr.on_phone_mode_change(&mut cmds, PhoneMode::Offline).await);
        assert_eq!(mgr.state(), ConnectionState::MessageOnlyOffline);
    }

    #[tokio::test]
    async fn it_goes_fully_offline_without_interval_or_in_flight_mode() {
        for (interval, flight) in [(0, false), (10, true)] {
            let mut mgr = manager(interval);
            let mut cmds = MockConnectionCommands::new();
            cmds.expect_hold_minimum_cpu_frequency().return_const(());
            cmds.expect_release_minimum_cpu_frequency().return_const(());
            cmds.expect_report_flight_mode().return_const(());
            cmds.expect_is_attached().return_const(Some(false));
            cmds.expect_clear_network_indicator().return_const(());
            cmds.expect_stop_cycle_timer().return_const(());
            cmds.expect_start_cycle_timer().never();
            mgr.set_flight_mode(&mut cmds, flight).await;

            mgr.on_phone_mode_change(&mut cmds, PhoneMode::Offline).await;

            assert_eq!(mgr.state(), ConnectionState::FullOffline);
        }
    }

    #[tokio::test]
    async fn it_retries_when_detach_fails() {
        let mut mgr = manager(0);
        let mut cmds = MockConnectionCommands::new();
        cmds.expect_hold_minimum_cpu_frequency().return_const(());
        cmds.expect_release_minimum_cpu_frequency().return_const(());
        cmds.expect_is_attached().return_const(Some(true));
        cmds.expect_hang_up_calls().return_const(());
        cmds.expect_detach().return_const(false);
        cmds.expect_retry_phone_mode_change()
            .with(eq(PhoneMode::Offline))
            .times(1)
            .return_const(());

        assert!(!mgr.on_phone_mode_change(&mut cmds, PhoneMode::Offline).await);
        assert_eq!(mgr.retries(), 1);
    }

    #[tokio::test]
    async fn it_attaches_when_connecting() {
        let mut mgr = manager(0);
        let mut cmds = MockConnectionCommands::new();
        cmds.expect_hold_minimum_cpu_frequency().return_const(());
        cmds.expect_release_minimum_cpu_frequency().return_const(());
        cmds.expect_stop_cycle_timer().return_const(());
        cmds.expect_is_attached().return_const(Some(false));
        cmds.expect_attach().times(1).return_const(true);

        assert!(mgr.on_phone_mode_change(&mut cmds, PhoneMode::DoNotDisturb).await);
        assert_eq!(mgr.state(), ConnectionState::Connected);
        assert_eq!(mgr.retries(), 0);
    }

    #[tokio::test]
    async fn it_retries_when_attach_state_is_unknown() {
        let mut mgr = manager(0);
        let mut cmds = MockConnectionCommands::new();
        cmds.expect_hold_minimum_cpu_frequency().return_const(());
        cmds.expect_release_minimum_cpu_frequency().return_const(());
        cmds.expect_stop_cycle_timer().return_const(());
        cmds.expect_is_attached().return_const(None);
        cmds.expect_attach().never();
        cmds.expect_retry_phone_mode_change().times(1).return_const(());

        assert!(!mgr.on_phone_mode_change(&mut cmds, PhoneMode::Connected).await);
    }

    #[tokio::test]
    async fn it_cycles_message_only_windows() {
        // Arrange
        let mut mgr = manager(3);
        let mut cmds = MockConnectionCommands::new();
        cmds.expect_hold_minimum_cpu_frequency().return_const(());
        cmds.expect_release_minimum_cpu_frequency().return_const(());
        cmds.expect_is_attached().return_const(Some(false));
        cmds.expect_clear_network_indicator().return_const(());
        cmds.expect_start_cycle_timer().return_const(());
        mgr.on_phone_mode_change(&mut cmds, PhoneMode::Offline).await;
        cmds.expect_attach().times(1).return_const(true);
        cmds.expect_detach().times(1).return_const(true);

        // Act + Assert
        for _ in 0..2 {
            mgr.on_timer_tick(&mut cmds).await;
        }
        assert!(!mgr.is_online_period());
        mgr.on_timer_tick(&mut cmds).await;
        assert!(mgr.is_online_period());
        mgr.on_timer_tick(&mut cmds).await;
        assert!(mgr.is_online_period());
        mgr.on_timer_tick(&mut cmds).await;
        assert!(!mgr.is_online_period());
    }

    #[tokio::test]
    async fn it_reapplies_offline_policy_when_interval_changes() {
        let mut mgr = manager(0);
        let mut cmds = MockConnectionCommands::new();
        cmds.expect_hold_minimum_cpu_frequency().return_const(());
        cmds.expect_release_minimum_cpu_frequency().return_const(());
        cmds.expect_is_attached().return_const(Some(false));
        cmds.expect_clear_network_indicator().return_const(());
        cmds.expect_stop_cycle_timer().times(1).return_const(());
        cmds.expect_start_cycle_timer().times(1).return_const(());
        mgr.on_phone_mode_change(&mut cmds, PhoneMode::Offline).await;
        assert_eq!(mgr.state(), ConnectionState::FullOffline);

        mgr.set_connection_interval(&mut cmds, 15).await;

        assert_eq!(mgr.state(), ConnectionState::MessageOnlyOffline);
        assert!(mgr.is_messages_only_mode());
    }

    #[tokio::test]
    async fn it_holds_cpu_frequency_until_mode_change_settles() {
        // Arrange
        let mut mgr = manager(0);
        let mut cmds = MockConnectionCommands::new();
        cmds.expect_hold_minimum_cpu_frequency()
            .times(1)
            .return_const(());
        cmds.expect_stop_cycle_timer().return_const(());
        cmds.expect_is_attached().return_const(Some(false));
        cmds.expect_attach().times(1).return_const(false);
        cmds.expect_retry_phone_mode_change().times(1).return_const(());
        cmds.expect_release_minimum_cpu_frequency().never();

        // Act
        assert!(!mgr.on_phone_mode_change(&mut cmds, PhoneMode::Connected).await);
        cmds.checkpoint();
        cmds.expect_hold_minimum_cpu_frequency().never();
        cmds.expect_stop_cycle_timer().return_const(());
        cmds.expect_is_attached().return_const(Some(false));
        cmds.expect_attach().times(1).return_const(true);
        cmds.expect_release_minimum_cpu_frequency()
            .times(1)
            .return_const(());

        // Assert
        assert!(mgr.on_phone_mode_change(&mut cmds, PhoneMode::Connected).await);
        cmds.checkpoint();
    }

    #[tokio::test]
    async fn it_releases_cpu_frequency_after_giving_up() {
        let mut mgr = manager(0);
        let mut cmds = MockConnectionCommands::new();
        cmds.expect_hold_minimum_cpu_frequency()
            .times(1)
            .return_const(());
        cmds.expect_is_attached().return_const(None);
        cmds.expect_retry_phone_mode_change()
            .times(3)
            .return_const(());
        cmds.expect_release_minimum_cpu_frequency()
            .times(1)
            .return_const(());

        for _ in 0..4 {
            mgr.on_phone_mode_change(&mut cmds, PhoneMode::Offline).await;
        }

        assert_eq!(mgr.retries(), 0);
    }
}
