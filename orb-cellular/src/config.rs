use bon::Builder;
use std::time::Duration;

/// Service settings. Connectivity periods are in minutes, one connection timer
/// tick per minute by default.
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct CellularConfig {
    /// Message-only cycle length. `0` keeps the modem attached while offline.
    #[builder(default = 0)]
    pub connection_interval: u32,
    /// How long an online window of the message-only cycle lasts.
    #[builder(default = 5)]
    pub connected_period: u32,
    #[builder(default = 3)]
    pub max_fail_retries: u32,
    #[builder(default = Duration::from_secs(60))]
    pub tick_period: Duration,
    #[builder(default = Duration::from_secs(1))]
    pub call_poll_period: Duration,
    #[builder(default = false)]
    pub flight_mode: bool,
    /// Grace period after switching SIM slots before a missing card is reported.
    #[builder(default = Duration::from_secs(10))]
    pub sim_select_timeout: Duration,
}

impl Default for CellularConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
