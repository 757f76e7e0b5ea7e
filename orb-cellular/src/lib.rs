//! Cellular modem management: AT command plumbing, SIM authentication, calls,
//! SMS and the network attach policy, driven by a single event loop.

pub mod at;
pub mod bus;
pub mod call;
pub mod config;
pub mod connection;
pub mod phone_number;
pub mod serial;
pub mod service;
pub mod sim;
pub mod sms;
pub mod telemetry;
pub mod tethering;
pub mod volte;

use at::AtChannel;
use bus::Bus;
use color_eyre::Result;
use config::CellularConfig;
use service::{CellularService, Mailbox};
use sim::store::GsmStore;
use tokio::task::JoinHandle;
use tracing::info;

/// Wires the service to its modem channel and bus and spawns it.
///
/// `mailbox` must be the one whose sender feeds unsolicited modem lines, see
/// [`serial::SerialChannel::open`].
#[bon::builder(finish_fn = run)]
pub async fn program(
    channel: impl AtChannel + 'static,
    bus: impl Bus + 'static,
    mailbox: Mailbox,
    #[builder(default)] config: CellularConfig,
    #[builder(default)] store: GsmStore,
) -> Result<Tasks> {
    info!(
        "cellular service starting, connection interval {} min, connected period {} min",
        config.connection_interval, config.connected_period
    );

    let service = CellularService::new(channel, bus, store, config, mailbox);

    Ok(vec![service.spawn()])
}

pub type Tasks = Vec<JoinHandle<Result<()>>>;
