//! USB tethering: RNDIS configuration and the passthrough hand-over of the modem.

use crate::{
    at::{AtChannel, Cmd, response},
    bus::{Bus, Outbound},
};
use tracing::{info, warn};

const URC_CACHE_ON: &str = "AT+QCFG=\"urc/cache\",1";
const URC_CACHE_OFF: &str = "AT+QCFG=\"urc/cache\",0";

pub async fn is_rndis_enabled(channel: &mut dyn AtChannel) -> bool {
    let result = channel.cmd(&Cmd::new("AT+QCFG=\"usbnet\"")).await;
    match response::parse_usbnet(&result) {
        Ok(mode) => mode == response::UsbNetMode::Rndis,
        Err(e) => {
            warn!("failed to read usbnet mode: {e}");
            false
        }
    }
}

/// Makes sure the modem exposes RNDIS. Returns `true` if it already did; `false`
/// if the mode was just requested and the host has to re-enumerate.
pub async fn configure(channel: &mut dyn AtChannel) -> bool {
    if is_rndis_enabled(channel).await {
        return true;
    }

    info!("switching usbnet to RNDIS");
    let result = channel.cmd(&Cmd::new("AT+QCFG=\"usbnet\",3")).await;
    if !result.is_ok() {
        warn!("failed to set usbnet mode: {}", result.code);
    }

    false
}

/// Silences URCs and hands the modem data path over to the host.
pub async fn enable(channel: &mut dyn AtChannel, bus: &dyn Bus) -> bool {
    let result = channel.cmd(&Cmd::new(URC_CACHE_ON)).await;
    if !result.is_ok() {
        warn!("failed to disable URCs for tethering: {}", result.code);
        return false;
    }

    bus.send(Outbound::Passthrough(true));

    true
}

/// Restores URCs and leaves passthrough. Returns indices of messages that arrived
/// while URCs were silenced, so they can be read now.
pub async fn disable(channel: &mut dyn AtChannel, bus: &dyn Bus) -> Vec<u32> {
    let result = channel.cmd(&Cmd::new(URC_CACHE_OFF)).await;
    if !result.is_ok() {
        warn!("failed to re-enable URCs after tethering: {}", result.code);
    }

    let result = channel
        .cmd(&Cmd::new("AT+CMGL=\"REC UNREAD\"").with_timeout(std::time::Duration::from_secs(5)))
        .await;
    let unread = if result.is_ok() {
        result
            .tokens("+CMGL:")
            .iter()
            .filter_map(|tokens| tokens[0].parse().ok())
            .collect()
    } else {
        warn!("failed to list unread messages: {}", result.code);
        Vec::new()
    };

    bus.send(Outbound::Passthrough(false));

    unread
}
