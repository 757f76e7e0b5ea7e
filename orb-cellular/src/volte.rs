//! VoLTE availability per carrier and switching the modem's IMS configuration.

use crate::at::{
    AtChannel, Cmd,
    response::{self, ImsSetting},
};
use derive_more::Display;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportStatus {
    Normal,
    Beta,
    Unsupported,
}

/// Carriers VoLTE is offered on, by MCC+MNC prefix of the IMSI.
const CARRIERS: &[(&str, SupportStatus)] = &[
    // United States
    ("310120", SupportStatus::Normal),
    ("310260", SupportStatus::Normal),
    ("310410", SupportStatus::Normal),
    ("311480", SupportStatus::Normal),
    // Poland
    ("26001", SupportStatus::Beta),
    ("26002", SupportStatus::Beta),
    ("26003", SupportStatus::Beta),
    ("26006", SupportStatus::Beta),
    // Germany
    ("26201", SupportStatus::Beta),
    ("26202", SupportStatus::Beta),
];

const VOICE_DOMAIN_NV: &str = "/nv/item_files/modem/mmode/voice_domain_pref";
const SMS_DOMAIN_NV: &str = "/nv/item_files/modem/mmode/sms_domain_pref";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VolteError {
    #[error("failed to set voice domain preference")]
    VoiceDomain,
    #[error("failed to set SMS domain preference")]
    SmsDomain,
    #[error("failed to enable MBN autoselect")]
    Mbn,
    #[error("failed to read IMS configuration")]
    ImsQuery,
    #[error("failed to write IMS configuration")]
    ImsWrite,
}

pub fn classify_imsi(imsi: &str) -> SupportStatus {
    CARRIERS
        .iter()
        .find(|(prefix, _)| imsi.starts_with(prefix))
        .map(|(_, status)| *status)
        .unwrap_or(SupportStatus::Unsupported)
}

pub async fn read_imsi(channel: &mut dyn AtChannel) -> Option<String> {
    let result = channel.cmd(&Cmd::new("AT+CIMI")).await;
    response::parse_cimi(&result)
        .inspect_err(|e| warn!("failed to read IMSI: {e}"))
        .ok()
}

pub async fn support_status(channel: &mut dyn AtChannel) -> SupportStatus {
    match read_imsi(channel).await {
        Some(imsi) => classify_imsi(&imsi),
        None => SupportStatus::Unsupported,
    }
}

pub async fn is_volte_allowed(channel: &mut dyn AtChannel) -> bool {
    support_status(channel).await != SupportStatus::Unsupported
}

async fn write_nv(channel: &mut dyn AtChannel, item: &str, value: &str) -> bool {
    channel
        .cmd(&Cmd::new(format!("AT+QNVFW=\"{item}\",{value}")))
        .await
        .is_ok()
}

/// Enables or disables VoLTE. Returns `Ok(true)` if the modem already was in the
/// requested state, `Ok(false)` if the configuration changed and the modem needs
/// a reboot for it to apply.
pub async fn switch_volte(channel: &mut dyn AtChannel, enable: bool) -> Result<bool, VolteError> {
    if enable {
        if !write_nv(channel, VOICE_DOMAIN_NV, "03").await {
            return Err(VolteError::VoiceDomain);
        }
        if !write_nv(channel, SMS_DOMAIN_NV, "01").await {
            return Err(VolteError::SmsDomain);
        }
        let mbn = channel
            .cmd(&Cmd::new("AT+QMBNCFG=\"autoselect\",1"))
            .await;
        if !mbn.is_ok() {
            return Err(VolteError::Mbn);
        }
    } else if !write_nv(channel, VOICE_DOMAIN_NV, "00").await {
        return Err(VolteError::VoiceDomain);
    }

    let result = channel.cmd(&Cmd::new("AT+QCFG=\"ims\"")).await;
    let ims = response::parse_ims(&result).map_err(|e| {
        warn!("failed to parse IMS configuration: {e}");
        VolteError::ImsQuery
    })?;

    let wanted = if enable {
        ImsSetting::Enabled
    } else {
        ImsSetting::Disabled
    };
    if ims.setting == wanted {
        return Ok(true);
    }

    info!("switching IMS from {} to {wanted}", ims.setting);
    let result = channel
        .cmd(&Cmd::new(format!("AT+QCFG=\"ims\",{}", wanted as u8)))
        .await;
    if !result.is_ok() {
        return Err(VolteError::ImsWrite);
    }

    Ok(false)
}
