//! Unsolicited result codes: lines the modem emits on its own.

use super::{
    response::{self, SimInsertion, SimState},
    split_tokens, unquote,
};
use crate::phone_number::PhoneNumber;
use derive_more::Display;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use regex::Regex;
use std::sync::LazyLock;

static CLIP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\+CLIP:\s*"(?P<number>[^"]*)""#).expect("valid CLIP regex")
});

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    NoCarrier,
    Busy,
    NoAnswer,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum UssdStatus {
    NoFurtherActionRequired = 0,
    FurtherActionRequired = 1,
    TerminatedByNetwork = 2,
    OtherClientResponded = 3,
    OperationNotSupported = 4,
    NetworkTimeout = 5,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Urc {
    Ring,
    Clip(PhoneNumber),
    CallAborted(AbortReason),
    NewSms { storage: String, index: u32 },
    SimState(SimState),
    SimInsertion(SimInsertion),
    /// `None` means the modem reported the value as not known or not detectable.
    SignalQuality { rssi: Option<u32>, ber: Option<u32> },
    Ussd {
        status: Option<UssdStatus>,
        message: String,
        dcs: Option<u32>,
    },
}

impl Urc {
    /// Returns `true` for lines that are unsolicited no matter what command is
    /// pending. `NO CARRIER` and friends are excluded: they also terminate `ATD`.
    pub fn is_unsolicited(line: &str) -> bool {
        let line = line.trim();
        line == "RING"
            || ["+CLIP:", "+CMTI:", "+QIND:", "+CUSD:"]
                .iter()
                .any(|h| line.starts_with(h))
    }

    /// `NO CARRIER`, `BUSY` or `NO ANSWER`: the final line of `ATD`/`ATA`, or
    /// the report of a call ending at any other time.
    pub fn is_call_abort(line: &str) -> bool {
        matches!(line.trim(), "NO CARRIER" | "BUSY" | "NO ANSWER")
    }

    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        match line {
            "RING" => return Some(Self::Ring),
            "NO CARRIER" => return Some(Self::CallAborted(AbortReason::NoCarrier)),
            "BUSY" => return Some(Self::CallAborted(AbortReason::Busy)),
            "NO ANSWER" => return Some(Self::CallAborted(AbortReason::NoAnswer)),
            _ => {}
        }

        if let Some(caps) = CLIP_RE.captures(line) {
            return Some(Self::Clip(PhoneNumber::parse(&caps["number"])));
        }
        if let Some(body) = line.strip_prefix("+CMTI:") {
            return parse_cmti(body);
        }
        if let Some(body) = line.strip_prefix("+CPIN:") {
            return Some(Self::SimState(SimState::from_cpin(body)));
        }
        if let Some(body) = line.strip_prefix(response::QSIMSTAT) {
            return response::qsimstat_tokens(&split_tokens(body))
                .ok()
                .map(Self::SimInsertion);
        }
        if let Some(body) = line.strip_prefix("+QIND:") {
            return parse_qind(body);
        }
        if let Some(body) = line.strip_prefix("+CUSD:") {
            return parse_cusd(body);
        }

        None
    }
}

fn parse_cmti(body: &str) -> Option<Urc> {
    let tokens = split_tokens(body);
    if tokens.len() != 2 {
        return None;
    }

    Some(Urc::NewSms {
        storage: unquote(&tokens[0]),
        index: tokens[1].parse().ok()?,
    })
}

fn parse_qind(body: &str) -> Option<Urc> {
    const RSSI_UNKNOWN: [u32; 2] = [99, 199];
    const BER_UNKNOWN: u32 = 99;

    let tokens = split_tokens(body);
    if tokens.len() != 3 || unquote(&tokens[0]) != "csq" {
        return None;
    }

    let rssi = tokens[1]
        .parse::<u32>()
        .ok()
        .filter(|r| !RSSI_UNKNOWN.contains(r));
    let ber = tokens[2].parse::<u32>().ok().filter(|b| *b != BER_UNKNOWN);

    Some(Urc::SignalQuality { rssi, ber })
}

fn parse_cusd(body: &str) -> Option<Urc> {
    let tokens = split_tokens(body);
    if tokens.len() != 3 {
        return None;
    }

    Some(Urc::Ussd {
        status: tokens[0].parse::<u8>().ok().and_then(UssdStatus::from_u8),
        message: unquote(&tokens[1]),
        dcs: tokens[2].parse().ok(),
    })
}
