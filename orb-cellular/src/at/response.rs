//! Typed parsers for the AT command families the service issues.
//!
//! Every parser takes the raw [`AtResult`] and either returns the whole typed
//! response or a [`ParseError`]. A result is never partially accepted: one bad line
//! rejects all of it.

use super::{AtResult, Code, unquote};
use crate::phone_number::PhoneNumber;
use derive_more::Display;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("modem responded with {0}")]
    Channel(Code),
    #[error("no '{0}' line in response")]
    MissingLine(&'static str),
    #[error("'{header}' line has {got} tokens, expected {expected}")]
    TokenCount {
        header: &'static str,
        expected: &'static str,
        got: usize,
    },
    #[error("invalid {field}: '{value}'")]
    InvalidValue { field: &'static str, value: String },
}

impl ParseError {
    /// The result code this error maps to: the channel code when the modem itself
    /// failed, [`Code::ParsingError`] when the content was malformed.
    pub fn code(&self) -> Code {
        match self {
            Self::Channel(code) => *code,
            _ => Code::ParsingError,
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Closed set of command families with a typed parser.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Clcc,
    Cpbr,
    Qpinc,
    Cpin,
    Clck,
    Cnum,
    Qsimstat,
    Cgatt,
    Cimi,
    UsbNet,
    Ims,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Clcc(Vec<ClccEntry>),
    Cpbr(Vec<Contact>),
    Qpinc(AttemptsCounters),
    Cpin(SimState),
    Clck(bool),
    Cnum(String),
    Qsimstat(SimInsertion),
    Cgatt(bool),
    Cimi(String),
    UsbNet(UsbNetMode),
    Ims(ImsConfig),
}

pub fn parse(kind: CommandKind, result: &AtResult) -> ParseResult<Response> {
    match kind {
        CommandKind::Clcc => parse_clcc(result).map(Response::Clcc),
        CommandKind::Cpbr => parse_cpbr(result).map(Response::Cpbr),
        CommandKind::Qpinc => parse_qpinc(result).map(Response::Qpinc),
        CommandKind::Cpin => parse_cpin(result).map(Response::Cpin),
        CommandKind::Clck => parse_clck(result).map(Response::Clck),
        CommandKind::Cnum => parse_cnum(result).map(Response::Cnum),
        CommandKind::Qsimstat => parse_qsimstat(result).map(Response::Qsimstat),
        CommandKind::Cgatt => parse_cgatt(result).map(Response::Cgatt),
        CommandKind::Cimi => parse_cimi(result).map(Response::Cimi),
        CommandKind::UsbNet => parse_usbnet(result).map(Response::UsbNet),
        CommandKind::Ims => parse_ims(result).map(Response::Ims),
    }
}

fn ensure_ok(result: &AtResult) -> ParseResult<()> {
    match result.code {
        Code::Ok => Ok(()),
        code => Err(ParseError::Channel(code)),
    }
}

fn invalid(field: &'static str, value: &str) -> ParseError {
    ParseError::InvalidValue {
        field,
        value: value.to_string(),
    }
}

fn to_enum<T: FromPrimitive>(field: &'static str, token: &str) -> ParseResult<T> {
    token
        .parse::<i64>()
        .ok()
        .and_then(T::from_i64)
        .ok_or_else(|| invalid(field, token))
}

fn to_num<T: std::str::FromStr>(field: &'static str, token: &str) -> ParseResult<T> {
    unquote(token).parse().map_err(|_| invalid(field, token))
}

fn to_bool(field: &'static str, token: &str) -> ParseResult<bool> {
    match token {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(invalid(field, token)),
    }
}

fn first_line(result: &AtResult, header: &'static str) -> ParseResult<Vec<String>> {
    result
        .tokens(header)
        .into_iter()
        .next()
        .ok_or(ParseError::MissingLine(header))
}

fn expect_tokens(
    header: &'static str,
    tokens: &[String],
    allowed: std::ops::RangeInclusive<usize>,
    expected: &'static str,
) -> ParseResult<()> {
    if allowed.contains(&tokens.len()) {
        Ok(())
    } else {
        Err(ParseError::TokenCount {
            header,
            expected,
            got: tokens.len(),
        })
    }
}

// ---- CLCC ----

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum CallDir {
    Mo = 0,
    Mt = 1,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum CallState {
    Active = 0,
    Held = 1,
    Dialing = 2,
    Alerting = 3,
    Incoming = 4,
    Waiting = 5,
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum CallMode {
    Voice = 0,
    Data = 1,
    Fax = 2,
}

/// One line of the current call list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClccEntry {
    /// Modem-assigned index, not stable across calls.
    pub idx: u8,
    pub dir: CallDir,
    pub state: CallState,
    pub mode: CallMode,
    pub multiparty: bool,
    pub number: PhoneNumber,
    pub number_type: String,
    pub alpha: Option<String>,
    pub tokens: usize,
}

const CLCC: &str = "+CLCC:";

pub fn parse_clcc(result: &AtResult) -> ParseResult<Vec<ClccEntry>> {
    ensure_ok(result)?;

    result
        .tokens(CLCC)
        .into_iter()
        .map(|tokens| -> ParseResult<ClccEntry> {
            expect_tokens(CLCC, &tokens, 7..=8, "7 or 8")?;
            Ok(ClccEntry {
                idx: to_num("call index", &tokens[0])?,
                dir: to_enum("call direction", &tokens[1])?,
                state: to_enum("call state", &tokens[2])?,
                mode: to_enum("call mode", &tokens[3])?,
                multiparty: to_bool("multiparty", &tokens[4])?,
                number: PhoneNumber::parse(&unquote(&tokens[5])),
                number_type: tokens[6].clone(),
                alpha: tokens.get(7).map(|a| unquote(a)).filter(|a| !a.is_empty()),
                tokens: tokens.len(),
            })
        })
        .collect()
}

// ---- CPBR ----

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ContactType {
    Unknown = 129,
    International = 145,
    National = 161,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub index: u16,
    pub number: PhoneNumber,
    pub contact_type: ContactType,
    pub name: String,
}

const CPBR: &str = "+CPBR:";

pub fn parse_cpbr(result: &AtResult) -> ParseResult<Vec<Contact>> {
    ensure_ok(result)?;

    let mut contacts = Vec::new();
    for line in &result.response {
        if line == "OK" {
            break;
        }
        let Some(body) = line.strip_prefix(CPBR) else {
            continue;
        };

        let tokens = super::split_tokens(body);
        expect_tokens(CPBR, &tokens, 4..=4, "4")?;
        contacts.push(Contact {
            index: to_num("phonebook index", &tokens[0])?,
            number: PhoneNumber::parse(&unquote(&tokens[1])),
            contact_type: to_enum("contact type", &tokens[2])?,
            name: unquote(&tokens[3]),
        });
    }

    Ok(contacts)
}

// ---- QPINC ----

/// Remaining PIN and PUK attempts for one SIM code facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptsCounters {
    pub pin: u32,
    pub puk: u32,
}

const QPINC: &str = "+QPINC:";

pub fn parse_qpinc(result: &AtResult) -> ParseResult<AttemptsCounters> {
    ensure_ok(result)?;

    let tokens = first_line(result, QPINC)?;
    expect_tokens(QPINC, &tokens, 3..=3, "3")?;

    Ok(AttemptsCounters {
        pin: to_num("PIN counter", &tokens[1])?,
        puk: to_num("PUK counter", &tokens[2])?,
    })
}

// ---- CPIN ----

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimState {
    Ready,
    SimPin,
    SimPuk,
    SimPin2,
    SimPuk2,
    PhNetPin,
    PhNetPuk,
    PhNetSPin,
    PhNetSPuk,
    PhSpPin,
    PhSpPuk,
    PhCorpPin,
    PhCorpPuk,
    Locked,
    NotReady,
    Unknown,
}

impl SimState {
    pub fn from_cpin(value: &str) -> Self {
        match value.trim() {
            "READY" => Self::Ready,
            "SIM PIN" => Self::SimPin,
            "SIM PUK" => Self::SimPuk,
            "SIM PIN2" => Self::SimPin2,
            "SIM PUK2" => Self::SimPuk2,
            "PH-NET PIN" => Self::PhNetPin,
            "PH-NET PUK" => Self::PhNetPuk,
            "PH-NETSUB PIN" => Self::PhNetSPin,
            "PH-NETSUB PUK" => Self::PhNetSPuk,
            "PH-SP PIN" => Self::PhSpPin,
            "PH-SP PUK" => Self::PhSpPuk,
            "PH-CORP PIN" => Self::PhCorpPin,
            "PH-CORP PUK" => Self::PhCorpPuk,
            "BLOCKED" => Self::Locked,
            "NOT READY" | "NOT INSERTED" => Self::NotReady,
            _ => Self::Unknown,
        }
    }
}

const CPIN: &str = "+CPIN:";

pub fn parse_cpin(result: &AtResult) -> ParseResult<SimState> {
    ensure_ok(result)?;

    let tokens = first_line(result, CPIN)?;
    Ok(SimState::from_cpin(&tokens[0]))
}

// ---- CLCK / CGATT ----

const CLCK: &str = "+CLCK:";
const CGATT: &str = "+CGATT:";

pub fn parse_clck(result: &AtResult) -> ParseResult<bool> {
    ensure_ok(result)?;
    let tokens = first_line(result, CLCK)?;
    to_bool("lock status", &tokens[0])
}

pub fn parse_cgatt(result: &AtResult) -> ParseResult<bool> {
    ensure_ok(result)?;
    let tokens = first_line(result, CGATT)?;
    to_bool("attach state", &tokens[0])
}

// ---- CNUM ----

const CNUM: &str = "+CNUM:";

/// Own number from `+CNUM: "alpha","number",type`.
pub fn parse_cnum(result: &AtResult) -> ParseResult<String> {
    ensure_ok(result)?;

    let tokens = first_line(result, CNUM)?;
    expect_tokens(CNUM, &tokens, 3..=4, "3 or 4")?;
    let number = unquote(&tokens[1]);
    if number.is_empty() {
        return Err(invalid("own number", &tokens[1]));
    }

    Ok(number)
}

// ---- QSIMSTAT ----

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum SimInsertion {
    Removed = 0,
    Inserted = 1,
    Unknown = 2,
}

pub(crate) const QSIMSTAT: &str = "+QSIMSTAT:";

/// Parses the tokens after `+QSIMSTAT:`, `<enable>,<inserted>`. Shared by the
/// query response and the unsolicited report.
pub fn qsimstat_tokens(tokens: &[String]) -> ParseResult<SimInsertion> {
    expect_tokens(QSIMSTAT, tokens, 2..=2, "2")?;
    to_enum("sim insertion status", &tokens[1])
}

pub fn parse_qsimstat(result: &AtResult) -> ParseResult<SimInsertion> {
    ensure_ok(result)?;
    qsimstat_tokens(&first_line(result, QSIMSTAT)?)
}

// ---- CIMI ----

pub fn parse_cimi(result: &AtResult) -> ParseResult<String> {
    ensure_ok(result)?;

    result
        .response
        .iter()
        .find(|line| {
            (6..=15).contains(&line.len()) && line.chars().all(|c| c.is_ascii_digit())
        })
        .cloned()
        .ok_or(ParseError::MissingLine("IMSI"))
}

// ---- QCFG ----

const QCFG: &str = "+QCFG:";

fn qcfg_line(result: &AtResult, name: &'static str) -> ParseResult<Vec<String>> {
    result
        .tokens(QCFG)
        .into_iter()
        .find(|tokens| unquote(&tokens[0]).eq_ignore_ascii_case(name))
        .ok_or(ParseError::MissingLine(name))
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum UsbNetMode {
    Rmnet = 0,
    Ecm = 1,
    Mbim = 2,
    Rndis = 3,
}

pub fn parse_usbnet(result: &AtResult) -> ParseResult<UsbNetMode> {
    ensure_ok(result)?;

    let tokens = qcfg_line(result, "usbnet")?;
    expect_tokens(QCFG, &tokens, 2..=2, "2")?;
    to_enum("usbnet mode", &tokens[1])
}

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum ImsSetting {
    FollowMbn = 0,
    Enabled = 1,
    Disabled = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImsConfig {
    pub setting: ImsSetting,
    /// Whether IMS is currently registered, when the modem reports it.
    pub registered: Option<bool>,
}

pub fn parse_ims(result: &AtResult) -> ParseResult<ImsConfig> {
    ensure_ok(result)?;

    let tokens = qcfg_line(result, "ims")?;
    expect_tokens(QCFG, &tokens, 2..=3, "2 or 3")?;

    Ok(ImsConfig {
        setting: to_enum("ims setting", &tokens[1])?,
        registered: tokens
            .get(2)
            .map(|t| to_bool("ims state", t))
            .transpose()?,
    })
}
