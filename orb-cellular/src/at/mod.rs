//! AT command plumbing: the raw result model, the command builder and the channel
//! every component talks to the modem through.

use async_trait::async_trait;
use derive_more::Display;
use num_derive::FromPrimitive;
use std::time::Duration;

pub mod response;
pub mod urc;

#[cfg(test)]
pub(crate) mod testing;

/// Final status of a command round trip.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Ok,
    Error,
    CmeError,
    CmsError,
    Timeout,
    ParsingError,
    None,
}

/// Error code attached to a `+CME ERROR` or `+CMS ERROR` final line.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    #[display("CME {_0}")]
    Equipment(u32),
    #[display("CMS {_0}")]
    Network(u32),
}

/// Subset of 3GPP TS 27.007 equipment error codes the service reacts to.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum EquipmentErrorCode {
    PhoneFailure = 0,
    OperationNotAllowed = 3,
    OperationNotSupported = 4,
    SimNotInserted = 10,
    SimPinRequired = 11,
    SimPukRequired = 12,
    SimFailure = 13,
    SimBusy = 14,
    SimWrong = 15,
    IncorrectPassword = 16,
    SimPin2Required = 17,
    SimPuk2Required = 18,
    MemoryFull = 20,
    NoNetworkService = 30,
    NetworkTimeout = 31,
    Unknown = 100,
}

/// Raw outcome of one command: every line the modem sent back (final result line
/// included) plus the classified status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtResult {
    pub code: Code,
    pub error: Option<ErrorCode>,
    pub response: Vec<String>,
}

impl Default for AtResult {
    fn default() -> Self {
        Self {
            code: Code::None,
            error: None,
            response: Vec::new(),
        }
    }
}

impl AtResult {
    const CME_ERROR: &str = "+CME ERROR:";
    const CMS_ERROR: &str = "+CMS ERROR:";

    /// Builds a result out of the lines received for a command. The last non-empty
    /// line decides the status.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let response: Vec<String> = lines
            .into_iter()
            .map(|l| l.as_ref().trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let (code, error) = match response.last() {
            Some(last) => Self::classify(last),
            None => (Code::None, None),
        };

        Self {
            code,
            error,
            response,
        }
    }

    pub fn timeout(response: Vec<String>) -> Self {
        Self {
            code: Code::Timeout,
            error: None,
            response,
        }
    }

    /// Returns the status for a final result line, or [`Code::None`] if the line is
    /// not a final result.
    pub fn classify(line: &str) -> (Code, Option<ErrorCode>) {
        let line = line.trim();
        match line {
            "OK" => (Code::Ok, None),
            "ERROR" | "NO CARRIER" | "BUSY" | "NO ANSWER" | "NO DIALTONE" => {
                (Code::Error, None)
            }
            _ => {
                if let Some(code) = line.strip_prefix(Self::CME_ERROR) {
                    let error = code.trim().parse().ok().map(ErrorCode::Equipment);
                    (Code::CmeError, error)
                } else if let Some(code) = line.strip_prefix(Self::CMS_ERROR) {
                    let error = code.trim().parse().ok().map(ErrorCode::Network);
                    (Code::CmsError, error)
                } else {
                    (Code::None, None)
                }
            }
        }
    }

    pub fn is_final(line: &str) -> bool {
        Self::classify(line).0 != Code::None
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    pub fn equipment_error(&self) -> Option<u32> {
        match self.error {
            Some(ErrorCode::Equipment(code)) => Some(code),
            _ => None,
        }
    }

    /// Comma separated, trimmed tokens of every line starting with `header`, header
    /// stripped. Quotes are kept; typed parsers decide what to strip.
    pub fn tokens(&self, header: &str) -> Vec<Vec<String>> {
        self.response
            .iter()
            .filter_map(|line| line.strip_prefix(header))
            .map(split_tokens)
            .collect()
    }
}

pub(crate) fn split_tokens(body: &str) -> Vec<String> {
    body.split(',').map(|t| t.trim().to_string()).collect()
}

pub(crate) fn unquote(token: &str) -> String {
    token.trim().trim_matches('"').to_string()
}

/// A command line plus the time the modem is given to answer it.
#[derive(Display, Debug, Clone, PartialEq, Eq)]
#[display("{text}")]
pub struct Cmd {
    text: String,
    timeout: Duration,
}

impl Cmd {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(300);

    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// The single command channel to the modem.
///
/// Methods take `&mut self`: only one command can be in flight at a time, and the
/// borrow checker enforces it for every component sharing the channel.
#[async_trait]
pub trait AtChannel: Send {
    /// Sends a command and waits for its final result line or the command timeout.
    async fn cmd(&mut self, cmd: &Cmd) -> AtResult;

    /// Sends a command, waits for the `>` prompt and writes `payload` terminated by
    /// Ctrl-Z. Used for SMS submission.
    async fn cmd_with_prompt(&mut self, cmd: &Cmd, payload: &str) -> AtResult;
}
