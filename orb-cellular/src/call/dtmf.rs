use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("'{0}' is not a DTMF digit")]
pub struct DtmfError(pub char);

/// A single DTMF tone: `0`-`9`, `*` or `#`. Displays quoted, ready for `AT+VTS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfCode(char);

impl DtmfCode {
    pub fn new(digit: char) -> Result<Self, DtmfError> {
        match digit {
            '0'..='9' | '*' | '#' => Ok(Self(digit)),
            other => Err(DtmfError(other)),
        }
    }

    pub fn digit(&self) -> char {
        self.0
    }
}

impl TryFrom<char> for DtmfCode {
    type Error = DtmfError;

    fn try_from(digit: char) -> Result<Self, Self::Error> {
        Self::new(digit)
    }
}

impl fmt::Display for DtmfCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}
