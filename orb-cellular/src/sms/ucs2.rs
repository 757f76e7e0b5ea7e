//! UCS2 hex text as used by the modem in `AT+CSCS="UCS2"` mode: every UTF-16 code
//! unit written as four hex digits, big endian.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Ucs2Error {
    #[error("UCS2 hex length {0} is not a multiple of 4")]
    Length(usize),
    #[error("invalid UCS2 hex '{0}'")]
    Hex(String),
    #[error("invalid UTF-16 sequence")]
    Utf16,
}

pub fn decode(hex: &str) -> Result<String, Ucs2Error> {
    let hex = hex.trim();
    if hex.len() % 4 != 0 {
        return Err(Ucs2Error::Length(hex.len()));
    }

    let units = hex
        .as_bytes()
        .chunks(4)
        .map(|chunk| {
            let chunk = std::str::from_utf8(chunk).map_err(|_| Ucs2Error::Hex(hex.into()))?;
            u16::from_str_radix(chunk, 16).map_err(|_| Ucs2Error::Hex(chunk.into()))
        })
        .collect::<Result<Vec<u16>, _>>()?;

    String::from_utf16(&units).map_err(|_| Ucs2Error::Utf16)
}

pub fn encode(text: &str) -> String {
    text.encode_utf16().map(|unit| format!("{unit:04X}")).collect()
}

/// Number of UTF-16 code units `text` occupies.
pub fn units(text: &str) -> usize {
    text.encode_utf16().count()
}
