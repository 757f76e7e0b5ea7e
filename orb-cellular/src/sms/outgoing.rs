//! Outgoing SMS submission, splitting long bodies into concatenated parts.

use super::ucs2;
use crate::{
    at::{AtChannel, Cmd, Code},
    phone_number::PhoneNumber,
};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// UTF-16 units fitting in a single-part message.
pub const SINGLE_PART_UNITS: usize = 70;
/// UTF-16 units per part of a concatenated message, the rest is taken by the UDH.
pub const PART_UNITS: usize = 67;
pub const MAX_PARTS: usize = 7;

const SEND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("message needs {0} parts, at most {max} are supported", max = MAX_PARTS)]
    TooLong(usize),
    #[error("cannot send an empty message")]
    Empty,
    #[error("modem rejected part {part}: {code}")]
    Rejected { part: usize, code: Code },
}

/// Splits `body` into parts that fit one message each. Surrogate pairs are never
/// split across parts.
pub fn split(body: &str) -> Vec<String> {
    if ucs2::units(body) <= SINGLE_PART_UNITS {
        return vec![body.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut current_units = 0;
    for c in body.chars() {
        if current_units + c.len_utf16() > PART_UNITS {
            parts.push(std::mem::take(&mut current));
            current_units = 0;
        }
        current.push(c);
        current_units += c.len_utf16();
    }
    if !current.is_empty() {
        parts.push(current);
    }

    parts
}

/// Sends `body` to `number`. `uid` tags the parts of a concatenated message.
pub async fn send(
    channel: &mut dyn AtChannel,
    number: &PhoneNumber,
    body: &str,
    uid: u8,
) -> Result<(), SendError> {
    if body.is_empty() {
        return Err(SendError::Empty);
    }

    let parts = split(body);
    if parts.len() > MAX_PARTS {
        return Err(SendError::TooLong(parts.len()));
    }

    let number = ucs2::encode(number.normalized());
    let total = parts.len();
    for (i, part) in parts.iter().enumerate() {
        let cmd = if total == 1 {
            Cmd::new(format!("AT+CMGS=\"{number}\""))
        } else {
            Cmd::new(format!("AT+QCMGS=\"{number}\",{uid},{},{total}", i + 1))
        }
        .with_timeout(SEND_TIMEOUT);

        let result = channel.cmd_with_prompt(&cmd, &ucs2::encode(part)).await;
        if !result.is_ok() {
            return Err(SendError::Rejected {
                part: i + 1,
                code: result.code,
            });
        }
    }

    info!("sent sms in {total} part(s)");

    Ok(())
}
