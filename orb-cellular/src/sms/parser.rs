//! `+QCMGR` frame parsing and concatenated message reassembly.

use super::{IncomingSms, ucs2};
use crate::{
    at::{split_tokens, unquote},
    phone_number::PhoneNumber,
};
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

const QCMGR: &str = "+QCMGR:";
const SINGLE_PART_TOKENS: usize = 5;
const MULTI_PART_TOKENS: usize = 8;

/// Reassembles concatenated messages, segments keyed by concatenation id and
/// segment index. A bucket is dropped as soon as it is complete.
#[derive(Debug, Default)]
pub struct SmsParser {
    concatenated: HashMap<u16, BTreeMap<u8, String>>,
}

impl SmsParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages waiting for missing segments.
    pub fn pending(&self) -> usize {
        self.concatenated.len()
    }

    /// Parses one `AT+QCMGR` response. Returns the message once it is complete,
    /// `None` for a partial or malformed frame.
    pub fn parse(&mut self, lines: &[String]) -> Option<IncomingSms> {
        let Some(header_idx) = lines.iter().position(|l| l.starts_with(QCMGR)) else {
            debug!("no {QCMGR} line in response");
            return None;
        };
        let body_line = lines.get(header_idx + 1).filter(|l| *l != "OK")?;
        let tokens = split_tokens(&lines[header_idx][QCMGR.len()..]);

        if tokens.len() != SINGLE_PART_TOKENS && tokens.len() != MULTI_PART_TOKENS {
            warn!("unexpected {QCMGR} token count: {}", tokens.len());
            return None;
        }

        let number = match ucs2::decode(&unquote(&tokens[1])) {
            Ok(number) => PhoneNumber::parse(&number),
            Err(e) => {
                warn!("failed to decode sms sender: {e}");
                return None;
            }
        };
        let timestamp = format!("{},{}", unquote(&tokens[3]), unquote(&tokens[4]));
        let Some(date) = parse_timestamp(&timestamp) else {
            warn!("failed to parse sms timestamp '{timestamp}'");
            return None;
        };
        let body = match ucs2::decode(body_line) {
            Ok(body) => body,
            Err(e) => {
                warn!("failed to decode sms body: {e}");
                return None;
            }
        };

        if tokens.len() == SINGLE_PART_TOKENS {
            return Some(IncomingSms { number, body, date });
        }

        let (Ok(id), Ok(current), Ok(total)) = (
            tokens[5].parse::<u16>(),
            tokens[6].parse::<u8>(),
            tokens[7].parse::<u8>(),
        ) else {
            warn!("invalid concatenation fields in {QCMGR} line");
            return None;
        };
        if current == 0 || total == 0 || current > total {
            warn!("invalid sms segment {current}/{total}");
            return None;
        }

        let segments = self.concatenated.entry(id).or_default();
        segments.insert(current, body);
        if segments.len() < usize::from(total) {
            debug!("stored sms segment {current}/{total} of {id}");
            return None;
        }

        let segments = self.concatenated.remove(&id)?;
        Some(IncomingSms {
            number,
            body: segments.into_values().collect(),
            date,
        })
    }
}

/// Parses `yy/MM/dd,hh:mm:ss±zz`, `zz` being the offset in quarter hours.
pub fn parse_timestamp(timestamp: &str) -> Option<DateTime<FixedOffset>> {
    if !timestamp.is_ascii() || timestamp.len() < 3 {
        return None;
    }

    let (datetime, zone) = timestamp.split_at(timestamp.len() - 3);
    let sign = match &zone[..1] {
        "+" => 1,
        "-" => -1,
        _ => return None,
    };
    let quarters: i32 = zone[1..].parse().ok()?;
    let offset = FixedOffset::east_opt(sign * quarters * 15 * 60)?;

    NaiveDateTime::parse_from_str(datetime, "%y/%m/%d,%H:%M:%S")
        .ok()?
        .and_local_timezone(offset)
        .single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    const NUMBER: &str = "+48600700800";

    fn frame(body: &str, concat: Option<(u16, u8, u8)>) -> Vec<String> {
        let mut header = format!(
            r#"+QCMGR: "REC UNREAD","{}",,"22/09/16,14:49:11+08""#,
            ucs2::encode(NUMBER)
        );
        if let Some((id, current, total)) = concat {
            header.push_str(&format!(",{id},{current},{total}"));
        }

        vec![header, ucs2::encode(body), "OK".to_string()]
    }

    #[test]
    fn it_accepts_single_part_messages() {
        let mut parser = SmsParser::new();

        let sms = parser.parse(&frame("Hello", None)).unwrap();

        assert_eq!(sms.body, "Hello");
        assert_eq!(sms.number, PhoneNumber::parse(NUMBER));
        assert_eq!(sms.date.offset().local_minus_utc(), 2 * 3600);
        assert_eq!((sms.date.year(), sms.date.month(), sms.date.day()), (2022, 9, 16));
        assert_eq!(sms.date.hour(), 14);
    }

    #[test]
    fn it_reassembles_segments_in_any_order() {
        let orders = [[1, 2, 3], [3, 2, 1], [2, 3, 1], [1, 3, 2], [2, 1, 3], [3, 1, 2]];
        let parts = ["one ", "two ", "three"];

        for order in orders {
            let mut parser = SmsParser::new();
            let mut parsed = Vec::new();

            for index in order {
                let part = parts[usize::from(index) - 1];
                if let Some(sms) = parser.parse(&frame(part, Some((7, index, 3)))) {
                    parsed.push(sms);
                }
            }

            assert_eq!(parsed.len(), 1, "{order:?}");
            assert_eq!(parsed[0].body, "one two three");
            assert_eq!(parser.pending(), 0);
        }
    }

    #[test]
    fn it_keeps_partial_messages() {
        let mut parser = SmsParser::new();

        assert!(parser.parse(&frame("one ", Some((7, 1, 3)))).is_none());
        assert!(parser.parse(&frame("three", Some((7, 3, 3)))).is_none());
        assert!(parser.parse(&frame("other", Some((8, 1, 2)))).is_none());

        assert_eq!(parser.pending(), 2);
    }

    #[test]
    fn it_rejects_malformed_frames() {
        let mut parser = SmsParser::new();
        let mut bad_tokens = frame("x", None);
        bad_tokens[0].push_str(",1");
        let mut bad_body = frame("x", None);
        bad_body[1] = "00G1".into();

        assert!(parser.parse(&bad_tokens).is_none());
        assert!(parser.parse(&bad_body).is_none());
        assert!(parser.parse(&frame("x", Some((1, 4, 3)))).is_none());
        assert!(parser.parse(&["OK".to_string()]).is_none());
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn it_parses_negative_quarter_hour_offsets() {
        let date = parse_timestamp("21/01/02,03:04:05-22").unwrap();

        assert_eq!(date.offset().local_minus_utc(), -(22 * 15 * 60));
        assert!(parse_timestamp("21/01/02,03:04:05").is_none());
        assert!(parse_timestamp("garbage").is_none());
    }
}
