use regex::Regex;
use std::sync::LazyLock;

use super::types::{ScanResult, ScanStatus};
use crate::error::{Error, Result};

/// Matches any reply, with an optional IDSESSION request-id prefix.
/// Dot-all so multi-line payloads (STATS) stay in one capture.
static GENERIC_REPLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^([0-9]+)?:?\s*(.+)$").unwrap());

/// Matches the status line of a SCAN or INSTREAM reply.
static SCAN_REPLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+)?:?\s*(.+?):\s+(.+?)?\s?(OK|FOUND|ERROR)$").unwrap());

/// Parses a reply line into `(request_id, content)`.
///
/// The request id is 0 when the reply carries no IDSESSION prefix.
pub fn parse_generic_reply(reply: &str) -> Result<(u64, String)> {
    if reply.is_empty() {
        return Err(Error::Protocol("empty reply from clamd".to_string()));
    }

    let captures = GENERIC_REPLY
        .captures(reply)
        .ok_or_else(|| Error::Protocol(format!("unparseable reply '{}'", reply)))?;

    let request_id = parse_request_id(captures.get(1).map(|m| m.as_str()))?;
    let content = captures
        .get(2)
        .map(|m| m.as_str())
        .unwrap_or_default()
        .to_string();

    Ok((request_id, content))
}

/// Parses the status line of a scan reply into `(request_id, ScanResult)`.
pub fn parse_scan_reply(status_line: &str) -> Result<(u64, ScanResult)> {
    if status_line.is_empty() {
        return Err(Error::Protocol("empty reply from clamd".to_string()));
    }

    let captures = SCAN_REPLY
        .captures(status_line)
        .ok_or_else(|| Error::Protocol(format!("unparseable status line '{}'", status_line)))?;

    let request_id = parse_request_id(captures.get(1).map(|m| m.as_str()))?;
    let file_name = captures
        .get(2)
        .map(|m| m.as_str())
        .unwrap_or_default()
        .to_string();
    let message = captures
        .get(3)
        .map(|m| m.as_str().trim())
        .unwrap_or_default();
    let status = match captures.get(4).map(|m| m.as_str()) {
        Some("OK") => ScanStatus::Ok,
        Some("FOUND") => ScanStatus::Found,
        Some("ERROR") => ScanStatus::Error,
        other => {
            return Err(Error::Protocol(format!(
                "unknown scan status '{}'",
                other.unwrap_or_default()
            )))
        }
    };

    // FOUND carries the virus name, ERROR the error text, OK neither.
    let (virus, error) = match status {
        ScanStatus::Ok => (String::new(), String::new()),
        ScanStatus::Found => (message.to_string(), String::new()),
        ScanStatus::Error => (String::new(), message.to_string()),
    };

    let result = ScanResult {
        raw: vec![status_line.to_string()],
        status,
        file_name,
        virus,
        error,
        details: None,
    };

    Ok((request_id, result))
}

fn parse_request_id(capture: Option<&str>) -> Result<u64> {
    match capture {
        None | Some("") => Ok(0),
        Some(digits) => digits
            .parse::<u64>()
            .map_err(|_| Error::Protocol(format!("non-integer request id: '{}'", digits))),
    }
}
