//! Line parser / classifier.
//!
//! Splits a raw accumulation buffer into logical lines and recognizes the
//! terminal and unsolicited patterns the engine and handlers key off of.
//! The CRLF-termination checks here are load-bearing: a premature match on a
//! partially received line is the classic bug in AT-command drivers.

/// Split a raw buffer on CR/LF sequences, discarding empty fragments.
pub fn split_lines(buffer: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(buffer)
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn ends_with_crlf(buffer: &[u8]) -> bool {
    buffer.ends_with(b"\r\n")
}

/// `isOk`: last fragment is exactly `OK` AND the raw buffer ends with CRLF.
pub fn is_ok(buffer: &[u8]) -> bool {
    if !ends_with_crlf(buffer) {
        return false;
    }
    split_lines(buffer).last().map(String::as_str) == Some("OK")
}

/// `isWaitingForInput`: the last fragment begins with `>` (PDU body prompt).
pub fn is_waiting_for_input(parsed: &[String]) -> bool {
    parsed.last().is_some_and(|line| line.starts_with('>'))
}

/// Outcome of [`get_error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedError {
    None,
    /// Plain `ERROR`, raw is the joined fragments.
    Generic { raw: String },
    /// `+CME ERROR: <message>` / `+CMS ERROR: <message>`.
    Cme { message: String },
}

impl ParsedError {
    #[must_use]
    pub fn is_error(&self) -> bool {
        !matches!(self, ParsedError::None)
    }
}

/// `getError`: only meaningful once the raw buffer ends with CRLF.
pub fn get_error(buffer: &[u8]) -> ParsedError {
    if !ends_with_crlf(buffer) {
        return ParsedError::None;
    }
    let lines = split_lines(buffer);
    let Some(last) = lines.last() else {
        return ParsedError::None;
    };
    if last == "ERROR" {
        return ParsedError::Generic { raw: lines.join(" ") };
    }
    if last.starts_with("+C") {
        if let Some(idx) = last.find(" ERROR: ") {
            let message = last[idx + " ERROR: ".len()..].to_string();
            return ParsedError::Cme { message };
        }
    }
    ParsedError::None
}

/// True if any fragment starts with `+CREG: ` (unsolicited registration URC).
pub fn has_creg(parsed: &[String]) -> bool {
    parsed.iter().any(|l| l.starts_with("+CREG: "))
}

/// True if any fragment starts with `+CMTI: ` (new SMS indication).
pub fn has_cmti(parsed: &[String]) -> bool {
    parsed.iter().any(|l| l.starts_with("+CMTI: "))
}

/// True if any fragment starts with `+CDS: ` (delivery status report URC).
pub fn has_cds(parsed: &[String]) -> bool {
    parsed.iter().any(|l| l.starts_with("+CDS: "))
}

/// Network-ready heuristic: both `Call Ready` and `SMS Ready` banners present.
pub fn is_network_ready_banner(parsed: &[String]) -> bool {
    parsed.iter().any(|l| l == "Call Ready") && parsed.iter().any(|l| l == "SMS Ready")
}

/// A held `+CDS:` report: the short reference plus the raw PDU payload line
/// that follows it. Returns `None` if the payload line hasn't arrived yet, or
/// if the raw buffer isn't CRLF-terminated (the payload line might be partial).
pub fn find_delivery_report(buffer: &[u8], parsed: &[String]) -> Option<(u8, String)> {
    if !ends_with_crlf(buffer) {
        return None;
    }
    let idx = parsed.iter().position(|l| l.starts_with("+CDS: "))?;
    let short_id: u8 = parsed[idx]["+CDS: ".len()..].trim().parse().ok()?;
    let payload = parsed.get(idx + 1)?.clone();
    Some((short_id, payload))
}

/// `+CPIN: <state>` extraction, used by check-pin and pin-unlock.
pub fn find_cpin_state(parsed: &[String]) -> Option<String> {
    let line = parsed.iter().find(|l| l.starts_with("+CPIN"))?;
    let space = line.find(' ')?;
    Some(line[space + 1..].trim().to_string())
}

/// `+CREG: <networkAction>,<networkStatus>` extraction.
pub fn find_creg_status(parsed: &[String]) -> Option<(i32, i32)> {
    let line = parsed.iter().find(|l| l.starts_with("+CREG: "))?;
    let tail = line.strip_prefix("+CREG: ")?;
    let mut parts = tail.splitn(2, ',');
    let action: i32 = parts.next()?.trim().parse().ok()?;
    let status: i32 = parts.next()?.trim().parse().ok()?;
    Some((action, status))
}

/// `+CMGS: <reference>` extraction.
pub fn find_cmgs_reference(parsed: &[String]) -> Option<u8> {
    let line = parsed.iter().find(|l| l.contains("+CMGS: "))?;
    let idx = line.find("+CMGS: ")?;
    line[idx + "+CMGS: ".len()..].trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_requires_crlf() {
        assert!(!is_ok(b"OK\r"));
        assert!(is_ok(b"OK\r\n"));
    }

    #[test]
    fn ok_requires_last_fragment_exact() {
        assert!(is_ok(b"+CSQ: 1,2\r\nOK\r\n"));
        assert!(!is_ok(b"NOT OK\r\n"));
    }

    #[test]
    fn error_without_crlf_is_none() {
        let e = get_error(b"+CME ERROR: SIM not inserted");
        assert_eq!(e, ParsedError::None);
    }

    #[test]
    fn error_with_crlf_is_cme() {
        let e = get_error(b"\r\n+CME ERROR: SIM not inserted\r\n");
        assert_eq!(
            e,
            ParsedError::Cme {
                message: "SIM not inserted".to_string()
            }
        );
    }

    #[test]
    fn error_generic() {
        let e = get_error(b"\r\nERROR\r\n");
        assert!(e.is_error());
        assert!(matches!(e, ParsedError::Generic { .. }));
    }

    #[test]
    fn waiting_for_input() {
        let parsed = split_lines(b"\r\n> ");
        assert!(is_waiting_for_input(&parsed));
    }

    #[test]
    fn network_ready_banner() {
        let parsed = split_lines(b"\r\nCall Ready\r\nSMS Ready\r\n");
        assert!(is_network_ready_banner(&parsed));
    }

    #[test]
    fn network_ready_requires_both() {
        let parsed = split_lines(b"\r\nCall Ready\r\n");
        assert!(!is_network_ready_banner(&parsed));
    }

    #[test]
    fn cpin_state() {
        let parsed = split_lines(b"\r\n+CPIN: READY\r\n\r\nOK\r\n");
        assert_eq!(find_cpin_state(&parsed).as_deref(), Some("READY"));
    }

    #[test]
    fn creg_status() {
        let parsed = split_lines(b"\r\n+CREG: 0,1\r\n\r\nOK\r\n");
        assert_eq!(find_creg_status(&parsed), Some((0, 1)));
    }

    #[test]
    fn cmgs_reference() {
        let parsed = split_lines(b"\r\n+CMGS: 42\r\n\r\nOK\r\n");
        assert_eq!(find_cmgs_reference(&parsed), Some(42));
    }

    #[test]
    fn delivery_report_waits_for_payload() {
        let buffer = b"\r\n+CDS: 24\r\n";
        let parsed = split_lines(buffer);
        assert!(find_delivery_report(buffer, &parsed).is_none());

        let full = b"\r\n+CDS: 24\r\n07914400000000F0...\r\n";
        let parsed = split_lines(full);
        let (short_id, payload) = find_delivery_report(full, &parsed).unwrap();
        assert_eq!(short_id, 24);
        assert_eq!(payload, "07914400000000F0...");
    }

    #[test]
    fn delivery_report_requires_trailing_crlf() {
        let buffer = b"\r\n+CDS: 24\r\n07914400000000F0...";
        let parsed = split_lines(buffer);
        assert!(find_delivery_report(buffer, &parsed).is_none());
    }
}
