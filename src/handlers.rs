//! Command-specific handlers.
//!
//! Pure functions over the accumulation buffer and a job's [`HandlerKind`]
//! sub-state — no access to the port, the event bus, or modem state. The
//! engine owns translating a [`HandlerOutcome`] into queue advancement,
//! writes, and event emission, keeping these functions trivially testable.

use crate::error::{EngineError, PinState};
use crate::events::NetworkStatus;
use crate::job::{HandlerKind, HandlerOutcome, JobOutcome};
use crate::parser;

/// Map a `+CPIN:` token to a [`PinState`], or `None` for `READY`.
fn map_cpin_token(token: &str) -> Option<PinState> {
    match token {
        "READY" => None,
        "SIM PIN" => Some(PinState::NeedPin),
        "SIM PUK" => Some(PinState::NeedPuk),
        _ => Some(PinState::Error),
    }
}

/// The default handler: terminates on `isOk` or a parsed error.
fn default_handler(buffer: &[u8]) -> HandlerOutcome {
    if parser::is_ok(buffer) {
        return HandlerOutcome::Done(Ok(JobOutcome::Lines(parser::split_lines(buffer))));
    }
    let err = parser::get_error(buffer);
    if err.is_error() {
        return HandlerOutcome::Done(Err(to_generic_error(&err)));
    }
    HandlerOutcome::Pending
}

fn to_generic_error(err: &parser::ParsedError) -> EngineError {
    match err {
        parser::ParsedError::None => EngineError::Generic("unknown".to_string()),
        parser::ParsedError::Generic { raw } => EngineError::Generic(raw.clone()),
        parser::ParsedError::Cme { message } => EngineError::Command(message.clone()),
    }
}

fn check_modem_handler(buffer: &[u8]) -> HandlerOutcome {
    if parser::is_ok(buffer) {
        return HandlerOutcome::Done(Ok(JobOutcome::ModemReady(true)));
    }
    let err = parser::get_error(buffer);
    if err.is_error() {
        return HandlerOutcome::Done(Err(EngineError::CheckError));
    }
    HandlerOutcome::Pending
}

fn check_pin_handler(buffer: &[u8]) -> HandlerOutcome {
    if parser::is_ok(buffer) {
        let parsed = parser::split_lines(buffer);
        return match parser::find_cpin_state(&parsed) {
            Some(token) => match map_cpin_token(&token) {
                None => HandlerOutcome::Done(Ok(JobOutcome::PinReady)),
                Some(state) => HandlerOutcome::Done(Err(EngineError::PinRequired(state))),
            },
            None => HandlerOutcome::Done(Err(EngineError::ParseError(
                "missing +CPIN fragment".to_string(),
            ))),
        };
    }
    let err = parser::get_error(buffer);
    if err.is_error() {
        return HandlerOutcome::Done(Err(EngineError::CheckPinError(match err {
            parser::ParsedError::Cme { message } => message,
            parser::ParsedError::Generic { raw } => raw,
            parser::ParsedError::None => unreachable!(),
        })));
    }
    HandlerOutcome::Pending
}

fn pin_unlock_handler(buffer: &[u8]) -> HandlerOutcome {
    let err = parser::get_error(buffer);
    if err.is_error() {
        return HandlerOutcome::Done(Err(EngineError::SimUnlock));
    }
    let parsed = parser::split_lines(buffer);
    if let Some(token) = parser::find_cpin_state(&parsed) {
        return match map_cpin_token(&token) {
            None => HandlerOutcome::Done(Ok(JobOutcome::PinReady)),
            Some(state) => HandlerOutcome::Done(Err(EngineError::PinRequired(state))),
        };
    }
    HandlerOutcome::Pending
}

fn check_network_handler(buffer: &[u8]) -> HandlerOutcome {
    if parser::is_ok(buffer) {
        let parsed = parser::split_lines(buffer);
        return match parser::find_creg_status(&parsed) {
            Some((action, status)) => HandlerOutcome::Done(Ok(JobOutcome::Network(
                NetworkStatus {
                    network_action: action,
                    network_status: status,
                },
            ))),
            None => {
                let has_creg = parsed.iter().any(|l| l.starts_with("+CREG"));
                if has_creg {
                    HandlerOutcome::Done(Err(EngineError::ParseErrorComma(
                        "malformed +CREG fields".to_string(),
                    )))
                } else {
                    HandlerOutcome::Done(Err(EngineError::ParseError(
                        "missing +CREG fragment".to_string(),
                    )))
                }
            }
        };
    }
    let err = parser::get_error(buffer);
    if err.is_error() {
        return HandlerOutcome::Done(Err(to_generic_error(&err)));
    }
    HandlerOutcome::Pending
}

fn sms_send_handler(
    buffer: &[u8],
    pdu_body: &[u8],
    prompt_handled: &mut bool,
) -> HandlerOutcome {
    let parsed = parser::split_lines(buffer);
    if !*prompt_handled && parser::is_waiting_for_input(&parsed) {
        *prompt_handled = true;
        return HandlerOutcome::Write(pdu_body.to_vec());
    }
    if parser::is_ok(buffer) {
        return match parser::find_cmgs_reference(&parsed) {
            Some(reference) => HandlerOutcome::Done(Ok(JobOutcome::SmsSent(reference))),
            None => HandlerOutcome::Done(Err(EngineError::ParseError(
                "missing +CMGS reference".to_string(),
            ))),
        };
    }
    let err = parser::get_error(buffer);
    if err.is_error() {
        let message = match err {
            parser::ParsedError::Cme { message } => message,
            parser::ParsedError::Generic { raw } => raw,
            parser::ParsedError::None => unreachable!(),
        };
        return HandlerOutcome::Done(Err(EngineError::SmsSent(message)));
    }
    HandlerOutcome::Pending
}

/// Feed newly accumulated bytes to a job's handler.
///
/// `handler` carries and mutates its own sub-state (e.g. `SmsSend`'s
/// `prompt_handled` flag). Timer-driven handlers (`Reset`) never observe
/// bytes here — the engine advances them purely on timeout; see
/// [`HandlerKind::is_timer_driven`].
pub(crate) fn dispatch(handler: &mut HandlerKind, buffer: &[u8]) -> HandlerOutcome {
    match handler {
        HandlerKind::Default => default_handler(buffer),
        HandlerKind::CheckModem => check_modem_handler(buffer),
        HandlerKind::CheckPin => check_pin_handler(buffer),
        HandlerKind::PinUnlock => pin_unlock_handler(buffer),
        HandlerKind::CheckNetwork => check_network_handler(buffer),
        HandlerKind::SmsSend {
            pdu_body,
            prompt_handled,
        } => sms_send_handler(buffer, pdu_body, prompt_handled),
        HandlerKind::Reset => HandlerOutcome::Pending,
        HandlerKind::AbortInput => HandlerOutcome::Pending,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_completes_on_ok() {
        let outcome = default_handler(b"\r\nOK\r\n");
        assert!(matches!(outcome, HandlerOutcome::Done(Ok(JobOutcome::Lines(_)))));
    }

    #[test]
    fn default_pending_without_terminator() {
        let outcome = default_handler(b"+CSQ: 1,2\r\n");
        assert!(matches!(outcome, HandlerOutcome::Pending));
    }

    #[test]
    fn check_modem_success() {
        let outcome = check_modem_handler(b"\r\nOK\r\n");
        assert!(matches!(
            outcome,
            HandlerOutcome::Done(Ok(JobOutcome::ModemReady(true)))
        ));
    }

    #[test]
    fn check_modem_failure() {
        let outcome = check_modem_handler(b"\r\nERROR\r\n");
        assert!(matches!(
            outcome,
            HandlerOutcome::Done(Err(EngineError::CheckError))
        ));
    }

    #[test]
    fn check_pin_ready() {
        let outcome = check_pin_handler(b"\r\n+CPIN: READY\r\n\r\nOK\r\n");
        assert!(matches!(
            outcome,
            HandlerOutcome::Done(Ok(JobOutcome::PinReady))
        ));
    }

    #[test]
    fn check_pin_need_pin() {
        let outcome = check_pin_handler(b"\r\n+CPIN: SIM PIN\r\n\r\nOK\r\n");
        assert!(matches!(
            outcome,
            HandlerOutcome::Done(Err(EngineError::PinRequired(PinState::NeedPin)))
        ));
    }

    #[test]
    fn pin_unlock_waits_past_first_ok() {
        // An OK with no +CPIN fragment is not terminal.
        let outcome = pin_unlock_handler(b"\r\nOK\r\n");
        assert!(matches!(outcome, HandlerOutcome::Pending));

        let outcome = pin_unlock_handler(b"\r\nOK\r\n\r\n+CPIN: READY\r\n");
        assert!(matches!(
            outcome,
            HandlerOutcome::Done(Ok(JobOutcome::PinReady))
        ));
    }

    #[test]
    fn check_network_success() {
        let outcome = check_network_handler(b"\r\n+CREG: 0,1\r\n\r\nOK\r\n");
        match outcome {
            HandlerOutcome::Done(Ok(JobOutcome::Network(status))) => {
                assert_eq!(status.network_action, 0);
                assert_eq!(status.network_status, 1);
            }
            _ => panic!("expected Network outcome"),
        }
    }

    #[test]
    fn sms_send_writes_on_prompt_then_completes() {
        let mut prompt_handled = false;
        let outcome = sms_send_handler(b"\r\n> ", b"DEADBEEF\x1a", &mut prompt_handled);
        assert!(matches!(outcome, HandlerOutcome::Write(_)));
        assert!(prompt_handled);

        let outcome = sms_send_handler(
            b"\r\n> \r\n+CMGS: 42\r\n\r\nOK\r\n",
            b"DEADBEEF\x1a",
            &mut prompt_handled,
        );
        assert!(matches!(
            outcome,
            HandlerOutcome::Done(Ok(JobOutcome::SmsSent(42)))
        ));
    }

    #[test]
    fn sms_send_error_maps_to_sms_sent_error() {
        let mut prompt_handled = true;
        let outcome = sms_send_handler(b"\r\nERROR\r\n", b"x", &mut prompt_handled);
        assert!(matches!(
            outcome,
            HandlerOutcome::Done(Err(EngineError::SmsSent(_)))
        ));
    }
}
