//! Error kinds surfaced by the engine, handlers, and SMS coordinator.

use std::fmt;

/// State reported by `AT+CPIN?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    NeedPin,
    NeedPuk,
    Error,
}

impl fmt::Display for PinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinState::NeedPin => write!(f, "NEED_PIN"),
            PinState::NeedPuk => write!(f, "NEED_PUK"),
            PinState::Error => write!(f, "ERROR"),
        }
    }
}

/// Errors returned by [`crate::engine::Engine::exec`] and the handlers it drives.
#[derive(Debug)]
pub enum EngineError {
    /// `check-modem` failed its liveness probe.
    CheckError,
    /// An otherwise-OK response didn't match the expected structure.
    ParseError(String),
    /// Same as `ParseError`, but specifically a missing/malformed comma-split field.
    ParseErrorComma(String),
    /// `AT+CPIN?` reported a state other than `READY`.
    PinRequired(PinState),
    /// `AT+CPIN=<pin>` was rejected (`PIN_INCORRECT`).
    SimUnlock,
    /// A command-level failure surfaced via `+CME ERROR`.
    CheckPinError(String),
    /// A generic command-level failure with a message from `+CME ERROR`.
    Command(String),
    /// A generic failure (plain `ERROR` with no `+CME ERROR` detail).
    Generic(String),
    /// The job's timeout fired before its handler reached a terminal state.
    /// Carries a snapshot of the parsed buffer at the moment of expiry.
    Unhandled(Vec<String>),
    /// The job was still queued or active when a reset cleared the queue.
    Cancelled,
    /// SMS part send failed; message drawn from `getError`.
    SmsSent(String),
    /// Too many resets (`resetNumber > 5`); no further self-healing attempted.
    Fatal(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::CheckError => write!(f, "modem failed liveness check"),
            EngineError::ParseError(msg) => write!(f, "parse error: {msg}"),
            EngineError::ParseErrorComma(msg) => write!(f, "parse error (comma split): {msg}"),
            EngineError::PinRequired(state) => write!(f, "pin required: {state}"),
            EngineError::SimUnlock => write!(f, "PIN_INCORRECT"),
            EngineError::CheckPinError(msg) => write!(f, "check-pin error: {msg}"),
            EngineError::Command(msg) => write!(f, "command error: {msg}"),
            EngineError::Generic(msg) => write!(f, "error: {msg}"),
            EngineError::Unhandled(lines) => {
                write!(f, "timed out, buffer: {:?}", lines)
            }
            EngineError::Cancelled => write!(f, "job cancelled"),
            EngineError::SmsSent(msg) => write!(f, "sms send failed: {msg}"),
            EngineError::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
