//! Command Job data model.
//!
//! A sum type of handler variants, each owning its own transient sub-state,
//! so the engine's dispatch loop is one pattern match — the Rust realization
//! of the "dynamic handler signatures → sum type of handler variants" point
//! in spec.md's re-architecture hints.

use tokio::sync::oneshot;

use crate::error::EngineError;
use crate::events::NetworkStatus;

/// SUB (Ctrl-Z) — terminates a PDU body write to `AT+CMGS`.
pub const SUB: u8 = 0x1A;
/// ESC — used to abort a pending `>` prompt before a reset.
pub const ESC: u8 = 0x1B;

/// Default per-job timeout.
pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);
/// Timeout for the two-step SMS send handler.
pub const SMS_SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(20);
/// Settle time the reset handler waits before declaring the reset complete.
pub const RESET_SETTLE: std::time::Duration = std::time::Duration::from_secs(6);

/// Successful result of a completed job, shaped per handler kind.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Default handler / cnmi-config / set-sms-mode: just the parsed lines.
    Lines(Vec<String>),
    /// check-modem: the liveness probe result (always `true` on this path —
    /// failure takes the `Err` branch instead).
    ModemReady(bool),
    /// check-pin / pin-unlock: the SIM is ready to use.
    PinReady,
    /// check-network: the parsed registration action/status pair.
    Network(NetworkStatus),
    /// SMS send: the short reference returned by `+CMGS:`.
    SmsSent(u8),
    /// reset: settle timer expired, reset considered complete.
    ResetDone,
    /// Fire-and-forget writes (e.g. the abort-input CR+ESC before a reset).
    Written,
}

/// What a handler wants the engine to do after observing new bytes (or the
/// initial write).
pub enum HandlerOutcome {
    /// Not done yet; keep waiting for more bytes (or the settle timer).
    Pending,
    /// Write these bytes now (the SMS-send handler's `>`-prompt sub-step).
    /// The engine performs the actual write, preserving the single-writer
    /// invariant; conceptually this is the handler's own sub-step.
    Write(Vec<u8>),
    /// Job is done.
    Done(Result<JobOutcome, EngineError>),
}

/// Per-job handler variant and its transient sub-state.
#[derive(Debug, Clone)]
pub enum HandlerKind {
    /// Terminates on `isOk` or a parsed error. Used for `AT+CMEE=2`,
    /// `AT+CNMI=<s>`, `AT+CMGF=0`, and any other fire-and-check command.
    Default,
    /// `AT` — liveness probe.
    CheckModem,
    /// `AT+CPIN?`.
    CheckPin,
    /// `AT+CPIN=<pin>` — not terminal on OK alone; waits for `+CPIN: ...`.
    PinUnlock,
    /// `AT+CREG?`.
    CheckNetwork,
    /// `AT+CMGS=<len>` followed by `<smscTpdu><SUB>` on the `>` prompt.
    SmsSend {
        /// The PDU body to push once the `>` prompt arrives.
        pdu_body: Vec<u8>,
        /// Set once the prompt has been observed and the body written.
        prompt_handled: bool,
    },
    /// `AT+CFUN=<mode>` — does not watch for OK; completes on a fixed settle
    /// timer instead.
    Reset,
    /// The CR+ESC write that aborts a pending `>` prompt immediately before a
    /// reset. Completes as soon as the write happens; no response expected.
    AbortInput,
}

impl HandlerKind {
    /// `AT+CFUN=<mode>` doesn't wait for bytes at all — see [`HandlerKind::Reset`].
    #[must_use]
    pub fn is_timer_driven(&self) -> bool {
        matches!(self, HandlerKind::Reset)
    }

    /// `AbortInput` completes the instant its bytes are written.
    #[must_use]
    pub fn completes_on_write(&self) -> bool {
        matches!(self, HandlerKind::AbortInput)
    }
}

/// Job creation parameters passed to [`crate::engine::Engine::exec`].
pub struct JobSpec {
    /// Command bytes (without trailing CR — the engine appends it unless the
    /// command already ends with SUB or ESC).
    pub command: Vec<u8>,
    /// Handler variant and its initial sub-state.
    pub handler: HandlerKind,
    /// Place at the head of the queue instead of the tail. Never preempts an
    /// already-active head job.
    pub immediate: bool,
    /// Timeout override; defaults to [`DEFAULT_TIMEOUT`].
    pub timeout: Option<std::time::Duration>,
}

impl JobSpec {
    #[must_use]
    pub fn new(command: impl Into<Vec<u8>>, handler: HandlerKind) -> Self {
        Self {
            command: command.into(),
            handler,
            immediate: false,
            timeout: None,
        }
    }

    #[must_use]
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// In-flight unit of work owned exclusively by the engine task.
pub(crate) struct Job {
    pub command: Vec<u8>,
    pub handler: HandlerKind,
    pub timeout: std::time::Duration,
    pub immediate: bool,
    pub reply: oneshot::Sender<Result<JobOutcome, EngineError>>,
}

impl Job {
    pub(crate) fn from_spec(
        spec: JobSpec,
        reply: oneshot::Sender<Result<JobOutcome, EngineError>>,
    ) -> Self {
        Self {
            command: spec.command,
            timeout: spec.timeout.unwrap_or(DEFAULT_TIMEOUT),
            immediate: spec.immediate,
            handler: spec.handler,
            reply,
        }
    }
}
