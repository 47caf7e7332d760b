//! Typed event multiplexer.
//!
//! The source driver this crate supersedes used a stringly-typed event
//! emitter (`open`, `modemready`, `network`, ...). The event set is closed, so
//! it's modeled here as one enum broadcast over a [`tokio::sync::broadcast`]
//! channel instead — generalized from the teacher's `broadcast::Sender<Value>`
//! wiring (`state.rs`) to a typed payload.

use tokio::sync::broadcast;

use crate::sms::{SmsId, SmsPartStatus, SmsStatus};

/// Registration action/status pair reported by `AT+CREG?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    pub network_action: i32,
    pub network_status: i32,
}

/// A raw delivery report, correlated later by the SMS coordinator.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub short_id: u8,
    pub data: String,
}

/// Every event this crate can emit, ordered and never coalesced.
#[derive(Debug, Clone)]
pub enum ModemEvent {
    /// Transport opened.
    Open,
    /// Result of each `check-modem` liveness probe.
    ModemReady(bool),
    /// Emitted at the end of a successful initialization sequence.
    Initialized,
    /// Emitted for each successful `AT+CREG?` parse.
    Network(NetworkStatus),
    /// Same payload as `Network`, kept distinct per the spec's event set.
    NetworkStatusEvent(NetworkStatus),
    /// A liveness probe failed.
    Brownout,
    /// Unhandled incoming data timed out with no job queued to claim it.
    Incoming(Vec<String>),
    /// A job's timeout fired.
    Timeout(String),
    /// A diagnostic error payload.
    Error(String),
    /// Raw delivery report, forwarded to the SMS coordinator.
    DeliveryReport(DeliveryReport),
    /// An SMS part or aggregate status changed.
    StatusChange {
        part_id: String,
        sms_id: SmsId,
        part_status: SmsPartStatus,
        sms_status: SmsStatus,
        message: Option<String>,
    },
    /// An SMS part failed to send.
    SmsError {
        part_id: String,
        sms_id: SmsId,
        error: String,
        error_status: Option<u8>,
    },
}

/// Capacity of the broadcast channel backing [`ModemEvent`] fan-out.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Construct a fresh broadcast sender for `ModemEvent`s.
#[must_use]
pub fn channel() -> broadcast::Sender<ModemEvent> {
    let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}
