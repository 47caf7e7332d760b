#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]

//! sim800l — host-side AT command engine and supervisor for SIM800L-family
//! GSM modems.
//!
//! This library re-exports the building blocks:
//! - `config` — configuration loading (env > TOML file > defaults)
//! - `transport` — serial port I/O on a dedicated thread
//! - `engine` — the single-writer command queue and job dispatch loop
//! - `handlers` / `job` / `parser` — per-command handler logic and AT response parsing
//! - `pdu` — GSM 03.38/03.40 SMS-SUBMIT encoding and SMS-STATUS-REPORT parsing
//! - `sms` — outbound SMS queue, spooler, and delivery-report correlation
//! - `state` — supervisor-owned modem lifecycle state
//! - `supervisor` — cold-boot init, brownout detector, network monitor, reset policy
//! - `events` — the typed event multiplexer
//!
//! [`Sim800l::start`] wires all of the above together the way a caller
//! normally wants them: open the port, start the engine, run the cold-boot
//! sequence, then spawn the two supervisor watchdogs and the SMS spooler.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod handlers;
pub mod job;
pub mod parser;
pub mod pdu;
pub mod sms;
pub mod state;
pub mod supervisor;
pub mod transport;

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

pub use config::Config;
pub use engine::EngineHandle;
pub use error::EngineError;
pub use events::ModemEvent;
pub use pdu::{Gsm0340Codec, PduCodec};
pub use sms::{Sms, SmsCoordinator, SmsId, SmsPartStatus, SmsStatus};
pub use state::ModemState;
pub use supervisor::Supervisor;
pub use transport::{Transport, TransportError};

/// Handles to the background tasks [`Sim800l::start`] spawns, kept only so a
/// caller can `.abort()` them on shutdown. Dropping a `Sim800l` does not stop
/// them — the engine and the watchdogs are meant to outlive any one handle.
pub struct Sim800lTasks {
    pub engine: JoinHandle<()>,
    pub brownout: JoinHandle<()>,
    pub network: JoinHandle<()>,
    pub spooler: JoinHandle<()>,
}

/// The assembled driver: an engine handle, modem state, event bus, supervisor,
/// and SMS coordinator, all sharing the same transport.
#[derive(Clone)]
pub struct Sim800l {
    pub engine: EngineHandle,
    pub state: ModemState,
    pub events: broadcast::Sender<ModemEvent>,
    pub supervisor: Supervisor,
    pub sms: SmsCoordinator,
}

impl Sim800l {
    /// Open the configured serial port, start the engine, run the cold-boot
    /// initialization sequence, and spawn the brownout detector, network
    /// monitor, and SMS spooler.
    ///
    /// # Errors
    ///
    /// Returns whatever [`Supervisor::initialize`] returns on failure (the
    /// init sequence gave up after its retry budget). The transport and
    /// engine are still running at that point — a caller may retry
    /// `supervisor.initialize()` or `supervisor.reset()` directly.
    pub async fn start(config: &Config) -> Result<(Self, Sim800lTasks), StartError> {
        let (transport, inbound_rx) =
            transport::Transport::open(&config.serial.path, config.serial.baud)
                .map_err(StartError::Transport)?;

        let events = events::channel();
        let (engine, engine_task) = engine::start(transport, inbound_rx, events.clone());
        let state = ModemState::new();

        let supervisor = Supervisor::new(
            engine.clone(),
            state.clone(),
            events.clone(),
            config.modem.clone(),
            config.supervisor.clone(),
        );

        let codec: Arc<dyn PduCodec> = Arc::new(Gsm0340Codec::new());
        let sms = SmsCoordinator::new(
            engine.clone(),
            state.clone(),
            events.clone(),
            codec,
            config.modem.smsc.clone(),
            config.modem.delivery_report,
        );

        info!("sim800l: starting on {}", config.serial.path);
        supervisor.initialize().await.map_err(StartError::Init)?;

        let brownout = supervisor.spawn_brownout_detector();
        let network = supervisor.spawn_network_monitor();
        let spooler = sms.clone().spawn();

        Ok((
            Self {
                engine,
                state,
                events,
                supervisor,
                sms,
            },
            Sim800lTasks {
                engine: engine_task,
                brownout,
                network,
                spooler,
            },
        ))
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ModemEvent> {
        self.events.subscribe()
    }
}

/// Failure modes of [`Sim800l::start`].
#[derive(Debug)]
pub enum StartError {
    Transport(TransportError),
    Init(EngineError),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::Transport(e) => write!(f, "{e}"),
            StartError::Init(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for StartError {}
