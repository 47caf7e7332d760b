//! Cold-boot initialization, network watchdog, and brownout detector.
//!
//! These three loops are the process-supervisor half of the driver: the
//! engine only ever does what it's told, one job at a time. Deciding *when*
//! to probe liveness, *when* to recheck registration, and *when* a string of
//! failures warrants a soft reset lives here — grounded on the teacher's
//! `spawn_lte_poller`/GPS poller shape (first tick immediate, state behind a
//! shared handle, failures logged via `tracing` without aborting the loop)
//! and its `supervisor.rs` restart-with-backoff module for the general shape
//! of "something watches, something restarts."

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ModemConfig, SupervisorConfig};
use crate::engine::EngineHandle;
use crate::error::{EngineError, PinState};
use crate::events::ModemEvent;
use crate::job::{HandlerKind, JobOutcome, JobSpec, ESC, RESET_SETTLE};
use crate::state::ModemState;

/// Initialization retries before giving up and surfacing the failure.
const MAX_INIT_RETRIES: u32 = 3;

/// Runs the cold-boot sequence (spec.md §4.5), the brownout detector and
/// network monitor (§4.6), and the reset policy (§4.4, §7) shared by both.
#[derive(Clone)]
pub struct Supervisor {
    engine: EngineHandle,
    state: ModemState,
    events: tokio::sync::broadcast::Sender<ModemEvent>,
    modem_config: ModemConfig,
    supervisor_config: SupervisorConfig,
}

impl Supervisor {
    #[must_use]
    pub fn new(
        engine: EngineHandle,
        state: ModemState,
        events: tokio::sync::broadcast::Sender<ModemEvent>,
        modem_config: ModemConfig,
        supervisor_config: SupervisorConfig,
    ) -> Self {
        Self {
            engine,
            state,
            events,
            modem_config,
            supervisor_config,
        }
    }

    /// Run the cold-boot sequence once. On a recoverable failure, retries up
    /// to [`MAX_INIT_RETRIES`] times via [`Self::reset`], re-entering this
    /// same sequence afterward — the engine explicitly tolerates a handler
    /// (or, here, the supervisor) calling back into `exec` while already
    /// inside a completion callback (spec.md §4.2's concurrency guard).
    pub async fn initialize(&self) -> Result<(), EngineError> {
        loop {
            match self.run_init_sequence().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let attempt = self.state.record_init_retry().await;
                    warn!("supervisor: init sequence failed ({e}), attempt {attempt}");
                    if attempt >= MAX_INIT_RETRIES {
                        error!("supervisor: init sequence gave up after {attempt} attempts");
                        let _ = self.events.send(ModemEvent::Error(e.to_string()));
                        return Err(e);
                    }
                    self.reset(false).await?;
                }
            }
        }
    }

    async fn run_init_sequence(&self) -> Result<(), EngineError> {
        // 1. check-modem — fatal on failure.
        match self.engine.exec(JobSpec::new(b"AT".to_vec(), HandlerKind::CheckModem)).await {
            Ok(JobOutcome::ModemReady(ready)) => {
                let _ = self.events.send(ModemEvent::ModemReady(ready));
            }
            Ok(_) => unreachable!("check-modem only yields ModemReady"),
            Err(e) => {
                let _ = self.events.send(ModemEvent::ModemReady(false));
                return Err(e);
            }
        }

        // 2. AT+CMEE=2 — verbose error codes, default handler.
        self.engine
            .exec(JobSpec::new(b"AT+CMEE=2".to_vec(), HandlerKind::Default))
            .await?;

        // 3. check-pin, optionally followed by exactly one pin-unlock attempt.
        match self.engine.exec(JobSpec::new(b"AT+CPIN?".to_vec(), HandlerKind::CheckPin)).await {
            Ok(JobOutcome::PinReady) => {
                self.state.set_sim_unlocked(true).await;
            }
            Err(EngineError::PinRequired(PinState::NeedPin)) if self.modem_config.pin.is_some() => {
                let pin = self.modem_config.pin.as_ref().expect("checked above");
                let command = format!("AT+CPIN={pin}").into_bytes();
                match self.engine.exec(JobSpec::new(command, HandlerKind::PinUnlock)).await {
                    Ok(JobOutcome::PinReady) => self.state.set_sim_unlocked(true).await,
                    Ok(_) => unreachable!("pin-unlock only yields PinReady"),
                    Err(e) => return Err(e),
                }
            }
            Ok(_) => unreachable!("check-pin only yields PinReady"),
            Err(e) => return Err(e),
        }

        // 4. Custom CNMI — failure reported but not fatal.
        let cnmi_command = format!("AT+CNMI={}", self.modem_config.custom_cnmi).into_bytes();
        if let Err(e) = self.engine.exec(JobSpec::new(cnmi_command, HandlerKind::Default)).await {
            warn!("supervisor: AT+CNMI configuration failed (non-fatal): {e}");
            let _ = self.events.send(ModemEvent::Error(e.to_string()));
        }

        // 5. PDU mode.
        self.engine
            .exec(JobSpec::new(b"AT+CMGF=0".to_vec(), HandlerKind::Default))
            .await?;

        // 6. Done.
        self.state.mark_initialized().await;
        let _ = self.events.send(ModemEvent::Initialized);

        let check = self.engine.exec(JobSpec::new(b"AT+CREG?".to_vec(), HandlerKind::CheckNetwork)).await;
        if let Ok(JobOutcome::Network(status)) = check {
            let _ = self.events.send(ModemEvent::Network(status));
            let _ = self.events.send(ModemEvent::NetworkStatusEvent(status));
            self.state.observe_network_status(status.network_status).await;
        }

        Ok(())
    }

    /// `AT+CFUN=<mode>` (default `1,1`): abort any pending `>` prompt first,
    /// then let the reset handler settle for [`RESET_SETTLE`] before
    /// declaring the modem reset. Bumps `resetNumber`; beyond
    /// `supervisor_config.max_resets` the condition is fatal.
    pub async fn reset(&self, reinitialize: bool) -> Result<(), EngineError> {
        self.engine.cancel_all().await;

        let abort_input = JobSpec::new(vec![b'\r', ESC], HandlerKind::AbortInput).immediate();
        let reset_job = JobSpec::new(b"AT+CFUN=1,1".to_vec(), HandlerKind::Reset)
            .immediate()
            .with_timeout(RESET_SETTLE);

        let results = self.engine.exec_batch(vec![abort_input, reset_job]).await;
        if let Some(Err(e)) = results.into_iter().last() {
            warn!("supervisor: reset sequence did not settle cleanly: {e}");
        }

        self.engine.cancel_all().await;
        let reset_number = self.state.apply_reset().await;
        info!("supervisor: reset complete (resetNumber={reset_number})");

        if reset_number > self.supervisor_config.max_resets {
            let msg = format!("exceeded {} resets, no further self-healing", self.supervisor_config.max_resets);
            error!("supervisor: {msg}");
            return Err(EngineError::Fatal(msg));
        }

        if reinitialize {
            self.initialize().await?;
        }
        Ok(())
    }

    /// Brownout detector: probes liveness every `brownout_interval_secs`.
    /// `brownoutNumber` counts consecutive failures (including "not yet
    /// initialized"); past `brownout_threshold` it triggers a reset with
    /// reinitialization.
    #[must_use]
    pub fn spawn_brownout_detector(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        let interval = Duration::from_secs(self.supervisor_config.brownout_interval_secs);
        let threshold = self.supervisor_config.brownout_threshold;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;

                let probe_ok = supervisor.state.is_initialized().await
                    && matches!(
                        supervisor
                            .engine
                            .exec(JobSpec::new(b"AT".to_vec(), HandlerKind::CheckModem))
                            .await,
                        Ok(JobOutcome::ModemReady(true))
                    );

                let _ = supervisor.events.send(ModemEvent::ModemReady(probe_ok));

                if probe_ok {
                    supervisor.state.record_brownout_success().await;
                    continue;
                }

                let _ = supervisor.events.send(ModemEvent::Brownout);
                let failures = supervisor.state.record_brownout_failure().await;
                debug!("supervisor: brownout probe failed ({failures}/{threshold})");
                if failures > threshold {
                    warn!("supervisor: brownout threshold exceeded, resetting");
                    if let Err(e) = supervisor.reset(true).await {
                        error!("supervisor: reset after brownout failed: {e}");
                        if matches!(e, EngineError::Fatal(_)) {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Network monitor: installed lazily on the first `network` event, then
    /// polls `AT+CREG?` every `network_interval_secs` while `initialized`.
    /// `networkRetry` counts consecutive non-registered readings; past
    /// `network_retry_threshold` it triggers a reset with reinitialization.
    #[must_use]
    pub fn spawn_network_monitor(&self) -> JoinHandle<()> {
        let supervisor = self.clone();
        let interval = Duration::from_secs(self.supervisor_config.network_interval_secs);
        let threshold = self.supervisor_config.network_retry_threshold;
        let mut events_rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match events_rx.recv().await {
                    Ok(ModemEvent::Network(status)) => {
                        supervisor.state.observe_network_status(status.network_status).await;
                        break;
                    }
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }

            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !supervisor.state.is_initialized().await {
                    continue;
                }

                let outcome = supervisor
                    .engine
                    .exec(JobSpec::new(b"AT+CREG?".to_vec(), HandlerKind::CheckNetwork))
                    .await;

                let Ok(JobOutcome::Network(status)) = outcome else {
                    continue;
                };
                let _ = supervisor.events.send(ModemEvent::Network(status));
                let _ = supervisor.events.send(ModemEvent::NetworkStatusEvent(status));
                supervisor.state.observe_network_status(status.network_status).await;

                let retries = supervisor.state.network_retry().await;
                if retries > threshold {
                    warn!("supervisor: network retry threshold exceeded, resetting");
                    if let Err(e) = supervisor.reset(true).await {
                        error!("supervisor: reset after network loss failed: {e}");
                        if matches!(e, EngineError::Fatal(_)) {
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport;

    struct TestIo {
        write_rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
        inbound_tx: tokio::sync::mpsc::Sender<Vec<u8>>,
    }

    fn make_supervisor() -> (Supervisor, TestIo) {
        let harness = transport::test_pair();
        let events = crate::events::channel();
        let (handle, _join) =
            crate::engine::start(harness.transport, harness.inbound_rx, events.clone());
        let state = ModemState::new();
        let supervisor = Supervisor::new(
            handle,
            state,
            events,
            ModemConfig::default(),
            SupervisorConfig::default(),
        );
        (
            supervisor,
            TestIo {
                write_rx: harness.write_rx,
                inbound_tx: harness.inbound_tx,
            },
        )
    }

    #[tokio::test]
    async fn cold_boot_without_pin_succeeds() {
        let (supervisor, mut io) = make_supervisor();

        let init = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.initialize().await }
        });

        // AT -> OK
        assert_eq!(io.write_rx.recv().await.unwrap(), b"AT\r");
        io.inbound_tx.send(b"\r\nOK\r\n".to_vec()).await.unwrap();
        // AT+CMEE=2 -> OK
        assert_eq!(io.write_rx.recv().await.unwrap(), b"AT+CMEE=2\r");
        io.inbound_tx.send(b"\r\nOK\r\n".to_vec()).await.unwrap();
        // AT+CPIN? -> READY
        assert_eq!(io.write_rx.recv().await.unwrap(), b"AT+CPIN?\r");
        io.inbound_tx
            .send(b"\r\n+CPIN: READY\r\n\r\nOK\r\n".to_vec())
            .await
            .unwrap();
        // AT+CNMI=... -> OK
        let cnmi = io.write_rx.recv().await.unwrap();
        assert!(String::from_utf8_lossy(&cnmi).starts_with("AT+CNMI="));
        io.inbound_tx.send(b"\r\nOK\r\n".to_vec()).await.unwrap();
        // AT+CMGF=0 -> OK
        assert_eq!(io.write_rx.recv().await.unwrap(), b"AT+CMGF=0\r");
        io.inbound_tx.send(b"\r\nOK\r\n".to_vec()).await.unwrap();
        // AT+CREG? -> 0,1
        assert_eq!(io.write_rx.recv().await.unwrap(), b"AT+CREG?\r");
        io.inbound_tx
            .send(b"\r\n+CREG: 0,1\r\n\r\nOK\r\n".to_vec())
            .await
            .unwrap();

        init.await.unwrap().unwrap();
        assert!(supervisor.state.is_initialized().await);
        assert!(supervisor.state.is_network_ready().await);
    }
}
