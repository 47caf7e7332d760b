//! Command engine.
//!
//! Owns the job queue and is the single writer of the serial port. Runs as
//! one task so every queue mutation, write, and timeout decision happens on
//! one select loop — no locks needed around the queue itself, only around
//! the bytes that cross its boundary (submissions in, events out).
//!
//! The active/pending split below is what makes "immediate" insertion (used
//! by the reset sequence) never preempt an already-written command: an
//! immediate job jumps to the front of `pending`, not in front of `active`.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;
use tracing::{trace, warn};

use crate::error::EngineError;
use crate::events::{DeliveryReport, ModemEvent, NetworkStatus};
use crate::job::{HandlerKind, HandlerOutcome, Job, JobOutcome, JobSpec};
use crate::parser;
use crate::transport::Transport;

/// How long unsolicited data may sit unrecognized before it's surfaced as an
/// [`ModemEvent::Incoming`] and dropped. Not specified as a fixed constant
/// upstream; chosen to comfortably exceed one modem response latency without
/// holding URCs for multiple seconds.
const INCOMING_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Submission channel capacity; the queue itself is unbounded (a `VecDeque`),
/// this only bounds how many `exec` calls can be in flight to the engine task
/// before a caller's `send` would wait.
const SUBMIT_CHANNEL_CAPACITY: usize = 64;

/// Message sent from an [`EngineHandle`] to the engine task.
enum EngineMessage {
    Submit(Job),
    /// Fail every active and pending job with [`EngineError::Cancelled`] and
    /// empty the queue. Sent ahead of a reset so no caller waits on a command
    /// that will never run against the post-reset modem state.
    CancelAll,
}

/// Cloneable front for submitting jobs and subscribing to events. The actual
/// queue lives on the engine task; this is just a channel handle.
#[derive(Clone)]
pub struct EngineHandle {
    submit_tx: mpsc::Sender<EngineMessage>,
    events: broadcast::Sender<ModemEvent>,
    busy: Arc<AtomicBool>,
}

impl EngineHandle {
    /// Enqueue a job and await its outcome.
    pub async fn exec(&self, spec: JobSpec) -> Result<JobOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job::from_spec(spec, reply_tx);
        self.submit_tx
            .send(EngineMessage::Submit(job))
            .await
            .map_err(|_| EngineError::Cancelled)?;
        reply_rx.await.unwrap_or(Err(EngineError::Cancelled))
    }

    /// Submit several jobs as one atomic burst, preserving submission order
    /// among them. Used by the reset sequence, which must have the
    /// abort-input write land ahead of the `AT+CFUN=` reset command even
    /// though both are immediate inserts.
    pub async fn exec_batch(
        &self,
        specs: Vec<JobSpec>,
    ) -> Vec<Result<JobOutcome, EngineError>> {
        let mut receivers = Vec::with_capacity(specs.len());
        for spec in specs {
            let (reply_tx, reply_rx) = oneshot::channel();
            let job = Job::from_spec(spec, reply_tx);
            if self.submit_tx.send(EngineMessage::Submit(job)).await.is_err() {
                receivers.push(None);
            } else {
                receivers.push(Some(reply_rx));
            }
        }
        let mut results = Vec::with_capacity(receivers.len());
        for rx in receivers {
            results.push(match rx {
                Some(rx) => rx.await.unwrap_or(Err(EngineError::Cancelled)),
                None => Err(EngineError::Cancelled),
            });
        }
        results
    }

    /// Cancel every queued and active job. Used by the reset sequence.
    pub async fn cancel_all(&self) {
        let _ = self.submit_tx.send(EngineMessage::CancelAll).await;
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ModemEvent> {
        self.events.subscribe()
    }

    /// True while a handler's dispatch call is executing. Exposed for tests
    /// exercising the concurrency model described upstream, not needed by
    /// production callers.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }
}

struct ActiveJob {
    job: Job,
    buffer: Vec<u8>,
    deadline: TokioInstant,
    sneaky_cds_emitted: Option<(u8, String)>,
}

struct EngineLoop {
    transport: Transport,
    inbound_rx: mpsc::Receiver<Vec<u8>>,
    submit_rx: mpsc::Receiver<EngineMessage>,
    events: broadcast::Sender<ModemEvent>,
    busy: Arc<AtomicBool>,
    active: Option<ActiveJob>,
    pending: VecDeque<Job>,
    idle_buffer: Vec<u8>,
    idle_deadline: Option<TokioInstant>,
}

/// Starts the engine task and returns a handle to it. The caller owns the
/// [`JoinHandle`] only to observe task exit; normal operation never needs it.
#[must_use]
pub fn start(
    transport: Transport,
    inbound_rx: mpsc::Receiver<Vec<u8>>,
    events: broadcast::Sender<ModemEvent>,
) -> (EngineHandle, JoinHandle<()>) {
    let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_CHANNEL_CAPACITY);
    let busy = Arc::new(AtomicBool::new(false));

    let mut engine_loop = EngineLoop {
        transport,
        inbound_rx,
        submit_rx,
        events: events.clone(),
        busy: busy.clone(),
        active: None,
        pending: VecDeque::new(),
        idle_buffer: Vec::new(),
        idle_deadline: None,
    };

    let join = tokio::spawn(async move { engine_loop.run().await });

    (
        EngineHandle {
            submit_tx,
            events,
            busy,
        },
        join,
    )
}

impl EngineLoop {
    async fn run(&mut self) {
        loop {
            let timeout_deadline = self
                .active
                .as_ref()
                .map(|a| a.deadline)
                .or(self.idle_deadline);
            let has_deadline = timeout_deadline.is_some();
            let deadline = timeout_deadline.unwrap_or_else(|| {
                TokioInstant::now() + std::time::Duration::from_secs(86_400)
            });
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            tokio::select! {
                maybe_msg = self.submit_rx.recv() => {
                    match maybe_msg {
                        Some(EngineMessage::Submit(job)) => self.on_submit(job).await,
                        Some(EngineMessage::CancelAll) => self.cancel_all().await,
                        None => break,
                    }
                }
                maybe_bytes = self.inbound_rx.recv() => {
                    match maybe_bytes {
                        Some(bytes) => self.on_bytes(bytes).await,
                        None => {
                            warn!("engine: transport closed");
                            break;
                        }
                    }
                }
                () = &mut sleep, if has_deadline => {
                    self.on_timeout().await;
                }
            }
        }
    }

    async fn on_submit(&mut self, job: Job) {
        if job.immediate {
            self.pending.push_front(job);
        } else {
            self.pending.push_back(job);
        }
        self.advance_if_idle().await;
    }

    /// If no job is active, pop the next pending job and write its command.
    async fn advance_if_idle(&mut self) {
        if self.active.is_some() {
            return;
        }
        let Some(job) = self.pending.pop_front() else {
            return;
        };

        let deadline = TokioInstant::now() + job.timeout;
        let is_timer_driven = job.handler.is_timer_driven();
        let completes_on_write = job.handler.completes_on_write();

        let bytes = command_bytes(&job.command);
        if let Err(e) = self.transport.write(bytes).await {
            warn!("engine: write failed: {e}");
        }

        if completes_on_write {
            self.complete(job, Ok(JobOutcome::Written)).await;
            return;
        }

        self.active = Some(ActiveJob {
            job,
            buffer: Vec::new(),
            deadline,
            sneaky_cds_emitted: None,
        });

        if is_timer_driven {
            trace!("engine: reset settling, no response expected");
        }
    }

    async fn on_bytes(&mut self, bytes: Vec<u8>) {
        let Some(mut active) = self.active.take() else {
            self.on_idle_bytes(bytes).await;
            return;
        };

        active.buffer.extend_from_slice(&bytes);
        self.check_sneaky_delivery_report(&mut active).await;

        let outcome = {
            let handler = &mut active.job.handler;
            let buffer = &active.buffer;
            catch_unwind(AssertUnwindSafe(|| handlers_dispatch(handler, buffer)))
                .unwrap_or_else(|_| {
                    warn!("engine: handler panicked, failing job");
                    HandlerOutcome::Done(Err(EngineError::Generic(
                        "handler panicked".to_string(),
                    )))
                })
        };

        match outcome {
            HandlerOutcome::Pending => {
                self.active = Some(active);
            }
            HandlerOutcome::Write(bytes) => {
                if let Err(e) = self.transport.write(bytes).await {
                    warn!("engine: write failed: {e}");
                }
                self.active = Some(active);
            }
            HandlerOutcome::Done(result) => {
                self.complete(active.job, result).await;
            }
        }
    }

    /// Unsolicited data routing: no job owns the port, so look for the
    /// network-ready banner, `+CMTI:`, `+CDS:`, and bare `+CREG:` ourselves.
    async fn on_idle_bytes(&mut self, bytes: Vec<u8>) {
        self.idle_buffer.extend_from_slice(&bytes);
        let parsed = parser::split_lines(&self.idle_buffer);

        if parser::is_network_ready_banner(&parsed) {
            // "Call Ready"/"SMS Ready" is a registration banner, not a
            // lifecycle event — `Initialized` is reserved for the end of the
            // cold-boot sequence (spec.md §4.4/§4.5). Emitting `Network` here
            // both reports the registered status and, via the broadcast
            // channel, lazily arms the network monitor the same as a CREG
            // poll would.
            let _ = self.events.send(ModemEvent::Network(NetworkStatus {
                network_action: 0,
                network_status: 1,
            }));
            self.idle_buffer.clear();
            self.idle_deadline = None;
            return;
        }

        if parser::has_cmti(&parsed) {
            let _ = self.events.send(ModemEvent::Incoming(parsed));
            self.idle_buffer.clear();
            self.idle_deadline = None;
            return;
        }

        if let Some((short_id, data)) = parser::find_delivery_report(&self.idle_buffer, &parsed) {
            let _ = self
                .events
                .send(ModemEvent::DeliveryReport(DeliveryReport { short_id, data }));
            self.idle_buffer.clear();
            self.idle_deadline = None;
            return;
        }

        if parser::has_creg(&parsed) {
            if let Some((action, status)) = parser::find_creg_status(&parsed) {
                let _ = self.events.send(ModemEvent::Network(NetworkStatus {
                    network_action: action,
                    network_status: status,
                }));
            }
            self.idle_buffer.clear();
            self.idle_deadline = None;
            return;
        }

        self.idle_deadline = Some(TokioInstant::now() + INCOMING_IDLE_TIMEOUT);
    }

    /// A delivery report can legitimately arrive interleaved with the
    /// response to an unrelated outstanding command; scan for it on every
    /// byte arrival without disturbing the active handler's own parsing.
    async fn check_sneaky_delivery_report(&mut self, active: &mut ActiveJob) {
        let parsed = parser::split_lines(&active.buffer);
        if let Some(found) = parser::find_delivery_report(&active.buffer, &parsed) {
            if active.sneaky_cds_emitted.as_ref() != Some(&found) {
                let (short_id, data) = found.clone();
                let _ = self
                    .events
                    .send(ModemEvent::DeliveryReport(DeliveryReport { short_id, data }));
                active.sneaky_cds_emitted = Some(found);
            }
        }
    }

    async fn on_timeout(&mut self) {
        if let Some(active) = self.active.take() {
            if active.job.handler.is_timer_driven() {
                self.complete(active.job, Ok(JobOutcome::ResetDone)).await;
                return;
            }
            let lines = parser::split_lines(&active.buffer);
            let _ = self
                .events
                .send(ModemEvent::Timeout(active.job.command_string()));
            self.complete(active.job, Err(EngineError::Unhandled(lines)))
                .await;
            return;
        }

        if self.idle_deadline.take().is_some() && !self.idle_buffer.is_empty() {
            let lines = parser::split_lines(&self.idle_buffer);
            let _ = self.events.send(ModemEvent::Incoming(lines));
            self.idle_buffer.clear();
        }
    }

    async fn complete(&mut self, job: Job, result: Result<JobOutcome, EngineError>) {
        self.busy.store(true, Ordering::Relaxed);
        let _ = job.reply.send(result);
        self.active = None;
        self.busy.store(false, Ordering::Relaxed);
        self.advance_if_idle().await;
    }

    /// Clears the queue on a fatal reset, failing every pending and active
    /// caller with `Cancelled` so nobody waits forever on a job that will
    /// never run against the post-reset modem state.
    async fn cancel_all(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.job.reply.send(Err(EngineError::Cancelled));
        }
        while let Some(job) = self.pending.pop_front() {
            let _ = job.reply.send(Err(EngineError::Cancelled));
        }
        self.idle_buffer.clear();
        self.idle_deadline = None;
    }
}

fn command_bytes(command: &[u8]) -> Vec<u8> {
    let mut bytes = command.to_vec();
    match command.last() {
        Some(&crate::job::SUB) | Some(&crate::job::ESC) => {}
        _ => bytes.push(b'\r'),
    }
    bytes
}

fn handlers_dispatch(handler: &mut HandlerKind, buffer: &[u8]) -> HandlerOutcome {
    crate::handlers::dispatch(handler, buffer)
}

impl Job {
    fn command_string(&self) -> String {
        String::from_utf8_lossy(&self.command).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport;

    fn start_test_engine() -> (EngineHandle, mpsc::Receiver<Vec<u8>>, mpsc::Sender<Vec<u8>>) {
        let harness = transport::test_pair();
        let (events_tx, _) = broadcast::channel(16);
        let (handle, _join) = start(harness.transport, harness.inbound_rx, events_tx);
        (handle, harness.write_rx, harness.inbound_tx)
    }

    #[tokio::test]
    async fn writes_command_with_trailing_cr() {
        let (handle, mut write_rx, inbound_tx) = start_test_engine();
        let exec = tokio::spawn(async move {
            handle
                .exec(JobSpec::new(b"AT".to_vec(), HandlerKind::CheckModem))
                .await
        });

        let written = write_rx.recv().await.unwrap();
        assert_eq!(written, b"AT\r");
        inbound_tx.send(b"\r\nOK\r\n".to_vec()).await.unwrap();

        let outcome = exec.await.unwrap();
        assert!(matches!(outcome, Ok(JobOutcome::ModemReady(true))));
    }

    #[tokio::test]
    async fn immediate_job_does_not_preempt_active_write() {
        let (handle, mut write_rx, inbound_tx) = start_test_engine();
        let handle2 = handle.clone();

        let first = tokio::spawn(async move {
            handle
                .exec(JobSpec::new(b"AT".to_vec(), HandlerKind::CheckModem))
                .await
        });
        let _ = write_rx.recv().await.unwrap();

        let second = tokio::spawn(async move {
            handle2
                .exec(JobSpec::new(b"AT+CFUN=1,1".to_vec(), HandlerKind::Reset).immediate())
                .await
        });

        inbound_tx.send(b"\r\nOK\r\n".to_vec()).await.unwrap();
        let first_outcome = first.await.unwrap();
        assert!(matches!(first_outcome, Ok(JobOutcome::ModemReady(true))));

        let reset_write = write_rx.recv().await.unwrap();
        assert_eq!(reset_write, b"AT+CFUN=1,1\r");
        drop(second);
    }

    #[tokio::test]
    async fn timeout_fails_job_with_unhandled_buffer() {
        let (handle, mut write_rx, _inbound_tx) = start_test_engine();
        let exec = tokio::spawn(async move {
            handle
                .exec(
                    JobSpec::new(b"AT".to_vec(), HandlerKind::CheckModem)
                        .with_timeout(std::time::Duration::from_millis(20)),
                )
                .await
        });
        let _ = write_rx.recv().await.unwrap();

        let outcome = exec.await.unwrap();
        assert!(matches!(outcome, Err(EngineError::Unhandled(_))));
    }

    #[tokio::test]
    async fn cancel_all_fails_pending_caller() {
        let (handle, mut write_rx, _inbound_tx) = start_test_engine();
        let handle2 = handle.clone();
        let handle3 = handle.clone();

        let first = tokio::spawn(async move {
            handle
                .exec(JobSpec::new(b"AT".to_vec(), HandlerKind::CheckModem))
                .await
        });
        let _ = write_rx.recv().await.unwrap();

        let second = tokio::spawn(async move {
            handle2
                .exec(JobSpec::new(b"AT+CPIN?".to_vec(), HandlerKind::CheckPin))
                .await
        });
        // Give the spawned task a chance to reach the engine's submit channel
        // before cancelling, so it lands in `pending` rather than after.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        handle3.cancel_all().await;
        assert!(matches!(first.await.unwrap(), Err(EngineError::Cancelled)));
        assert!(matches!(second.await.unwrap(), Err(EngineError::Cancelled)));
    }
}
