//! SMS coordinator.
//!
//! Owns the outbound queue, the 500ms spooler that inspects only the outbox
//! head each tick — sending it (all parts at once) the first time it's idle,
//! moving it to the completed table once terminal, otherwise rotating it to
//! the tail so a slow multipart send can't starve newer messages — and
//! delivery report correlation by short reference. An SMS stays reachable by
//! id in the completed table for the rest of the process's life, since a
//! `+CDS` report normally lags the send by seconds, well after the outbox
//! has moved on. The poller shape (first tick fires on the
//! first loop iteration, then every `SPOOL_INTERVAL`) is generalized from the
//! teacher's `spawn_lte_poller` / GPS poller tasks. Multipart framing
//! (`SmsId`, per-part sequence/total) follows the shape of
//! `morgverd-sms-types`' `SmsMultipartHeader`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::EngineHandle;
use crate::events::{DeliveryReport, ModemEvent};
use crate::job::{HandlerKind, JobOutcome, JobSpec, SMS_SEND_TIMEOUT, SUB};
use crate::pdu::{PduCodec, PduRequest};
use crate::state::ModemState;

const SPOOL_INTERVAL: Duration = Duration::from_millis(500);

/// What [`SmsCoordinator::spool_once`] decided to do with the outbox head.
enum SpoolAction {
    Send(SmsId, Vec<(String, String, usize)>),
    None,
}

/// Identifies an outbound SMS for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmsId(u64);

/// Status of a single PDU part. An SMS's own status is derived from its
/// parts', not tracked independently — see [`Sms::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsPartStatus {
    Idle,
    Sending,
    Sent,
    Delivered,
    Error,
}

/// Reuses the part status space: an SMS's aggregate status is always one of
/// the same five values.
pub type SmsStatus = SmsPartStatus;

/// One PDU-sized chunk of an outbound SMS.
#[derive(Debug, Clone)]
pub struct SmsPart {
    pub part_id: String,
    pub sequence: u8,
    pub total: u8,
    pub tpdu_length: usize,
    pub smsc_tpdu: String,
    pub status: SmsPartStatus,
    pub short_reference: Option<u8>,
    pub error: Option<String>,
}

/// An outbound SMS, possibly spanning multiple PDU parts.
#[derive(Debug, Clone)]
pub struct Sms {
    pub id: SmsId,
    pub destination: String,
    pub text: String,
    pub parts: Vec<SmsPart>,
    /// Set at creation; cleared by the spooler the first time it sends this
    /// SMS. Distinguishes "never attempted" from "sent, awaiting status" —
    /// both have an `IDLE`-or-later aggregate, but only the former should
    /// trigger a send.
    send_flag: bool,
}

impl Sms {
    /// If the last part isn't idle, its status is the aggregate; otherwise
    /// the first part's status is used. This surfaces terminal states (the
    /// last part finishing) quickly while still reflecting early progress
    /// before any part has completed.
    #[must_use]
    pub fn status(&self) -> SmsStatus {
        match self.parts.last() {
            Some(last) if last.status != SmsPartStatus::Idle => last.status,
            _ => self
                .parts
                .first()
                .map_or(SmsPartStatus::Idle, |p| p.status),
        }
    }
}

fn describe_status(status: u8) -> String {
    match status {
        0x00 => "delivered".to_string(),
        0x41 => "incompatible destination".to_string(),
        0x43 => "destination not available".to_string(),
        0x50 => "recipient not registered".to_string(),
        0x60 => "message store full".to_string(),
        0x61 => "recipient busy".to_string(),
        0x62 => "recipient not answering".to_string(),
        0x72 => "line suspended".to_string(),
        other => format!("0x{other:02x}"),
    }
}

struct Inner {
    outbox: VecDeque<Sms>,
    /// Terminal SMS (aggregate `SENT` or `DELIVERED`), moved here off the
    /// outbox so the spooler stops looking at them while a `+CDS` delivery
    /// report — which normally lags the send by seconds — can still find
    /// and update them. `createSms` effectively registers the SMS for
    /// delivery-report events for the rest of the process's life, not just
    /// for as long as it sits at the outbox head.
    completed: HashMap<SmsId, Sms>,
    /// Short reference (`+CMGS:`/`+CDS:`) → (sms, part index), so a later
    /// delivery report can be routed back to the part that earned it.
    pending: HashMap<u8, (SmsId, usize)>,
    next_id: u64,
}

impl Inner {
    /// Look up an SMS by id wherever it currently lives: still queued, or
    /// already moved to `completed` once its aggregate went terminal.
    fn find_sms_mut(&mut self, sms_id: SmsId) -> Option<&mut Sms> {
        if let Some(sms) = self.outbox.iter_mut().find(|s| s.id == sms_id) {
            return Some(sms);
        }
        self.completed.get_mut(&sms_id)
    }
}

/// Cloneable handle to the SMS coordinator; all clones share the same
/// outbox and pending-reference table.
#[derive(Clone)]
pub struct SmsCoordinator {
    inner: Arc<Mutex<Inner>>,
    engine: EngineHandle,
    state: ModemState,
    events: broadcast::Sender<ModemEvent>,
    codec: Arc<dyn PduCodec>,
    smsc: Option<String>,
    request_delivery_report: bool,
}

impl SmsCoordinator {
    #[must_use]
    pub fn new(
        engine: EngineHandle,
        state: ModemState,
        events: broadcast::Sender<ModemEvent>,
        codec: Arc<dyn PduCodec>,
        smsc: Option<String>,
        request_delivery_report: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                outbox: VecDeque::new(),
                completed: HashMap::new(),
                pending: HashMap::new(),
                next_id: 0,
            })),
            engine,
            state,
            events,
            codec,
            smsc,
            request_delivery_report,
        }
    }

    /// Split the message into PDU parts and queue it for the spooler. Returns
    /// immediately; the spooler sends all parts together once this SMS
    /// reaches the outbox head.
    pub async fn create_sms(&self, destination: impl Into<String>, text: impl Into<String>) -> SmsId {
        let destination = destination.into();
        let text = text.into();

        let pdu_parts = self.codec.generate(PduRequest {
            smsc: self.smsc.as_deref(),
            receiver: &destination,
            request_status: self.request_delivery_report,
            text: &text,
        });
        let total = pdu_parts.len() as u8;

        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = SmsId(inner.next_id);

        let parts = pdu_parts
            .into_iter()
            .enumerate()
            .map(|(i, p)| SmsPart {
                part_id: format!("{}-{}", id.0, i),
                sequence: i as u8 + 1,
                total,
                tpdu_length: p.tpdu_length,
                smsc_tpdu: p.smsc_tpdu,
                status: SmsPartStatus::Idle,
                short_reference: None,
                error: None,
            })
            .collect();

        inner.outbox.push_back(Sms {
            id,
            destination,
            text,
            parts,
            send_flag: true,
        });
        debug!(sms_id = id.0, parts = total, "sms queued");
        id
    }

    /// Spawn the spooler and the delivery-report listener as one background
    /// task. Mirrors the teacher's poller tasks: the first tick runs
    /// immediately on loop entry, then every [`SPOOL_INTERVAL`].
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        let mut events_rx = self.events.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SPOOL_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.spool_once().await,
                    event = events_rx.recv() => match event {
                        Ok(ModemEvent::DeliveryReport(report)) => self.handle_delivery_report(report).await,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("sms coordinator missed {n} events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// Inspect only the outbox head, per spec.md §4.7: send it (all parts at
    /// once) if idle and never attempted, drop it once it reaches a terminal
    /// state (`SENT` or `DELIVERED`), otherwise rotate it to the tail so a
    /// slow multipart send doesn't block newer messages from being seen.
    async fn spool_once(&self) {
        if !self.state.is_initialized().await || !self.state.is_network_ready().await {
            return;
        }

        let action = {
            let mut inner = self.inner.lock().await;
            let Some(sms) = inner.outbox.front_mut() else {
                return;
            };
            match sms.status() {
                SmsStatus::Idle if sms.send_flag => {
                    sms.send_flag = false;
                    let sms_id = sms.id;
                    let parts: Vec<(String, String, usize)> = sms
                        .parts
                        .iter()
                        .map(|p| (p.part_id.clone(), p.smsc_tpdu.clone(), p.tpdu_length))
                        .collect();
                    for part in &mut sms.parts {
                        part.status = SmsPartStatus::Sending;
                    }
                    SpoolAction::Send(sms_id, parts)
                }
                // Terminal (sent or delivered): move it off the outbox so the
                // spooler stops looking at it, but keep it in `completed` —
                // a delivery report can still arrive and needs to find it.
                // The "SENT or DELIVERED" check here is the intended
                // disjunction rather than the upstream expression that
                // evaluated truthy regardless of the right-hand side (spec.md
                // §9).
                status if matches!(status, SmsStatus::Sent | SmsStatus::Delivered) => {
                    if let Some(sms) = inner.outbox.pop_front() {
                        inner.completed.insert(sms.id, sms);
                    }
                    SpoolAction::None
                }
                _ => {
                    if let Some(sms) = inner.outbox.pop_front() {
                        inner.outbox.push_back(sms);
                    }
                    SpoolAction::None
                }
            }
        };

        if let SpoolAction::Send(sms_id, parts) = action {
            for (part_id, smsc_tpdu, tpdu_length) in parts {
                let coordinator = self.clone();
                tokio::spawn(async move {
                    coordinator.send_part(sms_id, part_id, smsc_tpdu, tpdu_length).await;
                });
            }
        }
    }

    /// Enqueue one `AT+CMGS` job for a single part and route its outcome.
    /// Spawned once per part from [`Self::spool_once`] so a multipart send
    /// doesn't hold the spooler tick hostage — the engine still serializes
    /// the actual writes via its own FIFO.
    async fn send_part(&self, sms_id: SmsId, part_id: String, smsc_tpdu: String, tpdu_length: usize) {
        let mut pdu_body = smsc_tpdu.into_bytes();
        pdu_body.push(SUB);
        let command = format!("AT+CMGS={tpdu_length}").into_bytes();
        let spec = JobSpec::new(
            command,
            HandlerKind::SmsSend {
                pdu_body,
                prompt_handled: false,
            },
        )
        .with_timeout(SMS_SEND_TIMEOUT);

        match self.engine.exec(spec).await {
            Ok(JobOutcome::SmsSent(reference)) => self.mark_sent(sms_id, &part_id, reference).await,
            Ok(_) => {}
            Err(e) => self.mark_failed(sms_id, &part_id, e.to_string()).await,
        }
    }

    async fn mark_sent(&self, sms_id: SmsId, part_id: &str, reference: u8) {
        let outcome = {
            let mut inner = self.inner.lock().await;
            let Some(sms) = inner.find_sms_mut(sms_id) else {
                return;
            };
            let Some(part_index) = sms.parts.iter().position(|p| p.part_id == part_id) else {
                return;
            };
            sms.parts[part_index].status = SmsPartStatus::Sent;
            sms.parts[part_index].short_reference = Some(reference);
            let part_status = sms.parts[part_index].status;
            let agg_status = sms.status();
            (part_status, agg_status, part_index)
        };
        let (part_status, agg_status, part_index) = outcome;
        self.inner
            .lock()
            .await
            .pending
            .insert(reference, (sms_id, part_index));

        let _ = self.events.send(ModemEvent::StatusChange {
            part_id: part_id.to_string(),
            sms_id,
            part_status,
            sms_status: agg_status,
            message: None,
        });
    }

    async fn mark_failed(&self, sms_id: SmsId, part_id: &str, error: String) {
        let outcome = {
            let mut inner = self.inner.lock().await;
            let Some(sms) = inner.find_sms_mut(sms_id) else {
                return;
            };
            let Some(part) = sms.parts.iter_mut().find(|p| p.part_id == part_id) else {
                return;
            };
            part.status = SmsPartStatus::Error;
            part.error = Some(error.clone());
            let part_status = part.status;
            (part_status, sms.status())
        };
        let (part_status, agg_status) = outcome;

        let _ = self.events.send(ModemEvent::SmsError {
            part_id: part_id.to_string(),
            sms_id,
            error,
            error_status: None,
        });
        let _ = self.events.send(ModemEvent::StatusChange {
            part_id: part_id.to_string(),
            sms_id,
            part_status,
            sms_status: agg_status,
            message: Some("send failed".to_string()),
        });
    }

    async fn handle_delivery_report(&self, report: DeliveryReport) {
        let parsed = match self.codec.parse(&report.data) {
            Ok(p) => p,
            Err(e) => {
                warn!("delivery report parse failed: {e}");
                return;
            }
        };

        let target = {
            let inner = self.inner.lock().await;
            inner.pending.get(&parsed.reference).copied()
        };
        let Some((sms_id, part_index)) = target else {
            debug!(reference = parsed.reference, "delivery report for unknown reference");
            return;
        };

        let delivered = parsed.status == 0x00;
        let outcome = {
            let mut inner = self.inner.lock().await;
            let Some(sms) = inner.find_sms_mut(sms_id) else {
                return;
            };
            let Some(part) = sms.parts.get_mut(part_index) else {
                return;
            };
            part.status = if delivered {
                SmsPartStatus::Delivered
            } else {
                SmsPartStatus::Error
            };
            if !delivered {
                part.error = Some(describe_status(parsed.status).to_string());
            }
            let part_id = part.part_id.clone();
            let part_status = part.status;
            (part_id, part_status, sms.status())
        };
        let (part_id, part_status, agg_status) = outcome;

        if delivered {
            let _ = self.events.send(ModemEvent::StatusChange {
                part_id,
                sms_id,
                part_status,
                sms_status: agg_status,
                message: None,
            });
        } else {
            let _ = self.events.send(ModemEvent::SmsError {
                part_id: part_id.clone(),
                sms_id,
                error: describe_status(parsed.status).to_string(),
                error_status: Some(parsed.status),
            });
            let _ = self.events.send(ModemEvent::StatusChange {
                part_id,
                sms_id,
                part_status,
                sms_status: agg_status,
                message: Some(describe_status(parsed.status).to_string()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(status: SmsPartStatus) -> SmsPart {
        SmsPart {
            part_id: "x".to_string(),
            sequence: 1,
            total: 1,
            tpdu_length: 10,
            smsc_tpdu: String::new(),
            status,
            short_reference: None,
            error: None,
        }
    }

    #[test]
    fn aggregate_status_all_idle() {
        let sms = Sms {
            id: SmsId(1),
            destination: "+15550001111".to_string(),
            text: String::new(),
            parts: vec![part(SmsPartStatus::Idle), part(SmsPartStatus::Idle)],
            send_flag: true,
        };
        assert_eq!(sms.status(), SmsPartStatus::Idle);
    }

    #[test]
    fn aggregate_status_follows_last_non_idle_part() {
        let sms = Sms {
            id: SmsId(1),
            destination: "+15550001111".to_string(),
            text: String::new(),
            parts: vec![part(SmsPartStatus::Delivered), part(SmsPartStatus::Sent)],
            send_flag: true,
        };
        assert_eq!(sms.status(), SmsPartStatus::Sent);
    }

    #[test]
    fn aggregate_status_falls_back_to_first_part_when_last_is_idle() {
        let sms = Sms {
            id: SmsId(1),
            destination: "+15550001111".to_string(),
            text: String::new(),
            parts: vec![part(SmsPartStatus::Error), part(SmsPartStatus::Idle)],
            send_flag: true,
        };
        assert_eq!(sms.status(), SmsPartStatus::Error);
    }

    #[test]
    fn aggregate_status_uses_first_not_middle_part() {
        // Only the last part and the first part are ever consulted — a
        // non-idle middle part must not leak into the aggregate.
        let sms = Sms {
            id: SmsId(1),
            destination: "+15550001111".to_string(),
            text: String::new(),
            parts: vec![
                part(SmsPartStatus::Idle),
                part(SmsPartStatus::Sent),
                part(SmsPartStatus::Idle),
            ],
            send_flag: true,
        };
        assert_eq!(sms.status(), SmsPartStatus::Idle);
    }

    #[test]
    fn describe_status_maps_known_codes() {
        assert_eq!(describe_status(0x00), "delivered");
        assert_eq!(describe_status(0x62), "recipient not answering");
    }

    #[test]
    fn describe_status_falls_back_to_raw_byte() {
        assert_eq!(describe_status(0xff), "0xff");
    }
}
