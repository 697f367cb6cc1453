// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The transaction engine: a single worker that owns the transaction table
//! and drains the inbound, TU, timer and transport-failure queues.
//!
//! Every input is handled to completion by [`TransactionEngine::handle`];
//! machines that terminate during a dispatch are removed only after it
//! returns.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use sip_core::{make_response, Method, NonSipFrame, Request, Response, SipMessage, WireMessage};
use sip_transport::{
    Endpoint, InboundMessage, OutboundMessage, OutboundPayload, SendFailure, Target,
};
use smol_str::SmolStr;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fsm::{Action, Delivery};
use crate::metrics::{TransactionKind, TransactionMetrics, TransactionOutcome};
use crate::table::TransactionTable;
use crate::timers::TimerDefaults;
use crate::transaction::Transaction;
use crate::{ensure_branch, TransactionId, TransactionTimer};

/// Transaction limits for DoS protection.
///
/// Without limits, an attacker can exhaust memory by creating unlimited
/// transactions with unique branch IDs. A new server transaction over the
/// limit is answered with a stateless 503; a new client transaction over the
/// limit gets a locally generated 503 delivered to the TU.
///
/// ## Recommended Values:
/// - **Small server** (1-10 concurrent calls): 1,000 transactions
/// - **Medium server** (10-100 concurrent calls): 10,000 transactions
/// - **Large server** (100-1000 concurrent calls): 100,000 transactions
/// - **Carrier-grade** (1000+ concurrent calls): 500,000 transactions
///
/// # Examples
///
/// ```
/// use sip_transaction::TransactionLimits;
///
/// let small = TransactionLimits::small();
/// assert_eq!(small.max_server_transactions, 1_000);
///
/// let custom = TransactionLimits::new(5_000, 2_000);
/// assert_eq!(custom.max_client_transactions, 2_000);
///
/// let unlimited = TransactionLimits::unlimited();
/// assert_eq!(unlimited.max_server_transactions, usize::MAX);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionLimits {
    /// Maximum number of server transactions (incoming requests)
    pub max_server_transactions: usize,
    /// Maximum number of client transactions (outgoing requests)
    pub max_client_transactions: usize,
}

impl Default for TransactionLimits {
    fn default() -> Self {
        Self {
            max_server_transactions: 10_000,
            max_client_transactions: 10_000,
        }
    }
}

impl TransactionLimits {
    pub fn new(max_server: usize, max_client: usize) -> Self {
        Self {
            max_server_transactions: max_server,
            max_client_transactions: max_client,
        }
    }

    /// Unlimited transactions (use only for testing).
    pub fn unlimited() -> Self {
        Self::new(usize::MAX, usize::MAX)
    }

    pub fn small() -> Self {
        Self::new(1_000, 1_000)
    }

    pub fn medium() -> Self {
        Self::default()
    }

    pub fn large() -> Self {
        Self::new(100_000, 100_000)
    }

    pub fn carrier_grade() -> Self {
        Self::new(500_000, 500_000)
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub timers: TimerDefaults,
    pub limits: TransactionLimits,
    /// Drop responses that match no client transaction instead of handing
    /// them to the TU.
    pub discard_stray_responses: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timers: TimerDefaults::default(),
            limits: TransactionLimits::default(),
            discard_stray_responses: true,
        }
    }
}

/// A timer expiry pushed onto the engine's timer queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub id: TransactionId,
    pub timer: TransactionTimer,
}

/// Notifications for the transaction user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TuEvent {
    /// A new request opened a server transaction; answer with
    /// [`TuCommand::SendResponse`] using `id`.
    Request {
        id: TransactionId,
        endpoint: Endpoint,
        request: Request,
    },
    /// A response for a client transaction, including locally generated 408
    /// and 503 responses.
    Response { id: TransactionId, response: Response },
    /// An ACK outside any transaction (ACK for a 2xx), or absorbed by a
    /// server INVITE transaction in Accepted.
    Ack { endpoint: Endpoint, request: Request },
    /// A server INVITE transaction never received its ACK.
    Timeout { id: TransactionId },
    TransportError { id: TransactionId, reason: SmolStr },
    /// A response with no client transaction.
    StrayResponse { endpoint: Endpoint, response: Response },
    Stun { endpoint: Endpoint, frame: Bytes },
}

/// Requests from the transaction user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TuCommand {
    /// Opens a client transaction. A missing branch is generated.
    SendRequest { target: Target, request: Request },
    /// Passes a response to the server transaction `id`.
    SendResponse { id: TransactionId, response: Response },
    /// Sends an ACK for a 2xx outside any transaction.
    SendAck { target: Target, request: Request },
}

/// One unit of work for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineInput {
    Inbound(InboundMessage),
    Tu(TuCommand),
    TimerFired(TimerFired),
    TransportFailure(SendFailure),
}

/// Arms and cancels transaction timers.
///
/// Arming a timer that is already armed for the same transaction replaces
/// it. Expiries come back to the engine as [`EngineInput::TimerFired`].
pub trait TimerService: Send {
    fn arm(&mut self, id: &TransactionId, timer: TransactionTimer, duration: Duration);
    fn cancel_all(&mut self, id: &TransactionId);
}

/// Timer service backed by one sleeping tokio task per armed timer.
#[derive(Debug)]
pub struct TokioTimerService {
    fired: mpsc::UnboundedSender<TimerFired>,
    armed: HashMap<TransactionId, HashMap<TransactionTimer, oneshot::Sender<()>>>,
}

impl TokioTimerService {
    pub fn new(fired: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            fired,
            armed: HashMap::new(),
        }
    }

    /// Number of transactions with at least one armed timer.
    pub fn tracked(&self) -> usize {
        self.armed.len()
    }
}

impl TimerService for TokioTimerService {
    fn arm(&mut self, id: &TransactionId, timer: TransactionTimer, duration: Duration) {
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        // Dropping the previous sender wakes and ends its task.
        self.armed
            .entry(id.clone())
            .or_default()
            .insert(timer, cancel_tx);

        let fired = self.fired.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    let _ = fired.send(TimerFired { id, timer });
                }
                _ = &mut cancel_rx => { }
            }
        });
    }

    fn cancel_all(&mut self, id: &TransactionId) {
        self.armed.remove(id);
    }
}

/// Owns the transaction table and applies machine actions.
pub struct TransactionEngine<T: TimerService = TokioTimerService> {
    table: TransactionTable,
    timers: T,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    tu: mpsc::UnboundedSender<TuEvent>,
    config: EngineConfig,
    metrics: TransactionMetrics,
    doomed: Vec<TransactionId>,
}

impl<T: TimerService> TransactionEngine<T> {
    pub fn new(
        timers: T,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
        tu: mpsc::UnboundedSender<TuEvent>,
        config: EngineConfig,
    ) -> Self {
        Self {
            table: TransactionTable::new(),
            timers,
            outbound,
            tu,
            config,
            metrics: TransactionMetrics::new(),
            doomed: Vec::new(),
        }
    }

    /// Shares an existing metrics collector instead of a private one.
    pub fn with_metrics(mut self, metrics: TransactionMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &TransactionMetrics {
        &self.metrics
    }

    pub fn table(&self) -> &TransactionTable {
        &self.table
    }

    pub fn timers(&self) -> &T {
        &self.timers
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handles one input to completion, then removes terminated transactions.
    pub fn handle(&mut self, input: EngineInput) {
        match input {
            EngineInput::Inbound(inbound) => self.on_inbound(inbound),
            EngineInput::Tu(command) => self.on_tu_command(command),
            EngineInput::TimerFired(TimerFired { id, timer }) => self.on_timer(id, timer),
            EngineInput::TransportFailure(failure) => self.on_transport_failure(failure),
        }
        self.reap();
    }

    /// Drains all four queues until `shutdown` is cancelled.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
        mut tu_commands: mpsc::UnboundedReceiver<TuCommand>,
        mut timers: mpsc::UnboundedReceiver<TimerFired>,
        mut failures: mpsc::UnboundedReceiver<SendFailure>,
        shutdown: CancellationToken,
    ) {
        info!("transaction engine started");
        loop {
            let input = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(message) = inbound.recv() => EngineInput::Inbound(message),
                Some(command) = tu_commands.recv() => EngineInput::Tu(command),
                Some(fired) = timers.recv() => EngineInput::TimerFired(fired),
                Some(failure) = failures.recv() => EngineInput::TransportFailure(failure),
                else => break,
            };
            self.handle(input);
        }
        info!(remaining = self.table.len(), "transaction engine stopped");
    }

    fn on_inbound(&mut self, inbound: InboundMessage) {
        let InboundMessage { endpoint, message } = inbound;
        match message {
            WireMessage::NonSip(NonSipFrame::KeepAlive) => {
                if endpoint.is_reliable() {
                    self.send(OutboundMessage::raw(endpoint, Bytes::from_static(b"\r\n")));
                }
            }
            WireMessage::NonSip(NonSipFrame::Stun(frame)) => {
                self.notify(TuEvent::Stun { endpoint, frame });
            }
            WireMessage::Sip(SipMessage::Request(request)) => self.on_request(endpoint, request),
            WireMessage::Sip(SipMessage::Response(response)) => {
                self.on_response(endpoint, response)
            }
        }
    }

    fn on_request(&mut self, endpoint: Endpoint, request: Request) {
        let Some(id) = TransactionId::for_request(&request) else {
            debug!(method = %request.method(), "request without transaction id dropped");
            return;
        };

        if let Some(tx) = self.table.get_mut(&id) {
            debug!(%id, state = tx.state_name(), "request matched existing transaction");
            let actions = tx.on_request(request);
            self.apply(&id, actions, true);
            return;
        }

        if request.method() == &Method::Ack {
            self.notify(TuEvent::Ack { endpoint, request });
            return;
        }

        if self.table.server_count() >= self.config.limits.max_server_transactions {
            warn!(
                %id,
                limit = self.config.limits.max_server_transactions,
                "server transaction limit reached, rejecting with 503"
            );
            self.metrics.on_rejected(TransactionKind::of(&id));
            match make_response(&request, 503, "Service Unavailable") {
                Ok(response) => self.send(OutboundMessage::message(endpoint, response.into())),
                Err(err) => debug!(%err, "cannot build 503"),
            }
            return;
        }

        let timers = self.config.timers;
        let transport = endpoint.transport;
        let invite_id = id.with_method(Method::Invite);
        let actions = if request.method() == &Method::Cancel
            && self.table.contains_entry(&invite_id)
        {
            let (child, actions) = Transaction::server(id.clone(), endpoint, request, timers);
            if let Err(child) = self.table.attach_cancel(&invite_id, child) {
                self.table.insert(child);
            }
            debug!(
                %id,
                parent = %invite_id,
                transport = transport.as_str(),
                "CANCEL linked to INVITE server transaction"
            );
            actions
        } else {
            let (tx, actions) = Transaction::server(id.clone(), endpoint, request, timers);
            self.table.insert(tx);
            debug!(%id, transport = transport.as_str(), "server transaction created");
            actions
        };
        self.metrics.on_started(TransactionKind::of(&id));
        self.apply(&id, actions, false);
    }

    fn on_response(&mut self, endpoint: Endpoint, response: Response) {
        let Some(id) = TransactionId::for_response(&response) else {
            debug!(code = response.code(), "response without transaction id dropped");
            return;
        };
        match self.table.get_mut(&id) {
            Some(tx) => {
                let actions = tx.on_response(response);
                self.apply(&id, actions, false);
            }
            None if self.config.discard_stray_responses => {
                debug!(%id, code = response.code(), "stray response discarded");
            }
            None => self.notify(TuEvent::StrayResponse { endpoint, response }),
        }
    }

    fn on_tu_command(&mut self, command: TuCommand) {
        match command {
            TuCommand::SendRequest { target, request } if request.method() == &Method::Ack => {
                self.send(OutboundMessage::message(target, request.into()));
            }
            TuCommand::SendRequest {
                target,
                mut request,
            } => self.start_client(target, &mut request),
            TuCommand::SendResponse { id, response } => match self.table.get_mut(&id) {
                Some(tx) => {
                    let actions = tx.on_tu_response(response);
                    self.apply(&id, actions, false);
                }
                None => debug!(%id, "no server transaction for TU response"),
            },
            TuCommand::SendAck { target, request } => {
                self.send(OutboundMessage::message(target, request.into()));
            }
        }
    }

    fn start_client(&mut self, target: Target, request: &mut Request) {
        if !ensure_branch(request) {
            warn!(method = %request.method(), "request without Via cannot start a transaction");
            return;
        }
        let Some(id) = TransactionId::for_client_request(request) else {
            warn!(method = %request.method(), "request without transaction id");
            return;
        };
        if self.table.contains(&id) {
            warn!(%id, "client transaction already exists");
            return;
        }

        if self.table.client_count() >= self.config.limits.max_client_transactions {
            warn!(
                %id,
                limit = self.config.limits.max_client_transactions,
                "client transaction limit reached"
            );
            self.metrics.on_rejected(TransactionKind::of(&id));
            match make_response(request, 503, "Service Unavailable") {
                Ok(response) => self.notify(TuEvent::Response { id, response }),
                Err(err) => debug!(%err, "cannot build 503"),
            }
            return;
        }

        let transport = target.transport();
        let (tx, actions) =
            Transaction::client(id.clone(), target, request.clone(), self.config.timers);
        self.table.insert(tx);
        debug!(%id, transport = transport.as_str(), "client transaction created");
        self.metrics.on_started(TransactionKind::of(&id));
        self.apply(&id, actions, false);
    }

    fn on_timer(&mut self, id: TransactionId, timer: TransactionTimer) {
        let Some(tx) = self.table.get_mut(&id) else {
            debug!(%id, ?timer, "timer for finished transaction ignored");
            return;
        };
        self.metrics.on_timer(timer);
        let actions = tx.on_timer(timer);
        self.apply(&id, actions, timer != TransactionTimer::Trying);
    }

    fn on_transport_failure(&mut self, failure: SendFailure) {
        let id = match &failure.message.payload {
            OutboundPayload::Message(SipMessage::Request(request)) => {
                TransactionId::for_client_request(request)
            }
            OutboundPayload::Message(message @ SipMessage::Response(_)) => {
                TransactionId::from_message(message, true)
            }
            OutboundPayload::Raw(_) => None,
        };
        let Some(id) = id.filter(|id| self.table.contains(id)) else {
            debug!(reason = %failure.reason, "send failure outside any transaction");
            return;
        };
        warn!(%id, reason = %failure.reason, "transport failure, destroying transaction");
        self.notify(TuEvent::TransportError {
            id: id.clone(),
            reason: failure.reason,
        });
        self.finish(&id, TransactionOutcome::TransportError);
    }

    /// Applies machine actions for transaction `id`.
    fn apply(&mut self, id: &TransactionId, actions: Vec<Action>, retransmission: bool) {
        let Some((target, source)) = self
            .table
            .get(id)
            .map(|tx| (tx.target().clone(), tx.source().cloned()))
        else {
            return;
        };
        for action in actions {
            match action {
                Action::Transmit(message) => {
                    if retransmission {
                        self.metrics.on_retransmission(target.transport());
                    }
                    self.send(OutboundMessage::message(target.clone(), message));
                }
                Action::Deliver(delivery) => {
                    let event = match delivery {
                        Delivery::Request(request) => match &source {
                            Some(endpoint) => TuEvent::Request {
                                id: id.clone(),
                                endpoint: endpoint.clone(),
                                request,
                            },
                            None => continue,
                        },
                        Delivery::Response(response) => TuEvent::Response {
                            id: id.clone(),
                            response,
                        },
                        Delivery::Ack(request) => match &source {
                            Some(endpoint) => TuEvent::Ack {
                                endpoint: endpoint.clone(),
                                request,
                            },
                            None => continue,
                        },
                        Delivery::Timeout => TuEvent::Timeout { id: id.clone() },
                    };
                    self.notify(event);
                }
                Action::Schedule { timer, duration } => self.timers.arm(id, timer, duration),
                Action::Terminate { outcome } => self.finish(id, outcome),
            }
        }
    }

    /// Records the outcome and schedules removal after the current dispatch.
    fn finish(&mut self, id: &TransactionId, outcome: TransactionOutcome) {
        if self.doomed.contains(id) {
            return;
        }
        if let Some(tx) = self.table.get(id) {
            self.metrics
                .on_finished(TransactionKind::of(id), outcome, tx.started().elapsed());
            debug!(%id, ?outcome, "transaction terminated");
        }
        self.doomed.push(id.clone());
    }

    fn reap(&mut self) {
        for id in std::mem::take(&mut self.doomed) {
            self.timers.cancel_all(&id);
            if self.table.remove(&id).is_some() {
                debug!(%id, remaining = self.table.len(), "transaction removed");
            }
        }
    }

    fn send(&self, message: OutboundMessage) {
        if self.outbound.send(message).is_err() {
            warn!("outbound queue closed");
        }
    }

    fn notify(&self, event: TuEvent) {
        if self.tu.send(event).is_err() {
            debug!("TU queue closed");
        }
    }
}
