use std::time::Duration;

use sip_core::{make_failure_ack, make_response, Request, Response, SipMessage};

use crate::metrics::TransactionOutcome;
use crate::timers::TimerDefaults;
use crate::{
    ClientInviteState, ClientNonInviteState, ServerInviteState, ServerNonInviteState,
    TransactionTimer,
};

/// What a machine hands to the transaction user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Request(Request),
    Response(Response),
    /// ACK absorbed by a server INVITE transaction in Accepted.
    Ack(Request),
    /// Timer H expired without an ACK.
    Timeout,
}

/// Actions emitted by every transaction state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Transmit(SipMessage),
    Deliver(Delivery),
    Schedule {
        timer: TransactionTimer,
        duration: Duration,
    },
    Terminate {
        outcome: TransactionOutcome,
    },
}

fn is_success(response: &Response) -> bool {
    (200..=299).contains(&response.code())
}

/// 408 handed to the TU when Timer B or F expires.
fn timeout_delivery(request: Option<&Request>) -> Action {
    match request.map(|req| make_response(req, 408, "Request Timeout")) {
        Some(Ok(response)) => Action::Deliver(Delivery::Response(response)),
        _ => Action::Deliver(Delivery::Timeout),
    }
}

/// Events that drive the client non-INVITE transaction state machine.
#[derive(Debug, Clone)]
pub enum ClientNonInviteEvent {
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TransactionTimer),
}

/// Implements RFC 3261 Figure 6 for non-INVITE client transactions.
#[derive(Debug)]
pub struct ClientNonInviteFsm {
    pub state: ClientNonInviteState,
    reliable: bool,
    timers: TimerDefaults,
    e_interval: Duration,
    request: Option<Request>,
}

impl ClientNonInviteFsm {
    pub fn new(reliable: bool, timers: TimerDefaults) -> Self {
        Self {
            state: ClientNonInviteState::Trying,
            reliable,
            timers,
            e_interval: timers.t1,
            request: None,
        }
    }

    /// Sends the request and arms Timer F (and Timer E on unreliable transports).
    pub fn start(&mut self, request: Request) -> Vec<Action> {
        let mut actions = vec![Action::Transmit(SipMessage::Request(request.clone()))];
        self.request = Some(request);
        self.state = ClientNonInviteState::Trying;
        if !self.reliable {
            actions.push(Action::Schedule {
                timer: TransactionTimer::E,
                duration: self.e_interval,
            });
        }
        actions.push(Action::Schedule {
            timer: TransactionTimer::F,
            duration: self.timers.duration(TransactionTimer::F),
        });
        actions
    }

    /// Handles an event, returning the resulting actions.
    pub fn on_event(&mut self, event: ClientNonInviteEvent) -> Vec<Action> {
        use ClientNonInviteState::*;
        match (self.state, event) {
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveProvisional(response)) => {
                self.state = Proceeding;
                vec![Action::Deliver(Delivery::Response(response))]
            }
            (Trying | Proceeding, ClientNonInviteEvent::ReceiveFinal(response)) => {
                self.handle_final(response)
            }
            (state @ (Trying | Proceeding), ClientNonInviteEvent::TimerFired(TransactionTimer::E)) => {
                self.handle_timer_e(state)
            }
            (Trying | Proceeding, ClientNonInviteEvent::TimerFired(TransactionTimer::F)) => {
                self.state = Terminated;
                vec![
                    timeout_delivery(self.request.as_ref()),
                    Action::Terminate {
                        outcome: TransactionOutcome::Timeout,
                    },
                ]
            }
            (Completed, ClientNonInviteEvent::TimerFired(TransactionTimer::K)) => {
                self.state = Terminated;
                vec![Action::Terminate {
                    outcome: TransactionOutcome::Completed,
                }]
            }
            _ => Vec::new(),
        }
    }

    fn handle_final(&mut self, response: Response) -> Vec<Action> {
        let mut actions = vec![Action::Deliver(Delivery::Response(response))];
        if self.reliable {
            self.state = ClientNonInviteState::Terminated;
            actions.push(Action::Terminate {
                outcome: TransactionOutcome::Completed,
            });
        } else {
            self.state = ClientNonInviteState::Completed;
            actions.push(Action::Schedule {
                timer: TransactionTimer::K,
                duration: self.timers.duration(TransactionTimer::K),
            });
        }
        actions
    }

    fn handle_timer_e(&mut self, state: ClientNonInviteState) -> Vec<Action> {
        let Some(request) = &self.request else {
            return Vec::new();
        };
        self.e_interval = match state {
            ClientNonInviteState::Trying => self.timers.backoff(self.e_interval, true),
            _ => self.timers.t2,
        };
        vec![
            Action::Transmit(SipMessage::Request(request.clone())),
            Action::Schedule {
                timer: TransactionTimer::E,
                duration: self.e_interval,
            },
        ]
    }
}

/// Events that drive the client INVITE transaction state machine (RFC 3261 §17.1.1).
#[derive(Debug, Clone)]
pub enum ClientInviteEvent {
    ReceiveProvisional(Response),
    ReceiveFinal(Response),
    TimerFired(TransactionTimer),
}

/// Implements the client INVITE transaction state machine with the RFC 6026
/// Accepted state.
#[derive(Debug)]
pub struct ClientInviteFsm {
    pub state: ClientInviteState,
    reliable: bool,
    timers: TimerDefaults,
    a_interval: Duration,
    invite: Option<Request>,
    ack: Option<Request>,
}

impl ClientInviteFsm {
    pub fn new(reliable: bool, timers: TimerDefaults) -> Self {
        Self {
            state: ClientInviteState::Calling,
            reliable,
            timers,
            a_interval: timers.t1,
            invite: None,
            ack: None,
        }
    }

    /// Sends the INVITE and arms Timer B (and Timer A on unreliable transports).
    pub fn start(&mut self, invite: Request) -> Vec<Action> {
        let mut actions = vec![Action::Transmit(SipMessage::Request(invite.clone()))];
        self.invite = Some(invite);
        self.state = ClientInviteState::Calling;
        if !self.reliable {
            actions.push(Action::Schedule {
                timer: TransactionTimer::A,
                duration: self.a_interval,
            });
        }
        actions.push(Action::Schedule {
            timer: TransactionTimer::B,
            duration: self.timers.duration(TransactionTimer::B),
        });
        actions
    }

    /// Handles an INVITE transaction event and returns actions for the runtime.
    pub fn on_event(&mut self, event: ClientInviteEvent) -> Vec<Action> {
        use ClientInviteState::*;
        match (self.state, event) {
            (Calling | Proceeding, ClientInviteEvent::ReceiveProvisional(response)) => {
                self.state = Proceeding;
                vec![Action::Deliver(Delivery::Response(response))]
            }
            (Calling | Proceeding, ClientInviteEvent::ReceiveFinal(response)) => {
                if is_success(&response) {
                    self.handle_final_2xx(response)
                } else {
                    self.handle_final_non_2xx(response)
                }
            }
            (Accepted, ClientInviteEvent::ReceiveFinal(response)) if is_success(&response) => {
                vec![Action::Deliver(Delivery::Response(response))]
            }
            (Completed, ClientInviteEvent::ReceiveFinal(response)) if !is_success(&response) => {
                match &self.ack {
                    Some(ack) => vec![Action::Transmit(SipMessage::Request(ack.clone()))],
                    None => Vec::new(),
                }
            }
            (Calling, ClientInviteEvent::TimerFired(TransactionTimer::A)) => self.handle_timer_a(),
            (Calling, ClientInviteEvent::TimerFired(TransactionTimer::B)) => {
                self.state = Terminated;
                vec![
                    timeout_delivery(self.invite.as_ref()),
                    Action::Terminate {
                        outcome: TransactionOutcome::Timeout,
                    },
                ]
            }
            (Completed, ClientInviteEvent::TimerFired(TransactionTimer::D))
            | (Accepted, ClientInviteEvent::TimerFired(TransactionTimer::M)) => {
                self.state = Terminated;
                vec![Action::Terminate {
                    outcome: TransactionOutcome::Completed,
                }]
            }
            _ => Vec::new(),
        }
    }

    fn handle_final_2xx(&mut self, response: Response) -> Vec<Action> {
        let mut actions = vec![Action::Deliver(Delivery::Response(response))];
        if self.reliable {
            self.state = ClientInviteState::Terminated;
            actions.push(Action::Terminate {
                outcome: TransactionOutcome::Completed,
            });
        } else {
            self.state = ClientInviteState::Accepted;
            actions.push(Action::Schedule {
                timer: TransactionTimer::M,
                duration: self.timers.duration(TransactionTimer::M),
            });
        }
        actions
    }

    fn handle_final_non_2xx(&mut self, response: Response) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(invite) = &self.invite {
            match make_failure_ack(invite, &response) {
                Ok(ack) => {
                    actions.push(Action::Transmit(SipMessage::Request(ack.clone())));
                    self.ack = Some(ack);
                }
                Err(err) => tracing::debug!(%err, "cannot build ACK for failure response"),
            }
        }
        actions.push(Action::Deliver(Delivery::Response(response)));
        if self.reliable {
            self.state = ClientInviteState::Terminated;
            actions.push(Action::Terminate {
                outcome: TransactionOutcome::Completed,
            });
        } else {
            self.state = ClientInviteState::Completed;
            actions.push(Action::Schedule {
                timer: TransactionTimer::D,
                duration: self.timers.duration(TransactionTimer::D),
            });
        }
        actions
    }

    fn handle_timer_a(&mut self) -> Vec<Action> {
        let Some(invite) = &self.invite else {
            return Vec::new();
        };
        self.a_interval = self.timers.backoff(self.a_interval, false);
        vec![
            Action::Transmit(SipMessage::Request(invite.clone())),
            Action::Schedule {
                timer: TransactionTimer::A,
                duration: self.a_interval,
            },
        ]
    }
}

/// Input events for server non-INVITE transaction.
#[derive(Debug, Clone)]
pub enum ServerNonInviteEvent {
    ReceiveRequest(Request),
    SendProvisional(Response),
    SendFinal(Response),
    TimerFired(TransactionTimer),
}

/// Server non-INVITE transaction following RFC 3261 Figure 8. Also serves
/// CANCEL, whether or not it matched an INVITE server transaction.
#[derive(Debug)]
pub struct ServerNonInviteFsm {
    pub state: ServerNonInviteState,
    reliable: bool,
    timers: TimerDefaults,
    last_response: Option<Response>,
}

impl ServerNonInviteFsm {
    /// Creates a server FSM in the `Trying` state.
    pub fn new(reliable: bool, timers: TimerDefaults) -> Self {
        Self {
            state: ServerNonInviteState::Trying,
            reliable,
            timers,
            last_response: None,
        }
    }

    /// Hands the request to the TU.
    pub fn start(&mut self, request: Request) -> Vec<Action> {
        self.state = ServerNonInviteState::Trying;
        vec![Action::Deliver(Delivery::Request(request))]
    }

    /// Handles a server-side event.
    pub fn on_event(&mut self, event: ServerNonInviteEvent) -> Vec<Action> {
        use ServerNonInviteState::*;
        match (self.state, event) {
            (Trying, ServerNonInviteEvent::ReceiveRequest(_)) => Vec::new(),
            (Proceeding | Completed, ServerNonInviteEvent::ReceiveRequest(_)) => {
                self.retransmit_last()
            }
            (Trying | Proceeding, ServerNonInviteEvent::SendProvisional(response)) => {
                self.state = Proceeding;
                self.last_response = Some(response.clone());
                vec![Action::Transmit(SipMessage::Response(response))]
            }
            (Trying | Proceeding, ServerNonInviteEvent::SendFinal(response)) => {
                self.handle_final(response)
            }
            (Completed, ServerNonInviteEvent::TimerFired(TransactionTimer::J)) => {
                self.state = Terminated;
                vec![Action::Terminate {
                    outcome: TransactionOutcome::Completed,
                }]
            }
            _ => Vec::new(),
        }
    }

    fn retransmit_last(&self) -> Vec<Action> {
        match &self.last_response {
            Some(response) => vec![Action::Transmit(SipMessage::Response(response.clone()))],
            None => Vec::new(),
        }
    }

    fn handle_final(&mut self, response: Response) -> Vec<Action> {
        self.last_response = Some(response.clone());
        let mut actions = vec![Action::Transmit(SipMessage::Response(response))];
        if self.reliable {
            self.state = ServerNonInviteState::Terminated;
            actions.push(Action::Terminate {
                outcome: TransactionOutcome::Completed,
            });
        } else {
            self.state = ServerNonInviteState::Completed;
            actions.push(Action::Schedule {
                timer: TransactionTimer::J,
                duration: self.timers.duration(TransactionTimer::J),
            });
        }
        actions
    }
}

/// Events that drive the server INVITE transaction state machine (RFC 3261 §17.2.1).
#[derive(Debug, Clone)]
pub enum ServerInviteEvent {
    ReceiveInvite(Request),
    ReceiveAck(Request),
    SendProvisional(Response),
    SendFinal(Response),
    TimerFired(TransactionTimer),
}

/// Implements the server INVITE transaction state machine with the RFC 6026
/// Accepted state.
#[derive(Debug)]
pub struct ServerInviteFsm {
    pub state: ServerInviteState,
    reliable: bool,
    timers: TimerDefaults,
    g_interval: Duration,
    invite: Option<Request>,
    last_response: Option<Response>,
}

impl ServerInviteFsm {
    pub fn new(reliable: bool, timers: TimerDefaults) -> Self {
        Self {
            state: ServerInviteState::Proceeding,
            reliable,
            timers,
            g_interval: timers.t1,
            invite: None,
            last_response: None,
        }
    }

    /// Hands the INVITE to the TU and arms the automatic 100 Trying.
    pub fn start(&mut self, invite: Request) -> Vec<Action> {
        self.invite = Some(invite.clone());
        self.state = ServerInviteState::Proceeding;
        vec![
            Action::Deliver(Delivery::Request(invite)),
            Action::Schedule {
                timer: TransactionTimer::Trying,
                duration: self.timers.duration(TransactionTimer::Trying),
            },
        ]
    }

    /// Handles an INVITE server-side event and yields actions.
    pub fn on_event(&mut self, event: ServerInviteEvent) -> Vec<Action> {
        use ServerInviteState::*;
        match (self.state, event) {
            (Proceeding | Completed, ServerInviteEvent::ReceiveInvite(_)) => self.retransmit_last(),
            (Proceeding, ServerInviteEvent::TimerFired(TransactionTimer::Trying)) => {
                self.handle_trying_timer()
            }
            (Proceeding, ServerInviteEvent::SendProvisional(response)) => {
                self.last_response = Some(response.clone());
                vec![Action::Transmit(SipMessage::Response(response))]
            }
            (Proceeding, ServerInviteEvent::SendFinal(response)) => {
                if is_success(&response) {
                    self.send_2xx(response)
                } else {
                    self.send_failure(response)
                }
            }
            (Accepted, ServerInviteEvent::SendFinal(response)) if is_success(&response) => {
                vec![Action::Transmit(SipMessage::Response(response))]
            }
            (Completed, ServerInviteEvent::ReceiveAck(_)) => self.handle_ack(),
            (Accepted, ServerInviteEvent::ReceiveAck(ack)) => {
                vec![Action::Deliver(Delivery::Ack(ack))]
            }
            (Completed, ServerInviteEvent::TimerFired(TransactionTimer::G)) => {
                self.handle_timer_g()
            }
            (Completed, ServerInviteEvent::TimerFired(TransactionTimer::H)) => {
                self.state = Terminated;
                vec![
                    Action::Deliver(Delivery::Timeout),
                    Action::Terminate {
                        outcome: TransactionOutcome::Timeout,
                    },
                ]
            }
            (Confirmed, ServerInviteEvent::TimerFired(TransactionTimer::I))
            | (Accepted, ServerInviteEvent::TimerFired(TransactionTimer::L)) => {
                self.state = Terminated;
                vec![Action::Terminate {
                    outcome: TransactionOutcome::Completed,
                }]
            }
            _ => Vec::new(),
        }
    }

    fn retransmit_last(&self) -> Vec<Action> {
        match &self.last_response {
            Some(response) => vec![Action::Transmit(SipMessage::Response(response.clone()))],
            None => Vec::new(),
        }
    }

    fn handle_trying_timer(&mut self) -> Vec<Action> {
        if self.last_response.is_some() {
            return Vec::new();
        }
        let Some(invite) = &self.invite else {
            return Vec::new();
        };
        match make_response(invite, 100, "Trying") {
            Ok(trying) => {
                self.last_response = Some(trying.clone());
                vec![Action::Transmit(SipMessage::Response(trying))]
            }
            Err(err) => {
                tracing::debug!(%err, "cannot build 100 Trying");
                Vec::new()
            }
        }
    }

    fn send_2xx(&mut self, response: Response) -> Vec<Action> {
        let mut actions = vec![Action::Transmit(SipMessage::Response(response))];
        if self.reliable {
            self.state = ServerInviteState::Terminated;
            actions.push(Action::Terminate {
                outcome: TransactionOutcome::Completed,
            });
        } else {
            self.state = ServerInviteState::Accepted;
            actions.push(Action::Schedule {
                timer: TransactionTimer::L,
                duration: self.timers.duration(TransactionTimer::L),
            });
        }
        actions
    }

    fn send_failure(&mut self, response: Response) -> Vec<Action> {
        self.state = ServerInviteState::Completed;
        self.last_response = Some(response.clone());
        self.g_interval = self.timers.t1;
        let mut actions = vec![Action::Transmit(SipMessage::Response(response))];
        if !self.reliable {
            actions.push(Action::Schedule {
                timer: TransactionTimer::G,
                duration: self.g_interval,
            });
        }
        actions.push(Action::Schedule {
            timer: TransactionTimer::H,
            duration: self.timers.duration(TransactionTimer::H),
        });
        actions
    }

    fn handle_ack(&mut self) -> Vec<Action> {
        if self.reliable {
            self.state = ServerInviteState::Terminated;
            return vec![Action::Terminate {
                outcome: TransactionOutcome::Completed,
            }];
        }
        self.state = ServerInviteState::Confirmed;
        vec![Action::Schedule {
            timer: TransactionTimer::I,
            duration: self.timers.duration(TransactionTimer::I),
        }]
    }

    fn handle_timer_g(&mut self) -> Vec<Action> {
        let Some(response) = &self.last_response else {
            return Vec::new();
        };
        self.g_interval = self.timers.backoff(self.g_interval, true);
        vec![
            Action::Transmit(SipMessage::Response(response.clone())),
            Action::Schedule {
                timer: TransactionTimer::G,
                duration: self.g_interval,
            },
        ]
    }
}
