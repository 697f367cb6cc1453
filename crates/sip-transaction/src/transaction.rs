// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::time::Instant;

use sip_core::{Method, Request, Response};
use sip_transport::{Endpoint, Target};

use crate::fsm::{
    Action, ClientInviteEvent, ClientInviteFsm, ClientNonInviteEvent, ClientNonInviteFsm,
    ServerInviteEvent, ServerInviteFsm, ServerNonInviteEvent, ServerNonInviteFsm,
};
use crate::timers::TimerDefaults;
use crate::{
    ClientInviteState, ClientNonInviteState, ServerInviteState, ServerNonInviteState,
    TransactionId, TransactionTimer,
};

/// The four RFC 3261 transaction kinds.
#[derive(Debug)]
pub enum Machine {
    ClientInvite(ClientInviteFsm),
    ClientNonInvite(ClientNonInviteFsm),
    ServerInvite(ServerInviteFsm),
    ServerNonInvite(ServerNonInviteFsm),
}

impl Machine {
    pub fn is_terminated(&self) -> bool {
        match self {
            Machine::ClientInvite(fsm) => fsm.state == ClientInviteState::Terminated,
            Machine::ClientNonInvite(fsm) => fsm.state == ClientNonInviteState::Terminated,
            Machine::ServerInvite(fsm) => fsm.state == ServerInviteState::Terminated,
            Machine::ServerNonInvite(fsm) => fsm.state == ServerNonInviteState::Terminated,
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            Machine::ClientInvite(fsm) => match fsm.state {
                ClientInviteState::Calling => "Calling",
                ClientInviteState::Proceeding => "Proceeding",
                ClientInviteState::Completed => "Completed",
                ClientInviteState::Accepted => "Accepted",
                ClientInviteState::Terminated => "Terminated",
            },
            Machine::ClientNonInvite(fsm) => match fsm.state {
                ClientNonInviteState::Trying => "Trying",
                ClientNonInviteState::Proceeding => "Proceeding",
                ClientNonInviteState::Completed => "Completed",
                ClientNonInviteState::Terminated => "Terminated",
            },
            Machine::ServerInvite(fsm) => match fsm.state {
                ServerInviteState::Proceeding => "Proceeding",
                ServerInviteState::Completed => "Completed",
                ServerInviteState::Confirmed => "Confirmed",
                ServerInviteState::Accepted => "Accepted",
                ServerInviteState::Terminated => "Terminated",
            },
            Machine::ServerNonInvite(fsm) => match fsm.state {
                ServerNonInviteState::Trying => "Trying",
                ServerNonInviteState::Proceeding => "Proceeding",
                ServerNonInviteState::Completed => "Completed",
                ServerNonInviteState::Terminated => "Terminated",
            },
        }
    }
}

/// One transaction: its machine, where its messages go, and the CANCEL
/// server transaction it owns, if any.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    machine: Machine,
    target: Target,
    started: Instant,
    linked_cancel: Option<Box<Transaction>>,
}

impl Transaction {
    /// Creates a client transaction and returns the actions that send the request.
    pub fn client(
        id: TransactionId,
        target: Target,
        request: Request,
        timers: TimerDefaults,
    ) -> (Self, Vec<Action>) {
        let reliable = target.is_reliable();
        let (machine, actions) = if request.method() == &Method::Invite {
            let mut fsm = ClientInviteFsm::new(reliable, timers);
            let actions = fsm.start(request);
            (Machine::ClientInvite(fsm), actions)
        } else {
            let mut fsm = ClientNonInviteFsm::new(reliable, timers);
            let actions = fsm.start(request);
            (Machine::ClientNonInvite(fsm), actions)
        };
        (Self::with_machine(id, machine, target), actions)
    }

    /// Creates a server transaction for a request received from `source`.
    pub fn server(
        id: TransactionId,
        source: Endpoint,
        request: Request,
        timers: TimerDefaults,
    ) -> (Self, Vec<Action>) {
        let reliable = source.is_reliable();
        let (machine, actions) = if request.method() == &Method::Invite {
            let mut fsm = ServerInviteFsm::new(reliable, timers);
            let actions = fsm.start(request);
            (Machine::ServerInvite(fsm), actions)
        } else {
            let mut fsm = ServerNonInviteFsm::new(reliable, timers);
            let actions = fsm.start(request);
            (Machine::ServerNonInvite(fsm), actions)
        };
        (Self::with_machine(id, machine, source.into()), actions)
    }

    fn with_machine(id: TransactionId, machine: Machine, target: Target) -> Self {
        Self {
            id,
            machine,
            target,
            started: Instant::now(),
            linked_cancel: None,
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Where transmitted messages go: the request destination for client
    /// transactions, the request source for server transactions.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The peer a server transaction's request came from.
    pub fn source(&self) -> Option<&Endpoint> {
        match &self.target {
            Target::Endpoint(endpoint) if self.id.is_server => Some(endpoint),
            _ => None,
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn is_terminated(&self) -> bool {
        self.machine.is_terminated()
    }

    pub fn state_name(&self) -> &'static str {
        self.machine.state_name()
    }

    /// Feeds a response received from the network to a client transaction.
    ///
    /// Status codes outside 100..=699 are ignored.
    pub fn on_response(&mut self, response: Response) -> Vec<Action> {
        let Some(class) = response.class() else {
            return Vec::new();
        };
        let provisional = !class.is_final();
        match &mut self.machine {
            Machine::ClientInvite(fsm) => fsm.on_event(if provisional {
                ClientInviteEvent::ReceiveProvisional(response)
            } else {
                ClientInviteEvent::ReceiveFinal(response)
            }),
            Machine::ClientNonInvite(fsm) => fsm.on_event(if provisional {
                ClientNonInviteEvent::ReceiveProvisional(response)
            } else {
                ClientNonInviteEvent::ReceiveFinal(response)
            }),
            _ => Vec::new(),
        }
    }

    /// Feeds a request received from the network (a retransmission, or the
    /// ACK for a failure response) to a server transaction.
    pub fn on_request(&mut self, request: Request) -> Vec<Action> {
        match &mut self.machine {
            Machine::ServerInvite(fsm) => match request.method() {
                Method::Ack => fsm.on_event(ServerInviteEvent::ReceiveAck(request)),
                Method::Invite => fsm.on_event(ServerInviteEvent::ReceiveInvite(request)),
                _ => Vec::new(),
            },
            Machine::ServerNonInvite(fsm) => {
                fsm.on_event(ServerNonInviteEvent::ReceiveRequest(request))
            }
            _ => Vec::new(),
        }
    }

    /// Feeds a response the TU wants sent to a server transaction.
    pub fn on_tu_response(&mut self, response: Response) -> Vec<Action> {
        let Some(class) = response.class() else {
            return Vec::new();
        };
        let provisional = !class.is_final();
        match &mut self.machine {
            Machine::ServerInvite(fsm) => fsm.on_event(if provisional {
                ServerInviteEvent::SendProvisional(response)
            } else {
                ServerInviteEvent::SendFinal(response)
            }),
            Machine::ServerNonInvite(fsm) => fsm.on_event(if provisional {
                ServerNonInviteEvent::SendProvisional(response)
            } else {
                ServerNonInviteEvent::SendFinal(response)
            }),
            _ => Vec::new(),
        }
    }

    pub fn on_timer(&mut self, timer: TransactionTimer) -> Vec<Action> {
        match &mut self.machine {
            Machine::ClientInvite(fsm) => fsm.on_event(ClientInviteEvent::TimerFired(timer)),
            Machine::ClientNonInvite(fsm) => fsm.on_event(ClientNonInviteEvent::TimerFired(timer)),
            Machine::ServerInvite(fsm) => fsm.on_event(ServerInviteEvent::TimerFired(timer)),
            Machine::ServerNonInvite(fsm) => fsm.on_event(ServerNonInviteEvent::TimerFired(timer)),
        }
    }

    pub fn linked_cancel(&self) -> Option<&Transaction> {
        self.linked_cancel.as_deref()
    }

    pub fn linked_cancel_mut(&mut self) -> Option<&mut Transaction> {
        self.linked_cancel.as_deref_mut()
    }

    pub(crate) fn attach_cancel(&mut self, child: Transaction) {
        self.linked_cancel = Some(Box::new(child));
    }

    pub(crate) fn take_linked_cancel(&mut self) -> Option<Transaction> {
        self.linked_cancel.take().map(|child| *child)
    }
}
