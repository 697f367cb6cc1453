// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Minimal transaction user.
//!
//! Answers OPTIONS and CANCEL with 200 OK and every other new request with
//! 501 Not Implemented. Everything else the engine reports is logged.

use rand::{distributions::Alphanumeric, Rng};
use sip_core::{make_response, Method, Request, Response};
use sip_transaction::{TransactionId, TuCommand, TuEvent};
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ALLOW: &str = "OPTIONS, ACK, CANCEL";

pub struct Responder {
    user_agent: SmolStr,
}

impl Responder {
    pub fn new(user_agent: impl Into<SmolStr>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }

    /// Decides the reaction to one engine event.
    pub fn on_event(&self, event: TuEvent) -> Option<TuCommand> {
        match event {
            TuEvent::Request {
                id,
                endpoint,
                request,
            } => {
                info!(
                    method = %request.method(),
                    peer = %endpoint.peer,
                    transport = endpoint.transport.as_str(),
                    "request received"
                );
                self.answer(id, &request)
            }
            TuEvent::Response { id, response } => {
                info!(%id, code = response.code(), "response for client transaction");
                None
            }
            TuEvent::Ack { endpoint, .. } => {
                debug!(peer = %endpoint.peer, "ACK outside transaction");
                None
            }
            TuEvent::Timeout { id } => {
                warn!(%id, "no ACK for final response");
                None
            }
            TuEvent::TransportError { id, reason } => {
                warn!(%id, %reason, "transaction failed on transport");
                None
            }
            TuEvent::StrayResponse { endpoint, response } => {
                debug!(peer = %endpoint.peer, code = response.code(), "stray response");
                None
            }
            TuEvent::Stun { endpoint, frame } => {
                debug!(peer = %endpoint.peer, len = frame.len(), "STUN frame ignored");
                None
            }
        }
    }

    fn answer(&self, id: TransactionId, request: &Request) -> Option<TuCommand> {
        let (code, reason) = match request.method() {
            Method::Options | Method::Cancel => (200, "OK"),
            _ => (501, "Not Implemented"),
        };
        match self.build_response(request, code, reason) {
            Ok(response) => Some(TuCommand::SendResponse { id, response }),
            Err(err) => {
                warn!(%err, "cannot build response");
                None
            }
        }
    }

    fn build_response(
        &self,
        request: &Request,
        code: u16,
        reason: &str,
    ) -> Result<Response, sip_core::MessageError> {
        let mut response = make_response(request, code, reason)?;
        let headers = response.headers_mut();
        if let Some(to) = headers.get("To").cloned() {
            if !to.contains(";tag=") {
                headers.set("To", format!("{};tag={}", to, random_tag()));
            }
        }
        if request.method() == &Method::Options || code == 501 {
            headers.push("Allow", ALLOW);
        }
        headers.push("Server", self.user_agent.clone());
        Ok(response)
    }
}

fn random_tag() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

/// Feeds engine events to `responder` until shutdown or either queue closes.
pub async fn run(
    responder: Responder,
    mut events: mpsc::UnboundedReceiver<TuEvent>,
    commands: mpsc::UnboundedSender<TuCommand>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        if let Some(command) = responder.on_event(event) {
            if commands.send(command).is_err() {
                debug!("engine command queue closed");
                break;
            }
        }
    }
}
