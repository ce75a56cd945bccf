//! Connection establishment: the initiator sends Connect until it receives ConnectResponse and
//!  then confirms with ConnectionEstablished. The acceptor optionally waits for the
//!  application's approval before it responds.

use tokio::time::Instant;
use tracing::{debug, trace};
use crate::connection::{ApprovalDecision, Connection, ConnectionStatus};
use crate::wire::library_messages::{LibraryMessageConnect, LibraryMessageConnectResponse, LibraryMessageDisconnect};
use crate::wire::message_type::LibraryMessageType;

pub(crate) struct Handshake {
    started: Instant,
    /// initiator: sent with Connect, acceptor: sent with ConnectResponse
    local_hail: Vec<u8>,
    num_attempts: u32,
    last_attempt: Option<Instant>,
    awaiting_approval: bool,
    response_sent: bool,
}

impl Handshake {
    pub fn new(local_hail: Vec<u8>, awaiting_approval: bool, now: Instant) -> Handshake {
        Handshake {
            started: now,
            local_hail,
            num_attempts: 0,
            last_attempt: None,
            awaiting_approval,
            response_sent: false,
        }
    }

    pub fn is_awaiting_approval(&self) -> bool {
        self.awaiting_approval
    }

    pub fn is_response_sent(&self) -> bool {
        self.response_sent
    }
}

impl Connection {
    pub(super) fn handshake_heartbeat(&mut self, now: Instant) {
        let config = self.shared.config.clone();

        if self.is_initiator {
            let is_due = match self.handshake.last_attempt {
                None => true,
                Some(t) => now.duration_since(t) >= config.handshake_retry_interval,
            };
            if !is_due {
                return;
            }

            if self.handshake.num_attempts >= config.max_handshake_attempts {
                self.close("No answer from remote host");
                return;
            }

            self.handshake.num_attempts += 1;
            self.handshake.last_attempt = Some(now);
            debug!("sending Connect to {:?} (attempt #{})", self.remote, self.handshake.num_attempts);
            let msg = LibraryMessageConnect {
                app_identifier: config.app_identifier.clone(),
                hail: self.handshake.local_hail.clone(),
            };
            self.write_library_message(LibraryMessageType::Connect, now, |buf| msg.ser(buf));
        }
        else {
            let max_handshake_duration = config.handshake_retry_interval * config.max_handshake_attempts;
            if now.duration_since(self.handshake.started) > max_handshake_duration {
                self.close("Failed to complete handshake");
                return;
            }

            if !self.handshake.awaiting_approval && !self.handshake.response_sent {
                self.handshake.response_sent = true;
                self.send_connect_response(now);
            }
        }
    }

    fn send_connect_response(&mut self, now: Instant) {
        trace!("sending ConnectResponse to {:?}", self.remote);
        self.handshake.last_attempt = Some(now);
        let msg = LibraryMessageConnectResponse {
            hail: self.handshake.local_hail.clone(),
        };
        self.write_library_message(LibraryMessageType::ConnectResponse, now, |buf| msg.ser(buf));
    }

    pub(super) fn apply_approval_decision(&mut self, decision: ApprovalDecision, now: Instant) {
        self.handshake.awaiting_approval = false;

        match decision {
            ApprovalDecision::Approve { hail } => {
                debug!("connection from {:?} was approved", self.remote);
                self.handshake.local_hail = hail;
            }
            ApprovalDecision::Deny { reason } => {
                debug!("connection from {:?} was denied: {}", self.remote, reason);
                self.write_library_message(LibraryMessageType::Disconnect, now, |buf| LibraryMessageDisconnect { reason: reason.clone() }.ser(buf));
                self.close(&reason);
            }
        }
    }

    /// Connect for an existing connection: the remote peer did not receive our ConnectResponse
    pub(super) fn on_repeated_connect(&mut self, _msg: LibraryMessageConnect, now: Instant) {
        if self.is_initiator {
            debug!("ignoring Connect from {:?} for a connection initiated locally", self.remote);
            return;
        }

        if self.status == ConnectionStatus::Connecting && self.handshake.response_sent {
            self.send_connect_response(now);
        }
        else {
            trace!("ignoring repeated Connect from {:?} in status {:?}", self.remote, self.status);
        }
    }

    pub(super) fn on_connect_response(&mut self, msg: LibraryMessageConnectResponse, now: Instant) {
        if !self.is_initiator {
            debug!("ignoring ConnectResponse from {:?} for an incoming connection", self.remote);
            return;
        }

        match self.status {
            ConnectionStatus::Connecting => {
                self.handle.set_remote_hail(msg.hail);
                self.write_library_message(LibraryMessageType::ConnectionEstablished, now, |_| {});

                self.latency.seed_from_handshake(now.duration_since(self.handshake.started));
                self.handle.set_avg_rtt(self.latency.avg_rtt());
                self.on_established(now);
            }
            ConnectionStatus::Connected => {
                // our ConnectionEstablished was lost
                self.write_library_message(LibraryMessageType::ConnectionEstablished, now, |_| {});
            }
            _ => {}
        }
    }

    pub(super) fn on_connection_established(&mut self, now: Instant) {
        if !self.is_initiator && self.status == ConnectionStatus::Connecting && self.handshake.response_sent {
            self.on_established(now);
        }
    }

    pub(super) fn on_established(&mut self, now: Instant) {
        self.latency.on_response(now);
        self.set_status(ConnectionStatus::Connected, "");
    }
}
