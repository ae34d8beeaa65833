//! # Directive client
//!
//! Delivers directives to the subsystems over ZMQ. Each subsystem runs a REP server, and the
//! client holds one REQ socket per configured subsystem. A directive is only considered delivered
//! once the subsystem has replied with a [`DirectiveResponse`].

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;

use comms_if::{
    directive::{CommandDirective, DirectiveResponse},
    net::{zmq, MonitoredSocket, MonitoredSocketError, NetParams, SocketOptions},
    status::{StatusParseError, SubsystemId},
};
use log::debug;

use crate::dispatch::{DeliveryError, DirectiveSink};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct ZmqDirectiveClient {
    sockets: HashMap<SubsystemId, MonitoredSocket>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DirectiveClientError {
    #[error("Socket error for the {0} subsystem: {1}")]
    SocketError(SubsystemId, MonitoredSocketError),

    #[error("Invalid directive endpoint table: {0}")]
    InvalidEndpoints(StatusParseError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl ZmqDirectiveClient {
    /// Create a new client, connecting to every subsystem in the network parameters.
    ///
    /// This function will not block until the subsystems connect.
    pub fn new(ctx: &zmq::Context, params: &NetParams) -> Result<Self, DirectiveClientError> {
        let endpoints = params
            .subsystem_endpoints()
            .map_err(DirectiveClientError::InvalidEndpoints)?;

        let mut sockets = HashMap::new();

        for (subsystem, endpoint) in endpoints {
            // A request which timed out must not block the next send
            let socket_options = SocketOptions {
                block_on_first_connect: false,
                connect_timeout: 1000,
                heartbeat_ivl: 500,
                heartbeat_ttl: 1000,
                heartbeat_timeout: 1000,
                linger: 1,
                recv_timeout: params.directive_timeout_ms,
                send_timeout: params.directive_timeout_ms,
                req_correlate: true,
                req_relaxed: true,
                ..Default::default()
            };

            let socket = MonitoredSocket::new(ctx, zmq::REQ, socket_options, &endpoint)
                .map_err(|e| DirectiveClientError::SocketError(subsystem, e))?;

            debug!("Directive socket for {} connecting to {}", subsystem, endpoint);

            sockets.insert(subsystem, socket);
        }

        Ok(Self { sockets })
    }

    /// Returns true if the subsystem's directive server is connected.
    pub fn is_connected(&self, subsystem: SubsystemId) -> bool {
        self.sockets
            .get(&subsystem)
            .map(|s| s.connected())
            .unwrap_or(false)
    }
}

impl DirectiveSink for ZmqDirectiveClient {
    fn deliver(&mut self, directive: &CommandDirective) -> Result<DirectiveResponse, DeliveryError> {
        let socket = self
            .sockets
            .get(&directive.target)
            .ok_or(DeliveryError::NoEndpoint(directive.target))?;

        if !socket.connected() {
            return Err(DeliveryError::NotConnected(directive.target));
        }

        let directive_str =
            serde_json::to_string(directive).map_err(DeliveryError::SerializationError)?;

        socket
            .send(&directive_str, 0)
            .map_err(DeliveryError::SendError)?;

        let msg = socket.recv_msg(0).map_err(DeliveryError::RecvError)?;

        serde_json::from_str(msg.as_str().unwrap_or("")).map_err(DeliveryError::InvalidResponse)
    }
}
