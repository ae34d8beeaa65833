//! # TM Server
//!
//! Publishes a [`StateUpdate`] for every state transition, for ground displays and loggers.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::net::{zmq, MonitoredSocket, MonitoredSocketError, NetParams, SocketOptions};
use serde::{Deserialize, Serialize};

use crate::coordinator::Transition;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Telemetry server
pub struct TmServer {
    socket: MonitoredSocket,
}

/// Telemetry packet that is output by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    /// Sequence number, counts transitions since the coordinator started
    pub seq: u64,

    #[serde(flatten)]
    pub transition: Transition,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TmServerError {
    #[error("Socket error: {0}")]
    SocketError(MonitoredSocketError),

    #[error("Could not send telemetry: {0}")]
    SendError(zmq::Error),

    #[error("Could not serialize the telemetry: {0}")]
    SerializationError(serde_json::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl TmServer {
    /// Create a new instance of the TM Server.
    ///
    /// This function will not block until a subscriber connects.
    pub fn new(ctx: &zmq::Context, params: &NetParams) -> Result<Self, TmServerError> {
        let socket_options = SocketOptions {
            block_on_first_connect: false,
            bind: true,
            connect_timeout: 1000,
            heartbeat_ivl: 500,
            heartbeat_ttl: 1000,
            heartbeat_timeout: 1000,
            linger: 1,
            send_timeout: 10,
            ..Default::default()
        };

        let socket = MonitoredSocket::new(ctx, zmq::PUB, socket_options, &params.tm_endpoint)
            .map_err(TmServerError::SocketError)?;

        Ok(Self { socket })
    }

    pub fn send(&mut self, update: &StateUpdate) -> Result<(), TmServerError> {
        let packet_string =
            serde_json::to_string(update).map_err(TmServerError::SerializationError)?;

        self.socket
            .send(&packet_string, 0)
            .map_err(TmServerError::SendError)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::state::OperatingState;
    use chrono::Utc;
    use comms_if::{
        directive::CommandDirective,
        status::{StatusEvent, SubsystemId},
    };

    #[test]
    fn test_state_update_json() {
        let update = StateUpdate {
            seq: 4,
            transition: Transition {
                from: OperatingState::Digging,
                to: OperatingState::Dumping,
                trigger: StatusEvent::new(SubsystemId::Dig, "load_full"),
                directive: Some(CommandDirective::new(7, SubsystemId::Dump, "begin_dump")),
                time: Utc::now(),
            },
        };

        let json = serde_json::to_string(&update).unwrap();
        let val: serde_json::Value = serde_json::from_str(&json).unwrap();

        // Transition fields are flattened into the packet
        assert_eq!(val["seq"], 4);
        assert_eq!(val["from"], "Digging");
        assert_eq!(val["to"], "Dumping");
        assert_eq!(val["trigger"]["source"], "dig");
        assert_eq!(val["directive"]["command"], "begin_dump");

        let back: StateUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, update);
    }
}
