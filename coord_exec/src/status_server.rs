//! # Status server
//!
//! Receives status events pushed by the subsystems (and the operator console) on a ZMQ PULL
//! socket, and submits them to the ingress queue.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::net::{zmq, MonitoredSocket, MonitoredSocketError, NetParams, SocketOptions};
use log::{debug, error, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crate::ingress::{IngressError, IngressSender};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Receive timeout, bounds how long the server takes to notice a stop request.
const RECV_TIMEOUT_MS: i32 = 100;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct StatusServer {
    socket: MonitoredSocket,
    ingress: IngressSender,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StatusServerError {
    #[error("Socket error: {0}")]
    SocketError(MonitoredSocketError),

    #[error("Could not recieve a message: {0}")]
    RecvError(zmq::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl StatusServer {
    /// Bind the status endpoint.
    pub fn new(
        ctx: &zmq::Context,
        params: &NetParams,
        ingress: IngressSender,
    ) -> Result<Self, StatusServerError> {
        let socket_options = SocketOptions {
            bind: true,
            block_on_first_connect: false,
            linger: 1,
            recv_timeout: RECV_TIMEOUT_MS,
            ..Default::default()
        };

        let socket = MonitoredSocket::new(ctx, zmq::PULL, socket_options, &params.status_endpoint)
            .map_err(StatusServerError::SocketError)?;

        Ok(Self { socket, ingress })
    }

    /// Receive all waiting messages, submitting each to the ingress queue.
    ///
    /// Returns the number of messages received, or `Ok(None)` if the ingress queue was closed.
    pub fn poll(&self) -> Result<Option<usize>, StatusServerError> {
        let mut num_recieved = 0;

        loop {
            let msg_str = match self.socket.recv_string(0) {
                Ok(Ok(s)) => s,
                Ok(Err(_)) => {
                    warn!("Recieved a status message which was not valid UTF-8");
                    continue;
                }
                Err(zmq::Error::EAGAIN) => return Ok(Some(num_recieved)),
                Err(e) => return Err(StatusServerError::RecvError(e)),
            };

            num_recieved += 1;

            match self.ingress.submit_json(&msg_str) {
                Ok(()) => (),
                Err(IngressError::Closed) => return Ok(None),
                // Already logged by the ingress
                Err(_) => (),
            }
        }
    }

    /// Serve until the stop flag is raised or the ingress queue is closed.
    pub fn run(self, stop: Arc<AtomicBool>) -> Result<(), StatusServerError> {
        while !stop.load(Ordering::Relaxed) {
            match self.poll()? {
                Some(n) if n > 0 => debug!("{} status message(s) recieved", n),
                Some(_) => (),
                None => break,
            }
        }

        debug!("Status server stopping");

        Ok(())
    }

    /// Serve on a new thread.
    pub fn spawn(self, stop: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("status_server".into())
            .spawn(move || {
                if let Err(e) = self.run(stop) {
                    error!("Status server failed: {}", e);
                }
            })
    }
}
