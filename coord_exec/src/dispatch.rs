//! # Command dispatch
//!
//! Directives issued by the coordinator are delivered to their target subsystems on the dispatch
//! thread, so that a slow or absent subsystem never blocks state evaluation.
//!
//! Each directive is attempted up to `max_attempts` times. If no attempt succeeds a
//! `delivery_failed` status event, sourced from the target subsystem and naming the directive's id,
//! is fed back into the ingress queue where the coordinator's rules decide what to do about it.
//!
//! Directives are delivered in the order they were issued. A directive which is being retried is
//! abandoned as soon as a newer one is issued, since the coordinator has already left the state it
//! was issued for.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::{
    directive::{CommandDirective, DirectiveResponse},
    net::zmq,
    status::{StatusEvent, SubsystemId},
};
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, Sender},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::ingress::IngressSender;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Payload reported when a directive could not be delivered.
pub const DELIVERY_FAILED_PAYLOAD: &str = "delivery_failed";

/// Payload reported when a subsystem refuses a directive.
pub const DIRECTIVE_REJECTED_PAYLOAD: &str = "directive_rejected";

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Something which can carry a directive to its target subsystem.
pub trait DirectiveSink: Send {
    /// Make a single delivery attempt, returning the subsystem's response.
    fn deliver(&mut self, directive: &CommandDirective) -> Result<DirectiveResponse, DeliveryError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchParams {
    /// Number of delivery attempts made before a directive is reported as failed
    pub max_attempts: u32,

    /// Time between delivery attempts
    pub retry_interval_s: f64,
}

/// Delivers directives through a [`DirectiveSink`], reporting failures to the ingress queue.
pub struct CommandDispatch<S> {
    sink: S,
    params: DispatchParams,
    ingress: IngressSender,
}

/// Sink which only logs directives, used when running without subsystems.
#[derive(Debug, Default)]
pub struct LogSink;

/// Sink which forwards directives over an in-process channel.
pub struct ChannelSink {
    sender: Sender<CommandDirective>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("No directive endpoint is configured for the {0} subsystem")]
    NoEndpoint(SubsystemId),

    #[error("The {0} subsystem is not connected")]
    NotConnected(SubsystemId),

    #[error("Could not send the directive: {0}")]
    SendError(zmq::Error),

    #[error("No acknowledgement from the subsystem: {0}")]
    RecvError(zmq::Error),

    #[error("Could not serialize the directive: {0}")]
    SerializationError(serde_json::Error),

    #[error("Could not parse the subsystem's response: {0}")]
    InvalidResponse(serde_json::Error),

    #[error("The directive receiver has gone away")]
    Disconnected,
}

/// The final result of delivering one directive.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Accepted { attempts: u32 },
    Rejected { attempts: u32 },
    Failed { attempts: u32, last_error: DeliveryError },

    /// A newer directive was issued while this one was being retried.
    Superseded { attempts: u32, by: CommandDirective },
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for DispatchParams {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_interval_s: 0.2,
        }
    }
}

impl<S: DirectiveSink> CommandDispatch<S> {
    pub fn new(sink: S, params: DispatchParams, ingress: IngressSender) -> Self {
        Self {
            sink,
            params,
            ingress,
        }
    }

    /// Deliver one directive, retrying as configured and reporting the outcome to the ingress
    /// queue if it was not accepted.
    pub fn deliver(&mut self, directive: &CommandDirective) -> DeliveryOutcome {
        self.deliver_until_superseded(directive, None)
    }

    /// Deliver directives from the receiver until all senders have been dropped.
    pub fn run(mut self, directives: Receiver<CommandDirective>) {
        let mut next = directives.recv().ok();

        while let Some(directive) = next.take() {
            next = match self.deliver_until_superseded(&directive, Some(&directives)) {
                DeliveryOutcome::Superseded { by, .. } => Some(by),
                _ => directives.recv().ok(),
            };
        }

        debug!("Directive channel closed, dispatch stopping");
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Attempt delivery, waiting for a newer directive on `newer` between attempts.
    fn deliver_until_superseded(
        &mut self,
        directive: &CommandDirective,
        newer: Option<&Receiver<CommandDirective>>,
    ) -> DeliveryOutcome {
        let max_attempts = self.params.max_attempts.max(1);
        let retry_interval = Duration::from_secs_f64(self.params.retry_interval_s);
        let mut attempts = 0;

        let outcome = loop {
            attempts += 1;

            match self.sink.deliver(directive) {
                Ok(DirectiveResponse::Accepted) => break DeliveryOutcome::Accepted { attempts },
                Ok(DirectiveResponse::Rejected) => break DeliveryOutcome::Rejected { attempts },
                Err(e) if attempts >= max_attempts => {
                    break DeliveryOutcome::Failed {
                        attempts,
                        last_error: e,
                    }
                }
                Err(e) => {
                    warn!(
                        "Attempt {}/{} to deliver {} failed: {}",
                        attempts, max_attempts, directive, e
                    );

                    match newer.map(|rx| rx.recv_timeout(retry_interval)) {
                        Some(Ok(by)) => break DeliveryOutcome::Superseded { attempts, by },
                        Some(Err(RecvTimeoutError::Timeout)) => (),
                        Some(Err(RecvTimeoutError::Disconnected)) | None => {
                            thread::sleep(retry_interval)
                        }
                    }
                }
            }
        };

        match &outcome {
            DeliveryOutcome::Accepted { attempts } => {
                debug!("{} accepted after {} attempt(s)", directive, attempts)
            }
            DeliveryOutcome::Rejected { .. } => {
                warn!("{} rejected by the {} subsystem", directive, directive.target);
                self.report(directive, DIRECTIVE_REJECTED_PAYLOAD);
            }
            DeliveryOutcome::Failed {
                attempts,
                last_error,
            } => {
                error!(
                    "Could not deliver {} after {} attempt(s): {}",
                    directive, attempts, last_error
                );
                self.report(directive, DELIVERY_FAILED_PAYLOAD);
            }
            DeliveryOutcome::Superseded { attempts, by } => {
                info!(
                    "Abandoning {} after {} attempt(s), superseded by {}",
                    directive, attempts, by
                );
            }
        }

        outcome
    }

    fn report(&self, directive: &CommandDirective, payload: &str) {
        let source = directive.target;
        let event = StatusEvent::new(source, payload).replying_to(directive.id);

        if let Err(e) = self.ingress.submit(event) {
            warn!("Could not report {}/{} to the coordinator: {}", source, payload, e);
        }
    }
}

impl<S: DirectiveSink + 'static> CommandDispatch<S> {
    /// Run the dispatch on its own thread.
    pub fn spawn(self, directives: Receiver<CommandDirective>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("dispatch".into())
            .spawn(move || self.run(directives))
    }
}

impl DirectiveSink for LogSink {
    fn deliver(&mut self, directive: &CommandDirective) -> Result<DirectiveResponse, DeliveryError> {
        info!("Directive {}", directive);
        Ok(DirectiveResponse::Accepted)
    }
}

impl ChannelSink {
    pub fn new(sender: Sender<CommandDirective>) -> Self {
        Self { sender }
    }
}

impl DirectiveSink for ChannelSink {
    fn deliver(&mut self, directive: &CommandDirective) -> Result<DirectiveResponse, DeliveryError> {
        self.sender
            .send(directive.clone())
            .map(|_| DirectiveResponse::Accepted)
            .map_err(|_| DeliveryError::Disconnected)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::ingress::{self, IngressParams, Recv};
    use std::{sync::mpsc, time::Instant};

    /// Fails a set number of times, then responds with the given response.
    struct FlakySink {
        failures: u32,
        response: DirectiveResponse,
        calls: u32,
    }

    impl DirectiveSink for FlakySink {
        fn deliver(&mut self, _: &CommandDirective) -> Result<DirectiveResponse, DeliveryError> {
            self.calls += 1;
            if self.calls <= self.failures {
                Err(DeliveryError::RecvError(zmq::Error::EAGAIN))
            } else {
                Ok(self.response)
            }
        }
    }

    fn dispatch(failures: u32, response: DirectiveResponse) -> (CommandDispatch<FlakySink>, ingress::Ingress) {
        let (tx, rx) = ingress::channel(&IngressParams::default());
        let params = DispatchParams {
            max_attempts: 3,
            retry_interval_s: 0.001,
        };
        let sink = FlakySink {
            failures,
            response,
            calls: 0,
        };
        (CommandDispatch::new(sink, params, tx), rx)
    }

    fn directive() -> CommandDirective {
        CommandDirective::new(0, SubsystemId::Dig, "begin_dig")
    }

    #[test]
    fn test_delivered_after_retries() {
        let (mut d, rx) = dispatch(2, DirectiveResponse::Accepted);

        assert!(matches!(
            d.deliver(&directive()),
            DeliveryOutcome::Accepted { attempts: 3 }
        ));
        assert!(rx.is_empty());
    }

    #[test]
    fn test_failure_reported() {
        let (mut d, rx) = dispatch(10, DirectiveResponse::Accepted);

        assert!(matches!(
            d.deliver(&directive()),
            DeliveryOutcome::Failed { attempts: 3, .. }
        ));
        assert_eq!(d.into_sink().calls, 3);

        match rx.try_recv() {
            Recv::Event(e) => {
                assert_eq!(e.source, SubsystemId::Dig);
                assert_eq!(e.payload, DELIVERY_FAILED_PAYLOAD);
                assert_eq!(e.in_reply_to, Some(0));
            }
            other => panic!("Expected a failure report, got {:?}", other),
        }
    }

    #[test]
    fn test_rejection_not_retried() {
        let (mut d, rx) = dispatch(0, DirectiveResponse::Rejected);

        assert!(matches!(
            d.deliver(&directive()),
            DeliveryOutcome::Rejected { attempts: 1 }
        ));

        match rx.try_recv() {
            Recv::Event(e) => assert_eq!(e.payload, DIRECTIVE_REJECTED_PAYLOAD),
            other => panic!("Expected a rejection report, got {:?}", other),
        }
    }

    #[test]
    fn test_run_forwards_in_order() {
        let (ingress_tx, _ingress_rx) = ingress::channel(&IngressParams::default());
        let (out_tx, out_rx) = mpsc::channel();
        let (dir_tx, dir_rx) = mpsc::channel();

        let handle = CommandDispatch::new(
            ChannelSink::new(out_tx),
            DispatchParams::default(),
            ingress_tx,
        )
        .spawn(dir_rx)
        .unwrap();

        for i in 0..5 {
            dir_tx
                .send(CommandDirective::new(i, SubsystemId::Drive, "navigate"))
                .unwrap();
        }
        drop(dir_tx);
        handle.join().unwrap();

        let ids: Vec<u64> = out_rx.try_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    /// Takes a while over every attempt, and can never reach the drive subsystem's navigation.
    struct SlowNavSink {
        delivered: mpsc::Sender<CommandDirective>,
    }

    impl DirectiveSink for SlowNavSink {
        fn deliver(&mut self, d: &CommandDirective) -> Result<DirectiveResponse, DeliveryError> {
            thread::sleep(Duration::from_millis(50));

            if d.command == "navigate" {
                Err(DeliveryError::NotConnected(d.target))
            } else {
                self.delivered.send(d.clone()).ok();
                Ok(DirectiveResponse::Accepted)
            }
        }
    }

    #[test]
    fn test_newer_directive_replaces_retries() {
        let (ingress_tx, ingress_rx) = ingress::channel(&IngressParams::default());
        let (out_tx, out_rx) = mpsc::channel();
        let (dir_tx, dir_rx) = mpsc::channel();

        let handle = CommandDispatch::new(
            SlowNavSink { delivered: out_tx },
            DispatchParams {
                max_attempts: 3,
                retry_interval_s: 0.2,
            },
            ingress_tx,
        )
        .spawn(dir_rx)
        .unwrap();

        let start = Instant::now();
        dir_tx
            .send(CommandDirective::new(0, SubsystemId::Drive, "navigate"))
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        dir_tx
            .send(CommandDirective::new(1, SubsystemId::Drive, "emergency_stop"))
            .unwrap();

        let stop = out_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(stop.command, "emergency_stop");

        // One attempt at navigate then one at emergency_stop, without waiting out the retries
        assert!(
            start.elapsed() < Duration::from_millis(400),
            "emergency_stop took {:?}",
            start.elapsed()
        );

        drop(dir_tx);
        handle.join().unwrap();

        // The abandoned directive is not reported as failed
        assert!(ingress_rx.is_empty());
    }

    #[test]
    fn test_channel_sink_disconnected() {
        let (tx, rx) = mpsc::channel();
        drop(rx);

        let mut sink = ChannelSink::new(tx);
        assert!(matches!(
            sink.deliver(&directive()),
            Err(DeliveryError::Disconnected)
        ));
    }
}
