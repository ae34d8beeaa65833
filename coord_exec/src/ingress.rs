//! # Event ingress
//!
//! Status events arrive from many producers (the network status server, the dispatch thread, an
//! event script) and are consumed by the single coordinator thread. The ingress queue is the only
//! point of synchronisation between them.
//!
//! Events are held in two FIFO classes. Safety events are always received before routine events,
//! and are never dropped. The routine class is bounded; once full, newly submitted routine events
//! are dropped.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::status::{Priority, StatusEvent, StatusParseError};
use crossbeam_channel::{
    bounded, unbounded, Receiver, Select, Sender, TryRecvError, TrySendError,
};
use log::{error, warn};
use serde::Deserialize;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngressParams {
    /// Payloads which are always queued in the safety class, regardless of the priority the
    /// producer gave them
    pub safety_payloads: Vec<String>,

    /// Maximum number of routine events waiting to be handled
    pub routine_capacity: usize,
}

/// Producer side of the ingress queue.
#[derive(Clone)]
pub struct IngressSender {
    safety: Sender<StatusEvent>,
    routine: Sender<StatusEvent>,
    shared: Arc<Shared>,
}

/// Consumer side of the ingress queue.
///
/// Once every [`IngressSender`] has been dropped, or either side calls `close`, the remaining
/// events are drained and then [`Recv::Closed`] is returned.
pub struct Ingress {
    safety: Receiver<StatusEvent>,
    routine: Receiver<StatusEvent>,

    /// Signalled on close, so that a waiting consumer wakes up
    wake: Receiver<()>,

    shared: Arc<Shared>,
}

/// Counters describing the traffic through the queue.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct IngressStats {
    pub accepted: u64,
    pub malformed: u64,
    pub overflowed: u64,
}

struct Shared {
    closed: AtomicBool,
    wake: Sender<()>,
    safety_payloads: Vec<String>,

    accepted: AtomicU64,
    malformed: AtomicU64,
    overflowed: AtomicU64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Result of waiting on the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Recv {
    Event(StatusEvent),
    Timeout,

    /// The queue is closed and empty.
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("Malformed status event: {0}")]
    Malformed(StatusParseError),

    #[error("The routine queue is full")]
    Full,

    #[error("The ingress queue is closed")]
    Closed,
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Create a new ingress queue.
///
/// The safety class is unbounded, the routine class holds at most `routine_capacity` events.
pub fn channel(params: &IngressParams) -> (IngressSender, Ingress) {
    let (safety_tx, safety_rx) = unbounded();
    let (routine_tx, routine_rx) = bounded(params.routine_capacity);
    let (wake_tx, wake_rx) = bounded(1);

    let shared = Arc::new(Shared {
        closed: AtomicBool::new(false),
        wake: wake_tx,
        safety_payloads: params.safety_payloads.clone(),
        accepted: AtomicU64::new(0),
        malformed: AtomicU64::new(0),
        overflowed: AtomicU64::new(0),
    });

    (
        IngressSender {
            safety: safety_tx,
            routine: routine_tx,
            shared: shared.clone(),
        },
        Ingress {
            safety: safety_rx,
            routine: routine_rx,
            wake: wake_rx,
            shared,
        },
    )
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for IngressParams {
    fn default() -> Self {
        Self {
            safety_payloads: vec![],
            routine_capacity: 256,
        }
    }
}

impl IngressSender {
    /// Submit an event to the queue. Never blocks on the consumer.
    pub fn submit(&self, mut event: StatusEvent) -> Result<(), IngressError> {
        if self.shared.safety_payloads.contains(&event.payload) {
            event.priority = Priority::Safety;
        }

        if self.shared.is_closed() {
            return Err(IngressError::Closed);
        }

        if event.is_safety() {
            self.safety
                .send(event)
                .map_err(|_| IngressError::Closed)?;
        } else {
            match self.routine.try_send(event) {
                Ok(()) => (),
                Err(TrySendError::Full(event)) => {
                    self.shared.overflowed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Routine queue full ({} events), dropping {}/{}",
                        self.routine.len(),
                        event.source,
                        event.payload
                    );
                    return Err(IngressError::Full);
                }
                Err(TrySendError::Disconnected(_)) => return Err(IngressError::Closed),
            }
        }

        self.shared.accepted.fetch_add(1, Ordering::Relaxed);

        Ok(())
    }

    /// Parse an event from its JSON wire form and submit it.
    ///
    /// Malformed events (invalid JSON, an unknown source, a non-string payload, ...) are logged
    /// and dropped.
    pub fn submit_json(&self, json_str: &str) -> Result<(), IngressError> {
        match StatusEvent::from_json(json_str) {
            Ok(event) => self.submit(event),
            Err(e) => {
                self.shared.malformed.fetch_add(1, Ordering::Relaxed);
                error!("Dropping malformed status event {:?}: {}", json_str, e);
                Err(IngressError::Malformed(e))
            }
        }
    }

    /// Close the queue. Events already queued can still be received.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Number of events waiting to be received.
    pub fn pending(&self) -> usize {
        self.safety.len() + self.routine.len()
    }
}

impl Ingress {
    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Recv {
        let deadline = Instant::now() + timeout;

        loop {
            match self.try_recv() {
                Recv::Timeout => (),
                r => return r,
            }

            let now = Instant::now();
            if now >= deadline {
                return Recv::Timeout;
            }

            // Only wait for readiness here, events are always taken by try_recv so that the
            // safety class goes first
            let mut sel = Select::new();
            sel.recv(&self.safety);
            sel.recv(&self.routine);
            sel.recv(&self.wake);
            if sel.ready_timeout(deadline - now).is_err() {
                return Recv::Timeout;
            }
        }
    }

    /// Get the next event if one is waiting.
    pub fn try_recv(&self) -> Recv {
        let next = match self.safety.try_recv() {
            Ok(event) => Ok(event),
            Err(_) => self.routine.try_recv(),
        };

        match next {
            Ok(event) => Recv::Event(event),
            Err(TryRecvError::Disconnected) => Recv::Closed,
            Err(TryRecvError::Empty) if self.shared.is_closed() => Recv::Closed,
            Err(TryRecvError::Empty) => Recv::Timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.safety.len() + self.routine.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn stats(&self) -> IngressStats {
        IngressStats {
            accepted: self.shared.accepted.load(Ordering::Relaxed),
            malformed: self.shared.malformed.load(Ordering::Relaxed),
            overflowed: self.shared.overflowed.load(Ordering::Relaxed),
        }
    }
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Full means a wake up is already pending
        self.wake.try_send(()).ok();
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use comms_if::status::SubsystemId;
    use std::thread;

    fn params() -> IngressParams {
        IngressParams {
            safety_payloads: vec!["estop".into(), "tilt_excess".into()],
            routine_capacity: 4,
        }
    }

    fn payload(r: Recv) -> String {
        match r {
            Recv::Event(e) => e.payload,
            other => panic!("Expected an event, got {:?}", other),
        }
    }

    #[test]
    fn test_safety_first() {
        let (tx, rx) = channel(&params());

        tx.submit(StatusEvent::new(SubsystemId::Drive, "goal_received"))
            .unwrap();
        tx.submit(StatusEvent::new(SubsystemId::Dig, "load_full"))
            .unwrap();
        // Upgraded by payload
        tx.submit(StatusEvent::new(SubsystemId::Control, "estop"))
            .unwrap();
        // Flagged by the producer
        tx.submit(StatusEvent::safety(SubsystemId::Load, "overload"))
            .unwrap();

        assert_eq!(rx.len(), 4);
        assert_eq!(payload(rx.try_recv()), "estop");
        assert_eq!(payload(rx.try_recv()), "overload");
        assert_eq!(payload(rx.try_recv()), "goal_received");
        assert_eq!(payload(rx.try_recv()), "load_full");
        assert_eq!(rx.try_recv(), Recv::Timeout);
    }

    #[test]
    fn test_routine_overflow() {
        let (tx, rx) = channel(&params());

        for i in 0..4 {
            tx.submit(StatusEvent::new(SubsystemId::Drive, format!("ev{}", i)))
                .unwrap();
        }

        assert!(matches!(
            tx.submit(StatusEvent::new(SubsystemId::Drive, "ev4")),
            Err(IngressError::Full)
        ));

        // Safety events are never dropped
        tx.submit(StatusEvent::new(SubsystemId::Orientation, "tilt_excess"))
            .unwrap();

        assert_eq!(payload(rx.try_recv()), "tilt_excess");
        // The oldest routine events are kept
        assert_eq!(payload(rx.try_recv()), "ev0");
        assert_eq!(rx.stats().overflowed, 1);
        assert_eq!(rx.stats().accepted, 5);
    }

    #[test]
    fn test_malformed_dropped() {
        let (tx, rx) = channel(&params());

        assert!(matches!(
            tx.submit_json(r#"{"source": "laser", "payload": "fire"}"#),
            Err(IngressError::Malformed(StatusParseError::UnknownSource(_)))
        ));
        assert!(matches!(
            tx.submit_json("not json at all"),
            Err(IngressError::Malformed(StatusParseError::InvalidJson(_)))
        ));
        assert!(matches!(
            tx.submit_json(r#"{"source": "dig", "payload": 7}"#),
            Err(IngressError::Malformed(StatusParseError::InvalidPayload(_)))
        ));
        assert!(matches!(
            tx.submit_json(r#"{"source": "watchdog", "payload": "state_timeout"}"#),
            Err(IngressError::Malformed(StatusParseError::UnknownSource(_)))
        ));

        // A following valid event is unaffected
        tx.submit_json(r#"{"source": "dig", "payload": "load_full"}"#)
            .unwrap();

        assert_eq!(rx.len(), 1);
        assert_eq!(payload(rx.try_recv()), "load_full");
        assert_eq!(rx.stats().malformed, 4);
    }

    #[test]
    fn test_close_drains() {
        let (tx, rx) = channel(&params());

        tx.submit(StatusEvent::new(SubsystemId::Drive, "a")).unwrap();
        rx.close();

        assert!(matches!(
            tx.submit(StatusEvent::new(SubsystemId::Drive, "b")),
            Err(IngressError::Closed)
        ));
        assert_eq!(payload(rx.recv_timeout(Duration::from_millis(10))), "a");
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)), Recv::Closed);
    }

    #[test]
    fn test_senders_dropped() {
        let (tx, rx) = channel(&params());

        let producer = tx.clone();
        drop(tx);
        thread::spawn(move || {
            producer
                .submit(StatusEvent::new(SubsystemId::Dig, "load_full"))
                .unwrap();
        })
        .join()
        .unwrap();

        // The last sender has gone, what was queued is still received
        assert_eq!(payload(rx.recv_timeout(Duration::from_millis(10))), "load_full");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Recv::Closed);
    }

    #[test]
    fn test_close_wakes_consumer() {
        let (tx, rx) = channel(&params());

        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.close();
        });

        let start = Instant::now();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Recv::Closed);
        assert!(start.elapsed() < Duration::from_secs(1));

        closer.join().unwrap();
    }

    #[test]
    fn test_recv_timeout() {
        let (_tx, rx) = channel(&params());

        let start = Instant::now();
        assert_eq!(rx.recv_timeout(Duration::from_millis(20)), Recv::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_producers_fifo() {
        let (tx, rx) = channel(&IngressParams {
            safety_payloads: vec![],
            routine_capacity: 1000,
        });

        let producers: Vec<_> = [SubsystemId::Drive, SubsystemId::Dig, SubsystemId::Load]
            .iter()
            .map(|source| {
                let tx = tx.clone();
                let source = *source;
                thread::spawn(move || {
                    for i in 0..100 {
                        tx.submit(StatusEvent::new(source, i.to_string())).unwrap();
                    }
                })
            })
            .collect();

        // Block on the consumer while producers run
        let mut received = vec![];
        while received.len() < 300 {
            match rx.recv_timeout(Duration::from_secs(5)) {
                Recv::Event(e) => received.push(e),
                other => panic!("Expected an event, got {:?}", other),
            }
        }

        for p in producers {
            p.join().unwrap();
        }

        // Each producer's events arrive in the order it sent them
        for source in [SubsystemId::Drive, SubsystemId::Dig, SubsystemId::Load].iter() {
            let seq: Vec<u32> = received
                .iter()
                .filter(|e| e.source == *source)
                .map(|e| e.payload.parse().unwrap())
                .collect();
            assert_eq!(seq, (0..100).collect::<Vec<_>>());
        }
    }
}
