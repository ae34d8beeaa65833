//! # Coordinator actor
//!
//! Runs the [`Coordinator`] on a single thread, taking events from the ingress queue one at a time
//! and handling each to completion before the next. Directives are handed to the dispatch thread
//! over a channel, so the actor never blocks on a subsystem.
//!
//! Observers read the current state through a [`StateHandle`], which is only updated once a
//! transition has completed. The snapshot is updated before the transition's directive is handed
//! to dispatch or published, so anything caused by a transition sees it in the snapshot.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use comms_if::{directive::CommandDirective, status::StatusEvent};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    sync::{mpsc::Sender, Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    coordinator::{Coordinator, HandleOutcome, Transition},
    ingress::{Ingress, Recv},
    state::OperatingState,
    tm_server::StateUpdate,
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActorParams {
    /// Maximum time between checks of the current state's timeout
    pub tick_s: f64,

    /// Number of transitions kept in the coordinator's history
    pub history_len: usize,
}

/// A consistent view of the coordinator at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state: OperatingState,

    /// When the current state was entered
    pub entered: DateTime<Utc>,

    pub num_events: u64,

    pub num_transitions: u64,

    pub last_transition: Option<Transition>,
}

/// Shared read-only access to the coordinator's state.
#[derive(Debug, Clone)]
pub struct StateHandle(Arc<Mutex<StateSnapshot>>);

pub struct CoordinatorActor {
    coordinator: Coordinator,
    ingress: Ingress,
    directives: Sender<CommandDirective>,
    updates: Option<Sender<StateUpdate>>,
    handle: StateHandle,
    tick: Duration,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for ActorParams {
    fn default() -> Self {
        Self {
            tick_s: 0.1,
            history_len: 256,
        }
    }
}

impl StateHandle {
    fn new(state: OperatingState) -> Self {
        Self(Arc::new(Mutex::new(StateSnapshot {
            state,
            entered: Utc::now(),
            num_events: 0,
            num_transitions: 0,
            last_transition: None,
        })))
    }

    /// Get a copy of the latest snapshot.
    pub fn snapshot(&self) -> StateSnapshot {
        self.lock().clone()
    }

    pub fn current(&self) -> OperatingState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, StateSnapshot> {
        match self.0.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl CoordinatorActor {
    pub fn new(
        coordinator: Coordinator,
        ingress: Ingress,
        directives: Sender<CommandDirective>,
        params: &ActorParams,
    ) -> Self {
        Self {
            handle: StateHandle::new(coordinator.current()),
            coordinator,
            ingress,
            directives,
            updates: None,
            tick: Duration::from_secs_f64(params.tick_s),
        }
    }

    /// Publish a [`StateUpdate`] on the given channel for each transition.
    pub fn with_updates(mut self, updates: Sender<StateUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    pub fn state_handle(&self) -> StateHandle {
        self.handle.clone()
    }

    /// Handle a single event to completion.
    pub fn process(&mut self, event: &StatusEvent) -> Option<Transition> {
        let outcome = self.coordinator.handle_event(event);

        let transition = match outcome {
            HandleOutcome::Transitioned(t) => t,
            HandleOutcome::Hold | HandleOutcome::Rejected(_) | HandleOutcome::Stale(_) => {
                self.handle.lock().num_events = self.coordinator.num_events();
                return None;
            }
        };

        let seq = {
            let mut snapshot = self.handle.lock();
            snapshot.state = transition.to;
            snapshot.entered = transition.time;
            snapshot.num_events = self.coordinator.num_events();
            snapshot.num_transitions += 1;
            snapshot.last_transition = Some(transition.clone());
            snapshot.num_transitions
        };

        if let Some(ref d) = transition.directive {
            if self.directives.send(d.clone()).is_err() {
                error!("Dispatch has stopped, directive {} not sent", d);
            }
        }

        let listener_gone = match self.updates {
            Some(ref updates) => updates
                .send(StateUpdate {
                    seq,
                    transition: transition.clone(),
                })
                .is_err(),
            None => false,
        };
        if listener_gone {
            warn!("State update listener has gone away");
            self.updates = None;
        }

        Some(transition)
    }

    /// Process events until the ingress queue is closed, returning the coordinator.
    pub fn run(mut self) -> Coordinator {
        info!("Coordinator running in {}", self.coordinator.current());

        loop {
            match self.ingress.recv_timeout(self.tick) {
                Recv::Event(event) => {
                    self.process(&event);
                }
                Recv::Timeout => (),
                Recv::Closed => break,
            }

            if let Some(event) = self.coordinator.poll_timeout(Instant::now()) {
                self.process(&event);
            }
        }

        debug!(
            "Ingress closed after {} events, coordinator stopping in {}",
            self.coordinator.num_events(),
            self.coordinator.current()
        );

        self.coordinator
    }

    /// Run the actor on its own thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<Coordinator>> {
        thread::Builder::new()
            .name("coordinator".into())
            .spawn(move || self.run())
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
