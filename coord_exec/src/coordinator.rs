//! # Coordinator
//!
//! The [`Coordinator`] is the sole owner of the rover's [`OperatingState`]. It is driven one event
//! at a time: each call to [`Coordinator::handle`] evaluates the rule table against the current
//! state, and if a rule matches swaps the state and produces the new state's entry directive.
//!
//! The coordinator performs no I/O and never blocks, so it can be driven directly in tests or from
//! the [`crate::actor::CoordinatorActor`] thread.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use comms_if::{
    directive::CommandDirective,
    status::{StatusEvent, SubsystemId},
};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::{
    rules::{RuleOrigin, RuleTable},
    state::OperatingState,
};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Payload of the event raised when a state's timeout elapses.
pub const STATE_TIMEOUT_PAYLOAD: &str = "state_timeout";

/// Default number of transitions kept in the history.
pub const DEFAULT_HISTORY_LEN: usize = 256;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// The rover's high-level state machine.
pub struct Coordinator {
    table: RuleTable,

    state: OperatingState,

    /// When the current state was entered
    entered_at: Instant,

    /// Whether the watchdog has already fired for the current state entry
    timeout_raised: bool,

    next_directive_id: u64,

    /// Id of the directive issued on entry to the current state
    entry_directive: Option<u64>,

    num_events: u64,

    history: VecDeque<Transition>,

    history_len: usize,
}

/// A record of a single state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: OperatingState,
    pub to: OperatingState,

    /// The event which caused the transition
    pub trigger: StatusEvent,

    /// The entry directive issued, if the new state has one
    pub directive: Option<CommandDirective>,

    pub time: DateTime<Utc>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    /// No rule matched, or the matched rule targets the current state without re-entry.
    Hold,

    /// A rule matched but targets a state which is not enabled. State is unchanged.
    Rejected(OperatingState),

    /// The event reports on a directive other than the current state's entry directive, and was
    /// ignored.
    Stale(u64),

    /// The state changed.
    Transitioned(Transition),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Coordinator {
    /// Create a new coordinator in the table's initial state.
    pub fn new(table: RuleTable) -> Self {
        Self {
            state: table.initial(),
            table,
            entered_at: Instant::now(),
            timeout_raised: false,
            next_directive_id: 0,
            entry_directive: None,
            num_events: 0,
            history: VecDeque::new(),
            history_len: DEFAULT_HISTORY_LEN,
        }
    }

    /// Set the number of transitions retained in the history.
    pub fn with_history_len(mut self, history_len: usize) -> Self {
        self.history_len = history_len;
        self
    }

    /// Handle a status event, returning the directive for the new state if a transition occurs.
    pub fn handle(&mut self, event: &StatusEvent) -> Option<CommandDirective> {
        match self.handle_event(event) {
            HandleOutcome::Transitioned(t) => t.directive,
            _ => None,
        }
    }

    /// Handle a status event, reporting in full what happened.
    pub fn handle_event(&mut self, event: &StatusEvent) -> HandleOutcome {
        self.num_events += 1;

        if let Some(id) = event.in_reply_to {
            if self.entry_directive != Some(id) {
                info!(
                    "Ignoring {}/{} for directive #{}, no longer current in {}",
                    event.source, event.payload, id, self.state
                );
                return HandleOutcome::Stale(id);
            }
        }

        let (origin, to, reenter) = match self.table.evaluate(self.state, event) {
            Some(m) => (m.origin, m.rule.to, m.rule.reenter),
            None => {
                debug!(
                    "No rule for {}/{} in {}, holding",
                    event.source, event.payload, self.state
                );
                return HandleOutcome::Hold;
            }
        };

        if !self.table.is_enabled(to) {
            error!(
                "{} would move {} to the disabled state {}, event {}/{} rejected",
                origin, self.state, to, event.source, event.payload
            );
            return HandleOutcome::Rejected(to);
        }

        if to == self.state && !reenter {
            debug!(
                "{} targets the current state {}, holding",
                origin, self.state
            );
            return HandleOutcome::Hold;
        }

        HandleOutcome::Transitioned(self.transition(to, event, origin))
    }

    /// Returns the current operating state.
    pub fn current(&self) -> OperatingState {
        self.state
    }

    /// The most recent transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    /// The number of events handled so far.
    pub fn num_events(&self) -> u64 {
        self.num_events
    }

    /// The time spent in the current state.
    pub fn time_in_state(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.entered_at)
    }

    pub fn table(&self) -> &RuleTable {
        &self.table
    }

    /// Check the current state's timeout.
    ///
    /// Returns a `watchdog/state_timeout` event, at most once per state entry, once the state has
    /// been held for longer than its configured timeout. The event should be handled like any
    /// other.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<StatusEvent> {
        if self.timeout_raised {
            return None;
        }

        let timeout = self.table.timeout(self.state)?;

        if self.time_in_state(now) >= timeout {
            self.timeout_raised = true;
            info!(
                "{} held for longer than {:.1} s, raising {}",
                self.state,
                timeout.as_secs_f64(),
                STATE_TIMEOUT_PAYLOAD
            );
            Some(StatusEvent::new(SubsystemId::Watchdog, STATE_TIMEOUT_PAYLOAD))
        } else {
            None
        }
    }

    fn transition(
        &mut self,
        to: OperatingState,
        event: &StatusEvent,
        origin: RuleOrigin,
    ) -> Transition {
        let from = self.state;

        let directive = match self.table.entry_action(to) {
            Some(a) => {
                let d = CommandDirective::new(self.next_directive_id, a.target, a.command.clone());
                self.next_directive_id += 1;
                Some(d)
            }
            None => None,
        };
        self.entry_directive = directive.as_ref().map(|d| d.id);

        // Swap state
        self.state = to;
        self.entered_at = Instant::now();
        self.timeout_raised = false;

        info!(
            "State change {} -> {} ({}, on {}/{})",
            from, to, origin, event.source, event.payload
        );

        let transition = Transition {
            from,
            to,
            trigger: event.clone(),
            directive,
            time: Utc::now(),
        };

        if self.history_len > 0 {
            if self.history.len() >= self.history_len {
                self.history.pop_front();
            }
            self.history.push_back(transition.clone());
        }

        transition
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        state::ALL_STATES,
        test_support::{params_from, rover_table},
    };

    /// Drive a coordinator into the given state through the rover rules.
    fn coordinator_in(state: OperatingState) -> Coordinator {
        let mut c = Coordinator::new(rover_table());

        let path: &[(SubsystemId, &str)] = match state {
            OperatingState::Idle => &[],
            OperatingState::Navigating => &[(SubsystemId::Drive, "goal_received")],
            OperatingState::Digging => &[
                (SubsystemId::Drive, "goal_received"),
                (SubsystemId::Drive, "arrived_dig_site"),
            ],
            OperatingState::Dumping => &[
                (SubsystemId::Drive, "goal_received"),
                (SubsystemId::Drive, "arrived_dump_site"),
            ],
            OperatingState::Recovering => &[
                (SubsystemId::Drive, "goal_received"),
                (SubsystemId::Drive, "stalled"),
            ],
            OperatingState::Manual => &[(SubsystemId::Control, "manual_takeover")],
            OperatingState::EStopped => &[(SubsystemId::Control, "estop")],
        };

        for (source, payload) in path {
            c.handle(&StatusEvent::new(*source, *payload));
        }
        assert_eq!(c.current(), state);

        c
    }

    fn assert_directive(d: Option<CommandDirective>, target: SubsystemId, command: &str) {
        let d = d.expect("Expected a directive");
        assert_eq!(d.target, target);
        assert_eq!(d.command, command);
    }

    #[test]
    fn test_starts_idle() {
        let c = Coordinator::new(rover_table());
        assert_eq!(c.current(), OperatingState::Idle);
        assert_eq!(c.history().count(), 0);
    }

    #[test]
    fn test_idle_goal_received() {
        let mut c = coordinator_in(OperatingState::Idle);

        let d = c.handle(&StatusEvent::new(SubsystemId::Drive, "goal_received"));

        assert_eq!(c.current(), OperatingState::Navigating);
        assert_directive(d, SubsystemId::Drive, "navigate");
    }

    #[test]
    fn test_digging_load_full() {
        let mut c = coordinator_in(OperatingState::Digging);

        let d = c.handle(&StatusEvent::new(SubsystemId::Dig, "load_full"));

        assert_eq!(c.current(), OperatingState::Dumping);
        assert_directive(d, SubsystemId::Dump, "begin_dump");
    }

    #[test]
    fn test_navigating_tilt_excess() {
        let mut c = coordinator_in(OperatingState::Navigating);

        let d = c.handle(&StatusEvent::new(SubsystemId::Orientation, "tilt_excess"));

        assert_eq!(c.current(), OperatingState::Recovering);
        assert_directive(d, SubsystemId::Recovery, "initiate_recovery");
    }

    #[test]
    fn test_unmatched_event_holds() {
        let mut c = coordinator_in(OperatingState::Digging);

        // Right payload, wrong source
        assert!(c
            .handle(&StatusEvent::new(SubsystemId::Drive, "load_full"))
            .is_none());
        // Unknown payload
        assert_eq!(
            c.handle_event(&StatusEvent::new(SubsystemId::Dig, "garbage")),
            HandleOutcome::Hold
        );

        assert_eq!(c.current(), OperatingState::Digging);
    }

    #[test]
    fn test_estop_from_every_state_and_reset() {
        for state in ALL_STATES.iter() {
            let mut c = coordinator_in(*state);

            let d = c.handle(&StatusEvent::safety(SubsystemId::Control, "estop"));
            assert_eq!(c.current(), OperatingState::EStopped);

            // Entering EStopped from EStopped is a hold
            if *state == OperatingState::EStopped {
                assert!(d.is_none());
            } else {
                assert_directive(d, SubsystemId::Drive, "emergency_stop");
            }

            // Nothing but reset leaves EStopped
            c.handle(&StatusEvent::new(SubsystemId::Drive, "goal_received"));
            c.handle(&StatusEvent::new(SubsystemId::Orientation, "tilt_excess"));
            assert_eq!(c.current(), OperatingState::EStopped);

            let d = c.handle(&StatusEvent::new(SubsystemId::Control, "reset"));
            assert_eq!(c.current(), OperatingState::Idle);
            assert_directive(d, SubsystemId::Drive, "halt");
        }
    }

    #[test]
    fn test_deterministic() {
        let events = [
            StatusEvent::new(SubsystemId::Drive, "goal_received"),
            StatusEvent::new(SubsystemId::Perception, "path_blocked"),
            StatusEvent::new(SubsystemId::Recovery, "recovered"),
            StatusEvent::new(SubsystemId::Drive, "goal_received"),
            StatusEvent::new(SubsystemId::Drive, "arrived_dig_site"),
            StatusEvent::new(SubsystemId::Load, "load_full"),
            StatusEvent::new(SubsystemId::Load, "load_empty"),
        ];

        let run = || {
            let mut c = Coordinator::new(rover_table());
            events
                .iter()
                .map(|e| {
                    let d = c.handle(e);
                    (c.current(), d.map(|d| (d.id, d.target, d.command)))
                })
                .collect::<Vec<_>>()
        };

        let first = run();
        assert_eq!(first, run());
        assert_eq!(first.last().map(|r| r.0), Some(OperatingState::Idle));

        // Directive ids strictly increase
        let ids: Vec<u64> = first
            .iter()
            .filter_map(|(_, d)| d.as_ref().map(|d| d.0))
            .collect();
        assert_eq!(ids, (0..ids.len() as u64).collect::<Vec<_>>());
    }

    #[test]
    fn test_state_always_enabled() {
        let table = rover_table();
        let mut c = Coordinator::new(table.clone());

        // Throw every source/payload combination seen in the rover rules at the coordinator
        let payloads = [
            "goal_received", "arrived_dig_site", "arrived_dump_site", "goal_reached", "stalled",
            "path_blocked", "delivery_failed", "state_timeout", "tilt_excess", "load_full",
            "dig_fault", "dump_complete", "load_empty", "dump_fault", "recovered",
            "recovery_failed", "manual_release", "reset", "estop", "manual_takeover", "nonsense",
        ];

        for (i, payload) in payloads.iter().cycle().take(500).enumerate() {
            let source = comms_if::status::ALL_SUBSYSTEMS[i % 9];
            c.handle(&StatusEvent::new(source, *payload));
            assert!(table.is_enabled(c.current()));
        }
    }

    #[test]
    fn test_transitions_recorded() {
        let mut c = Coordinator::new(rover_table()).with_history_len(2);

        c.handle(&StatusEvent::new(SubsystemId::Drive, "goal_received"));
        c.handle(&StatusEvent::new(SubsystemId::Drive, "stalled"));
        c.handle(&StatusEvent::new(SubsystemId::Recovery, "recovered"));

        let history: Vec<_> = c.history().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            history,
            vec![
                (OperatingState::Navigating, OperatingState::Recovering),
                (OperatingState::Recovering, OperatingState::Idle),
            ]
        );
        assert_eq!(c.num_events(), 3);
    }

    #[test]
    fn test_reenter() {
        let params = params_from(
            r#"
            states = ["Idle", "Recovering"]

            [[rules.Idle]]
            payload = "stuck"
            to = "Recovering"

            [[rules.Recovering]]
            payload = "retry"
            to = "Recovering"
            reenter = true

            [[rules.Recovering]]
            payload = "stuck"
            to = "Recovering"

            [entry.Recovering]
            target = "recovery"
            command = "initiate_recovery"
            "#,
        );
        let mut c = Coordinator::new(RuleTable::from_params(&params).unwrap());

        let first = c.handle(&StatusEvent::new(SubsystemId::Drive, "stuck")).unwrap();

        // Same-state match without reenter is a hold
        assert_eq!(
            c.handle_event(&StatusEvent::new(SubsystemId::Drive, "stuck")),
            HandleOutcome::Hold
        );

        // With reenter the entry directive is issued again
        let again = c.handle(&StatusEvent::new(SubsystemId::Drive, "retry")).unwrap();
        assert_eq!(again.command, first.command);
        assert!(again.id > first.id);
        assert_eq!(c.current(), OperatingState::Recovering);
    }

    #[test]
    fn test_disabled_target_rejected() {
        let mut table = rover_table();
        table.disable_unchecked(OperatingState::Recovering);
        let mut c = Coordinator::new(table);

        c.handle(&StatusEvent::new(SubsystemId::Drive, "goal_received"));
        let outcome = c.handle_event(&StatusEvent::new(SubsystemId::Drive, "stalled"));

        assert_eq!(outcome, HandleOutcome::Rejected(OperatingState::Recovering));
        assert_eq!(c.current(), OperatingState::Navigating);
    }

    #[test]
    fn test_stale_delivery_report_ignored() {
        let mut c = Coordinator::new(rover_table());

        let navigate = c
            .handle(&StatusEvent::new(SubsystemId::Drive, "goal_received"))
            .unwrap();
        let begin_dig = c
            .handle(&StatusEvent::new(SubsystemId::Drive, "arrived_dig_site"))
            .unwrap();
        assert_eq!(c.current(), OperatingState::Digging);

        // navigate failing after the dig has started doesn't concern Digging
        let stale =
            StatusEvent::new(SubsystemId::Drive, "delivery_failed").replying_to(navigate.id);
        assert_eq!(c.handle_event(&stale), HandleOutcome::Stale(navigate.id));
        assert_eq!(c.current(), OperatingState::Digging);

        // begin_dig failing does
        let current =
            StatusEvent::new(SubsystemId::Dig, "delivery_failed").replying_to(begin_dig.id);
        assert_directive(c.handle(&current), SubsystemId::Recovery, "initiate_recovery");
        assert_eq!(c.current(), OperatingState::Recovering);
    }

    #[test]
    fn test_state_without_entry_directive() {
        let params = params_from(
            r#"
            states = ["Idle", "Navigating"]

            [[rules.Idle]]
            source = "drive"
            payload = "goal_received"
            to = "Navigating"
            "#,
        );
        let mut c = Coordinator::new(RuleTable::from_params(&params).unwrap());

        let outcome = c.handle_event(&StatusEvent::new(SubsystemId::Drive, "goal_received"));

        match outcome {
            HandleOutcome::Transitioned(t) => {
                assert_eq!(t.to, OperatingState::Navigating);
                assert!(t.directive.is_none());
            }
            other => panic!("Expected a transition, got {:?}", other),
        }
    }

    #[test]
    fn test_timeout_raised_once_per_entry() {
        let mut c = coordinator_in(OperatingState::Digging);
        let now = Instant::now();

        assert!(c.poll_timeout(now).is_none());

        let later = now + Duration::from_secs(301);
        let ev = c.poll_timeout(later).expect("Expected a timeout event");
        assert_eq!(ev.source, SubsystemId::Watchdog);
        assert_eq!(ev.payload, STATE_TIMEOUT_PAYLOAD);
        assert!(c.poll_timeout(later).is_none());

        let d = c.handle(&ev);
        assert_eq!(c.current(), OperatingState::Recovering);
        assert_directive(d, SubsystemId::Recovery, "initiate_recovery");

        // Idle has no timeout
        c.handle(&StatusEvent::new(SubsystemId::Recovery, "recovered"));
        assert!(c
            .poll_timeout(Instant::now() + Duration::from_secs(100_000))
            .is_none());
    }

    #[test]
    fn test_dig_cycle_script() {
        use util::script_interpreter::{PendingEvents, ScriptInterpreter};

        let mut si =
            ScriptInterpreter::from_script(include_str!("../../scripts/dig_cycle.evs")).unwrap();
        let events = match si.get_pending_events(f64::MAX) {
            PendingEvents::Some(evs) => evs,
            other => panic!("Expected events, got {:?}", other),
        };

        let mut c = Coordinator::new(rover_table());
        let visited: Vec<OperatingState> = events
            .iter()
            .map(|e| {
                c.handle(e);
                c.current()
            })
            .collect();

        use OperatingState::*;
        assert_eq!(
            visited,
            vec![
                Navigating, Recovering, Idle, Navigating, Digging, Dumping, Idle, EStopped, Idle
            ]
        );
    }
}
