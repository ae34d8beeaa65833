//! # Transition rules
//!
//! The coordinator's behaviour is an explicit, ordered rule table. For a given state the table is
//! evaluated as:
//!
//! 1. The global rules, in parameter file order.
//! 2. The current state's rules, in parameter file order.
//!
//! The first rule whose predicate matches the incoming event wins. Global rules therefore always
//! take precedence, which is where safety transitions (emergency stop, operator takeover) live.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::status::{StatusEvent, SubsystemId};
use std::{collections::HashMap, fmt::Display, time::Duration};

use crate::{
    params::{CoordParams, EntryParams, RuleParams},
    state::{OperatingState, StateSet},
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A predicate over an incoming event, paired with the state to move to when it holds.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRule {
    /// Required source subsystem, `None` matches any source
    pub source: Option<SubsystemId>,

    /// Required payload
    pub payload: String,

    /// Target state
    pub to: OperatingState,

    /// Whether a match targeting the current state re-enters it
    pub reenter: bool,
}

/// Directive issued on entry to a state.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryAction {
    pub target: SubsystemId,
    pub command: String,
}

/// A rule which matched an event, and where in the table it came from.
#[derive(Debug, Clone, Copy)]
pub struct RuleMatch<'a> {
    pub origin: RuleOrigin,
    pub rule: &'a TransitionRule,
}

/// The validated rule table.
///
/// Only constructible through [`RuleTable::from_params`], so holding one guarantees the
/// configuration is consistent.
#[derive(Debug, Clone)]
pub struct RuleTable {
    initial: OperatingState,
    enabled: StateSet,
    global: Vec<TransitionRule>,
    per_state: HashMap<OperatingState, Vec<TransitionRule>>,
    entry: HashMap<OperatingState, EntryAction>,
    timeouts: HashMap<OperatingState, Duration>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Position of a rule within the table.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RuleOrigin {
    Global(usize),
    State(OperatingState, usize),
}

/// Errors in the coordinator configuration. All of these are fatal at start-up.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown state {name:?} in {context}")]
    UnknownState { context: String, name: String },

    #[error("Unknown subsystem {name:?} in {context}")]
    UnknownSubsystem { context: String, name: String },

    #[error("No states are enabled")]
    NoStates,

    #[error("State {0} is listed more than once")]
    DuplicateState(OperatingState),

    #[error("The initial state {0} is not an enabled state")]
    InitialStateDisabled(OperatingState),

    #[error("{context} targets the disabled state {to}")]
    DisabledTarget { context: String, to: OperatingState },

    #[error("{context} is given for the disabled state {state}")]
    DisabledState { context: String, state: OperatingState },

    #[error("{context} has an empty payload")]
    EmptyPayload { context: String },

    #[error("Entry directive for {state} cannot target the {target} subsystem")]
    InvalidDirectiveTarget { state: OperatingState, target: SubsystemId },

    #[error("Entry directive for {0} has an empty command")]
    EmptyCommand(OperatingState),

    #[error("Timeout for {state} must be a positive number of seconds, found {value}")]
    InvalidTimeout { state: OperatingState, value: f64 },

    #[error("State {0} cannot be reached from the initial state")]
    UnreachableState(OperatingState),

    #[error("Invalid tuning parameter: {0}")]
    InvalidTuning(String),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl TransitionRule {
    /// Returns true if the event satisfies this rule's predicate.
    pub fn matches(&self, event: &StatusEvent) -> bool {
        self.source.map_or(true, |s| s == event.source) && self.payload == event.payload
    }
}

impl RuleTable {
    /// Build and validate the rule table from the coordinator parameters.
    pub fn from_params(params: &CoordParams) -> Result<Self, ConfigError> {
        // Enabled states
        let mut enabled = StateSet::new();
        for name in params.states.iter() {
            let state = parse_state(name, "the enabled state list")?;
            if !enabled.insert(state) {
                return Err(ConfigError::DuplicateState(state));
            }
        }
        if enabled.is_empty() {
            return Err(ConfigError::NoStates);
        }

        let initial = parse_state(&params.initial_state, "initial_state")?;
        if !enabled.contains(initial) {
            return Err(ConfigError::InitialStateDisabled(initial));
        }

        // Global rules
        let global = params
            .global_rules
            .iter()
            .enumerate()
            .map(|(i, r)| parse_rule(r, &format!("global rule #{}", i), enabled))
            .collect::<Result<Vec<_>, _>>()?;

        // Per-state rules
        let mut per_state = HashMap::new();
        for (name, rules) in params.rules.iter() {
            let state = parse_state(name, "the rules table")?;
            require_enabled(state, enabled, "A rule list")?;

            let rules = rules
                .iter()
                .enumerate()
                .map(|(i, r)| parse_rule(r, &format!("{} rule #{}", state, i), enabled))
                .collect::<Result<Vec<_>, _>>()?;

            per_state.insert(state, rules);
        }

        // Entry directives
        let mut entry = HashMap::new();
        for (name, e) in params.entry.iter() {
            let state = parse_state(name, "the entry table")?;
            require_enabled(state, enabled, "An entry directive")?;
            entry.insert(state, parse_entry(state, e)?);
        }

        // Timeouts
        let mut timeouts = HashMap::new();
        for (name, value) in params.timeouts.iter() {
            let state = parse_state(name, "the timeouts table")?;
            require_enabled(state, enabled, "A timeout")?;
            let timeout = match Duration::try_from_secs_f64(*value) {
                Ok(t) if *value > 0.0 => t,
                _ => {
                    return Err(ConfigError::InvalidTimeout {
                        state,
                        value: *value,
                    })
                }
            };
            timeouts.insert(state, timeout);
        }

        let table = Self {
            initial,
            enabled,
            global,
            per_state,
            entry,
            timeouts,
        };

        // Every enabled state must be reachable from the initial state
        let reachable = table.reachable();
        if let Some(s) = enabled.iter().find(|s| !reachable.contains(*s)) {
            return Err(ConfigError::UnreachableState(s));
        }

        Ok(table)
    }

    /// Find the first rule matching the event in the given state.
    pub fn evaluate(&self, current: OperatingState, event: &StatusEvent) -> Option<RuleMatch<'_>> {
        let global = self
            .global
            .iter()
            .enumerate()
            .map(|(i, r)| (RuleOrigin::Global(i), r));

        let local = self
            .per_state
            .get(&current)
            .into_iter()
            .flat_map(|rules| rules.iter().enumerate())
            .map(move |(i, r)| (RuleOrigin::State(current, i), r));

        global
            .chain(local)
            .find(|(_, r)| r.matches(event))
            .map(|(origin, rule)| RuleMatch { origin, rule })
    }

    pub fn initial(&self) -> OperatingState {
        self.initial
    }

    pub fn enabled(&self) -> StateSet {
        self.enabled
    }

    pub fn is_enabled(&self, state: OperatingState) -> bool {
        self.enabled.contains(state)
    }

    pub fn entry_action(&self, state: OperatingState) -> Option<&EntryAction> {
        self.entry.get(&state)
    }

    pub fn timeout(&self, state: OperatingState) -> Option<Duration> {
        self.timeouts.get(&state).copied()
    }

    /// Total number of rules in the table.
    pub fn num_rules(&self) -> usize {
        self.global.len() + self.per_state.values().map(Vec::len).sum::<usize>()
    }

    /// Compute the set of states reachable from the initial state.
    fn reachable(&self) -> StateSet {
        let mut reached = StateSet::new();
        reached.insert(self.initial);
        let mut frontier = vec![self.initial];

        while let Some(state) = frontier.pop() {
            let local = self.per_state.get(&state).into_iter().flatten();

            for rule in self.global.iter().chain(local) {
                if reached.insert(rule.to) {
                    frontier.push(rule.to);
                }
            }
        }

        reached
    }

    #[cfg(test)]
    pub(crate) fn disable_unchecked(&mut self, state: OperatingState) {
        self.enabled = self.enabled.iter().filter(|s| *s != state).collect();
    }
}

impl Display for RuleOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleOrigin::Global(i) => write!(f, "global rule #{}", i),
            RuleOrigin::State(s, i) => write!(f, "{} rule #{}", s, i),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn parse_state(name: &str, context: &str) -> Result<OperatingState, ConfigError> {
    name.parse().map_err(|_| ConfigError::UnknownState {
        context: context.into(),
        name: name.into(),
    })
}

fn parse_subsystem(name: &str, context: &str) -> Result<SubsystemId, ConfigError> {
    name.parse().map_err(|_| ConfigError::UnknownSubsystem {
        context: context.into(),
        name: name.into(),
    })
}

fn require_enabled(
    state: OperatingState,
    enabled: StateSet,
    context: &str,
) -> Result<(), ConfigError> {
    match enabled.contains(state) {
        true => Ok(()),
        false => Err(ConfigError::DisabledState {
            context: context.into(),
            state,
        }),
    }
}

fn parse_rule(
    params: &RuleParams,
    context: &str,
    enabled: StateSet,
) -> Result<TransitionRule, ConfigError> {
    let source = params
        .source
        .as_deref()
        .map(|s| parse_subsystem(s, context))
        .transpose()?;

    if params.payload.is_empty() {
        return Err(ConfigError::EmptyPayload {
            context: context.into(),
        });
    }

    let to = parse_state(&params.to, context)?;
    if !enabled.contains(to) {
        return Err(ConfigError::DisabledTarget {
            context: context.into(),
            to,
        });
    }

    Ok(TransitionRule {
        source,
        payload: params.payload.clone(),
        to,
        reenter: params.reenter,
    })
}

fn parse_entry(state: OperatingState, params: &EntryParams) -> Result<EntryAction, ConfigError> {
    let context = format!("the {} entry directive", state);
    let target = parse_subsystem(&params.target, &context)?;

    if target == SubsystemId::Watchdog {
        return Err(ConfigError::InvalidDirectiveTarget { state, target });
    }
    if params.command.is_empty() {
        return Err(ConfigError::EmptyCommand(state));
    }

    Ok(EntryAction {
        target,
        command: params.command.clone(),
    })
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
