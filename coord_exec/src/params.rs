//! # Coordinator Executable Parameters
//!
//! Parameters are loaded once at start-up from `params/coordinator.toml`. State and subsystem
//! names are kept as strings here and checked when the [`crate::rules::RuleTable`] is built, so
//! that a bad name is reported with the context it appeared in.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::Deserialize;
use std::{collections::HashMap, time::Duration};

use crate::{
    actor::ActorParams, dispatch::DispatchParams, ingress::IngressParams, rules::ConfigError,
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CoordParams {
    /// State the coordinator starts in
    #[serde(default = "default_initial_state")]
    pub initial_state: String,

    /// States the coordinator may enter
    pub states: Vec<String>,

    /// Rules evaluated in every state, before the state's own rules
    #[serde(default)]
    pub global_rules: Vec<RuleParams>,

    /// Rules evaluated only in the named state, in file order
    #[serde(default)]
    pub rules: HashMap<String, Vec<RuleParams>>,

    /// Directive issued on entering the named state
    #[serde(default)]
    pub entry: HashMap<String, EntryParams>,

    /// Maximum time in seconds the named state may be held before the watchdog raises a
    /// `state_timeout` event
    #[serde(default)]
    pub timeouts: HashMap<String, f64>,

    #[serde(default)]
    pub ingress: IngressParams,

    #[serde(default)]
    pub dispatch: DispatchParams,

    #[serde(default)]
    pub actor: ActorParams,
}

/// A transition rule as written in the parameter file.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleParams {
    /// Subsystem the event must come from, any subsystem if omitted
    pub source: Option<String>,

    /// Payload the event must carry
    pub payload: String,

    /// State to transition to
    pub to: String,

    /// Whether a match targeting the current state re-enters it (re-issuing the entry directive)
    #[serde(default)]
    pub reenter: bool,
}

/// An entry directive as written in the parameter file.
#[derive(Debug, Clone, Deserialize)]
pub struct EntryParams {
    pub target: String,
    pub command: String,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl CoordParams {
    /// Check the ingress, dispatch and actor tuning values.
    pub fn check_tuning(&self) -> Result<(), ConfigError> {
        if self.ingress.routine_capacity == 0 {
            return Err(ConfigError::InvalidTuning(
                "ingress.routine_capacity must be at least 1".into(),
            ));
        }
        if self.dispatch.max_attempts == 0 {
            return Err(ConfigError::InvalidTuning(
                "dispatch.max_attempts must be at least 1".into(),
            ));
        }
        if Duration::try_from_secs_f64(self.dispatch.retry_interval_s).is_err() {
            return Err(ConfigError::InvalidTuning(format!(
                "dispatch.retry_interval_s must be a non-negative number of seconds, found {}",
                self.dispatch.retry_interval_s
            )));
        }
        if Duration::try_from_secs_f64(self.actor.tick_s).is_err() || self.actor.tick_s <= 0.0 {
            return Err(ConfigError::InvalidTuning(format!(
                "actor.tick_s must be a positive number of seconds, found {}",
                self.actor.tick_s
            )));
        }

        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn default_initial_state() -> String {
    "Idle".into()
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
