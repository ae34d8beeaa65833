//! # Operating states
//!
//! The closed set of high-level behavioural modes of the rover. Exactly one is active at any time,
//! owned by the [`crate::coordinator::Coordinator`].

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// All operating states in declaration order.
pub const ALL_STATES: [OperatingState; 7] = [
    OperatingState::Idle,
    OperatingState::Navigating,
    OperatingState::Digging,
    OperatingState::Dumping,
    OperatingState::Recovering,
    OperatingState::Manual,
    OperatingState::EStopped,
];

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A set of operating states, stored as a bitmask.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct StateSet(u8);

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// High-level behavioural mode of the rover.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum OperatingState {
    /// Stationary and safe, waiting for a goal.
    Idle,

    /// Driving towards a goal.
    Navigating,

    /// Excavating regolith.
    Digging,

    /// Emptying the collected load.
    Dumping,

    /// Getting unstuck (excess tilt, stalled wheels, lost delivery, ...).
    Recovering,

    /// An operator has taken control from the manual control station.
    Manual,

    /// Emergency stop. Only left via an explicit reset.
    EStopped,
}

#[derive(Debug, thiserror::Error)]
#[error("{0:?} is not an operating state")]
pub struct UnknownStateError(pub String);

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl OperatingState {
    /// The name of the state as used in parameter files.
    pub fn name(&self) -> &'static str {
        match self {
            OperatingState::Idle => "Idle",
            OperatingState::Navigating => "Navigating",
            OperatingState::Digging => "Digging",
            OperatingState::Dumping => "Dumping",
            OperatingState::Recovering => "Recovering",
            OperatingState::Manual => "Manual",
            OperatingState::EStopped => "EStopped",
        }
    }

    fn bit(&self) -> u8 {
        1 << (*self as u8)
    }
}

impl FromStr for OperatingState {
    type Err = UnknownStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_STATES
            .iter()
            .find(|st| st.name() == s)
            .copied()
            .ok_or_else(|| UnknownStateError(s.to_string()))
    }
}

impl Display for OperatingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl StateSet {
    pub fn new() -> Self {
        Self(0)
    }

    /// Adds the state, returning false if it was already present.
    pub fn insert(&mut self, state: OperatingState) -> bool {
        let present = self.contains(state);
        self.0 |= state.bit();
        !present
    }

    pub fn contains(&self, state: OperatingState) -> bool {
        self.0 & state.bit() != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate over the states in the set in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = OperatingState> + '_ {
        ALL_STATES.iter().copied().filter(move |s| self.contains(*s))
    }
}

impl std::iter::FromIterator<OperatingState> for StateSet {
    fn from_iter<I: IntoIterator<Item = OperatingState>>(iter: I) -> Self {
        let mut set = StateSet::new();
        for s in iter {
            set.insert(s);
        }
        set
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_names() {
        for s in ALL_STATES.iter() {
            assert_eq!(s.name().parse::<OperatingState>().unwrap(), *s);
        }
        assert!("Sleeping".parse::<OperatingState>().is_err());
        assert!("idle".parse::<OperatingState>().is_err());
    }

    #[test]
    fn test_state_set() {
        let mut set = StateSet::new();
        assert!(set.is_empty());

        assert!(set.insert(OperatingState::Digging));
        assert!(set.insert(OperatingState::Idle));
        assert!(!set.insert(OperatingState::Digging));

        assert_eq!(set.len(), 2);
        assert!(set.contains(OperatingState::Idle));
        assert!(!set.contains(OperatingState::EStopped));
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![OperatingState::Idle, OperatingState::Digging]
        );

        let all: StateSet = ALL_STATES.iter().copied().collect();
        assert_eq!(all.len(), ALL_STATES.len());
    }
}
