//! # Command directives
//!
//! Directives are the instructions sent by the coordinator to a subsystem when the rover enters a
//! new operating state, for example `navigate` to the drive subsystem.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::SubsystemId;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// An instruction sent to one subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDirective {
    /// Identifier of the directive, strictly increasing over the coordinator's lifetime
    pub id: u64,

    /// The subsystem which shall execute the directive
    pub target: SubsystemId,

    /// Opaque command, for example `"navigate"` or `"begin_dump"`
    pub command: String,

    /// Time at which the coordinator issued the directive
    pub issued: DateTime<Utc>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Response from a subsystem on receipt of a directive.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum DirectiveResponse {
    /// The directive was received and will be executed
    Accepted,

    /// The directive was received but the subsystem cannot execute it
    Rejected,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl CommandDirective {
    pub fn new<S: Into<String>>(id: u64, target: SubsystemId, command: S) -> Self {
        Self {
            id,
            target,
            command: command.into(),
            issued: Utc::now(),
        }
    }
}

impl std::fmt::Display for CommandDirective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {}: {}", self.id, self.target, self.command)
    }
}
