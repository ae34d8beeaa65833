//! # Status event module
//!
//! Status events are the notifications sent by the rover's subsystems (drive, dig, dump, etc.) to
//! the coordinator. Each event names its source subsystem and carries an opaque payload, which the
//! coordinator's transition rules compare against.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

// External
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Display;
use std::str::FromStr;
use structopt::StructOpt;
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A notification from a subsystem describing its current condition or an occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// The subsystem which produced this event
    pub source: SubsystemId,

    /// Opaque payload, for example `"goal_received"` or `"load_full"`
    pub payload: String,

    /// Time at which the event was produced
    pub timestamp: DateTime<Utc>,

    /// Queueing class of the event
    #[serde(default)]
    pub priority: Priority,

    /// Id of the directive this event reports on, set on delivery reports made by the
    /// coordinator's dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
}

/// A status event as typed by an operator, see the `status_cli` executable.
#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "status")]
pub struct StatusCmd {
    /// The subsystem the event comes from (drive, dig, dump, perception, load, orientation,
    /// recovery, control)
    pub source: SubsystemId,

    /// The payload of the event
    pub payload: String,

    /// Send the event in the safety priority class
    #[structopt(long)]
    pub safety: bool,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Identifiers of the independent subsystems which talk to the coordinator.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubsystemId {
    Drive,
    Dig,
    Dump,
    Perception,
    Load,
    Orientation,
    Recovery,

    /// Operator control station (manual control, emergency stop)
    Control,

    /// The coordinator's own state timeout monitor
    Watchdog,
}

/// Queueing class of a status event.
///
/// Safety events are always delivered to the coordinator before routine ones.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Routine,
    Safety,
}

/// Possible parsing errors.
#[derive(Debug, Error)]
pub enum StatusParseError {
    #[error("Status event contains invalid JSON: {0}")]
    InvalidJson(serde_json::Error),

    #[error("Status event is not a JSON object")]
    NotAnObject,

    #[error("Status event is missing the \"{0}\" field")]
    MissingField(&'static str),

    #[error("Status event has an unrecognised source ({0})")]
    UnknownSource(String),

    #[error("Status event payload must be a string, found {0}")]
    InvalidPayload(Value),

    #[error("Status event has an invalid timestamp ({0})")]
    InvalidTimestamp(String),

    #[error("Status event has an invalid priority ({0})")]
    InvalidPriority(String),

    #[error("Status event has an invalid directive id ({0})")]
    InvalidReplyTo(String),
}

// ------------------------------------------------------------------------------------------------
// STATICS
// ------------------------------------------------------------------------------------------------

/// All subsystems in declaration order.
pub static ALL_SUBSYSTEMS: [SubsystemId; 9] = [
    SubsystemId::Drive,
    SubsystemId::Dig,
    SubsystemId::Dump,
    SubsystemId::Perception,
    SubsystemId::Load,
    SubsystemId::Orientation,
    SubsystemId::Recovery,
    SubsystemId::Control,
    SubsystemId::Watchdog,
];

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl StatusEvent {
    /// Create a new routine event timestamped now.
    pub fn new<S: Into<String>>(source: SubsystemId, payload: S) -> Self {
        Self {
            source,
            payload: payload.into(),
            timestamp: Utc::now(),
            priority: Priority::Routine,
            in_reply_to: None,
        }
    }

    /// Create a new safety event timestamped now.
    pub fn safety<S: Into<String>>(source: SubsystemId, payload: S) -> Self {
        Self {
            priority: Priority::Safety,
            ..Self::new(source, payload)
        }
    }

    /// Mark the event as a report on the directive with the given id.
    pub fn replying_to(mut self, directive_id: u64) -> Self {
        self.in_reply_to = Some(directive_id);
        self
    }

    /// Parse a status event from a JSON packet.
    ///
    /// The packet must be an object with a string `source` naming a known subsystem and a string
    /// `payload`. `timestamp` (RFC 3339) and `priority` are optional, defaulting to the time of
    /// parsing and `routine` respectively, as is `in_reply_to`.
    ///
    /// The `watchdog` source is reserved for events raised inside the coordinator and is rejected
    /// as unrecognised.
    pub fn from_json(json_str: &str) -> Result<Self, StatusParseError> {
        let val: Value = serde_json::from_str(json_str).map_err(StatusParseError::InvalidJson)?;

        if !val.is_object() {
            return Err(StatusParseError::NotAnObject);
        }

        let source = match &val["source"] {
            Value::String(s) => match SubsystemId::from_str(s)? {
                SubsystemId::Watchdog => return Err(StatusParseError::UnknownSource(s.clone())),
                id => id,
            },
            Value::Null => return Err(StatusParseError::MissingField("source")),
            other => return Err(StatusParseError::UnknownSource(other.to_string())),
        };

        let payload = match &val["payload"] {
            Value::String(s) => s.clone(),
            Value::Null => return Err(StatusParseError::MissingField("payload")),
            other => return Err(StatusParseError::InvalidPayload(other.clone())),
        };

        let timestamp = match &val["timestamp"] {
            Value::Null => Utc::now(),
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .map_err(|_| StatusParseError::InvalidTimestamp(s.clone()))?
                .with_timezone(&Utc),
            other => return Err(StatusParseError::InvalidTimestamp(other.to_string())),
        };

        let priority = match &val["priority"] {
            Value::Null => Priority::Routine,
            Value::String(s) if s == "routine" => Priority::Routine,
            Value::String(s) if s == "safety" => Priority::Safety,
            other => return Err(StatusParseError::InvalidPriority(other.to_string())),
        };

        let in_reply_to = match &val["in_reply_to"] {
            Value::Null => None,
            Value::Number(n) => Some(
                n.as_u64()
                    .ok_or_else(|| StatusParseError::InvalidReplyTo(n.to_string()))?,
            ),
            other => return Err(StatusParseError::InvalidReplyTo(other.to_string())),
        };

        Ok(Self {
            source,
            payload,
            timestamp,
            priority,
            in_reply_to,
        })
    }

    /// Serialise the event into its JSON wire form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Returns true if the event is in the safety class.
    pub fn is_safety(&self) -> bool {
        self.priority == Priority::Safety
    }
}

impl From<StatusCmd> for StatusEvent {
    fn from(cmd: StatusCmd) -> Self {
        if cmd.safety {
            StatusEvent::safety(cmd.source, cmd.payload)
        } else {
            StatusEvent::new(cmd.source, cmd.payload)
        }
    }
}

impl SubsystemId {
    /// The lowercase wire name of the subsystem.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubsystemId::Drive => "drive",
            SubsystemId::Dig => "dig",
            SubsystemId::Dump => "dump",
            SubsystemId::Perception => "perception",
            SubsystemId::Load => "load",
            SubsystemId::Orientation => "orientation",
            SubsystemId::Recovery => "recovery",
            SubsystemId::Control => "control",
            SubsystemId::Watchdog => "watchdog",
        }
    }
}

impl FromStr for SubsystemId {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_SUBSYSTEMS
            .iter()
            .find(|id| id.as_str() == s)
            .copied()
            .ok_or_else(|| StatusParseError::UnknownSource(s.to_string()))
    }
}

impl Display for SubsystemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Routine
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
