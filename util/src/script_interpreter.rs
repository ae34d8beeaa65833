//! # Event script interpreter module
//!
//! This module provides an interpreter for rover event scripts, allowing status events to be
//! replayed into the coordinator at scripted times instead of being received from the network.
//!
//! A script holds one `<time_s>: <status event JSON>;` statement per line. Blank lines and lines
//! starting with `//` or `#` are ignored. The statement runs up to the last `;` on its line, so
//! payloads may themselves contain `;`. For example:
//!
//! ```text
//! // Drive out and back
//! 0.5: {"source": "drive", "payload": "goal_received"};
//! 4.0: {"source": "drive", "payload": "goal_reached; odometry reset"};
//! ```

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use regex::Regex;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

// Internal
use comms_if::status::{StatusEvent, StatusParseError};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// An event which is scripted to occur at a specific time.
struct ScriptedEvent {
    /// The time the event is supposed to be released at
    exec_time_s: f64,

    /// The event to release
    event: StatusEvent
}

/// A script interpreter.
///
/// After loading the script use `.get_pending_events()` to acquire the events which are due.
pub struct ScriptInterpreter {
    _script_path: Option<PathBuf>,
    events: VecDeque<ScriptedEvent>
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Could not find the script at {0:?}")]
    ScriptNotFound(PathBuf),

    #[error("Could not load the script: {0}")]
    ScriptLoadError(std::io::Error),

    #[error("The script contains no events")]
    ScriptEmpty,

    #[error(
        "Script line {0} is not a `<time_s>: <event>;` statement or a comment: {1:?}"
    )]
    InvalidLine(usize, String),

    #[error(
        "Script contains an invalid timestamp: {0}. \
        Should be a float (like 1.0)")]
    InvalidTimestamp(String),

    #[error("Script timestamps must not decrease, found {0} s after {1} s")]
    OutOfOrder(f64, f64),

    #[error("Script contains an invalid event at {0} s: {1}")]
    InvalidEvent(f64, StatusParseError)
}

/// Events released by the interpreter.
#[derive(Debug)]
pub enum PendingEvents {
    None,
    Some(Vec<StatusEvent>),
    EndOfScript
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl ScriptInterpreter {

    /// Create a new interpreter from the given script path.
    pub fn new<P: AsRef<Path>>(script_path: P) -> Result<Self, ScriptError> {
        let path = PathBuf::from(script_path.as_ref());

        if !path.exists() {
            return Err(ScriptError::ScriptNotFound(path));
        }

        let script = fs::read_to_string(&path)
            .map_err(ScriptError::ScriptLoadError)?;

        let mut si = Self::from_script(&script)?;
        si._script_path = Some(path);

        Ok(si)
    }

    /// Create a new interpreter from the script's text.
    pub fn from_script(script: &str) -> Result<Self, ScriptError> {
        let mut queue: VecDeque<ScriptedEvent> = VecDeque::new();

        let re = Regex::new(r"^([^:\s]+)\s*:\s*(.*);$").expect("Script regex is invalid");

        for (line_idx, raw_line) in script.lines().enumerate() {
            let line = raw_line.trim();

            if line.is_empty() || line.starts_with("//") || line.starts_with('#') {
                continue;
            }

            let cap = re
                .captures(line)
                .ok_or_else(|| ScriptError::InvalidLine(line_idx + 1, line.to_string()))?;

            let time_str = &cap[1];
            let exec_time_s: f64 = time_str
                .parse()
                .map_err(|_| ScriptError::InvalidTimestamp(time_str.to_string()))?;

            if !exec_time_s.is_finite() || exec_time_s < 0.0 {
                return Err(ScriptError::InvalidTimestamp(time_str.to_string()));
            }

            if let Some(last) = queue.back() {
                if exec_time_s < last.exec_time_s {
                    return Err(ScriptError::OutOfOrder(exec_time_s, last.exec_time_s));
                }
            }

            let event = StatusEvent::from_json(&cap[2])
                .map_err(|e| ScriptError::InvalidEvent(exec_time_s, e))?;

            queue.push_back(ScriptedEvent { exec_time_s, event });
        }

        if queue.is_empty() {
            return Err(ScriptError::ScriptEmpty)
        }

        Ok(ScriptInterpreter {
            _script_path: None,
            events: queue
        })
    }

    /// Return the events whose scheduled time is at or before `current_time_s`.
    ///
    /// Events are released in script order.
    pub fn get_pending_events(&mut self, current_time_s: f64) -> PendingEvents {
        if self.events.is_empty() {
            return PendingEvents::EndOfScript
        }

        let mut due = vec![];

        while let Some(front) = self.events.front() {
            if front.exec_time_s > current_time_s {
                break;
            }
            if let Some(e) = self.events.pop_front() {
                due.push(e.event);
            }
        }

        if due.is_empty() {
            PendingEvents::None
        }
        else {
            PendingEvents::Some(due)
        }
    }

    /// Get the number of events remaining in the script
    pub fn get_num_events(&self) -> usize {
        self.events.len()
    }

    /// Get the length of the script in seconds
    pub fn get_duration(&self) -> f64 {
        self.events.back().map(|e| e.exec_time_s).unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use comms_if::status::SubsystemId;

    const SCRIPT: &str = r#"
        // Drive out, then dig
        0.5: {"source": "drive", "payload": "goal_received"};
        2.0: {"source": "drive", "payload": "goal_reached"};
        2.0: {"source": "dig", "payload": "load_full", "priority": "safety"};
    "#;

    #[test]
    fn test_pending_events() {
        let mut si = ScriptInterpreter::from_script(SCRIPT).unwrap();

        assert_eq!(si.get_num_events(), 3);
        assert_eq!(si.get_duration(), 2.0);

        assert!(matches!(si.get_pending_events(0.1), PendingEvents::None));

        match si.get_pending_events(0.5) {
            PendingEvents::Some(evs) => {
                assert_eq!(evs.len(), 1);
                assert_eq!(evs[0].source, SubsystemId::Drive);
                assert_eq!(evs[0].payload, "goal_received");
            }
            other => panic!("Expected one event, got {:?}", other),
        }

        match si.get_pending_events(10.0) {
            PendingEvents::Some(evs) => {
                assert_eq!(evs.len(), 2);
                assert_eq!(evs[0].payload, "goal_reached");
                assert!(evs[1].is_safety());
            }
            other => panic!("Expected two events, got {:?}", other),
        }

        assert!(matches!(si.get_pending_events(11.0), PendingEvents::EndOfScript));
    }

    #[test]
    fn test_comments_and_separators() {
        let mut si = ScriptInterpreter::from_script(
            r#"
            // Comments may contain colons: like this; and this
            # 9.0: {"source": "dig", "payload": "commented out"};
            1.0: {"source": "drive", "payload": "goal_reached; odometry reset"};
            "#,
        )
        .unwrap();

        assert_eq!(si.get_num_events(), 1);
        match si.get_pending_events(1.0) {
            PendingEvents::Some(evs) => assert_eq!(evs[0].payload, "goal_reached; odometry reset"),
            other => panic!("Expected one event, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_scripts() {
        assert!(matches!(
            ScriptInterpreter::from_script("// nothing to see here\n\n"),
            Err(ScriptError::ScriptEmpty)
        ));
        assert!(matches!(
            ScriptInterpreter::from_script("nothing to see here"),
            Err(ScriptError::InvalidLine(1, _))
        ));

        // A missing terminator is reported rather than running into the next statement
        assert!(matches!(
            ScriptInterpreter::from_script(
                r#"1.0: {"source": "dig", "payload": "x"}
                2.0: {"source": "dig", "payload": "y"};"#
            ),
            Err(ScriptError::InvalidLine(1, _))
        ));
        assert!(matches!(
            ScriptInterpreter::from_script(r#"soon: {"source": "dig", "payload": "x"};"#),
            Err(ScriptError::InvalidTimestamp(_))
        ));
        assert!(matches!(
            ScriptInterpreter::from_script(
                r#"2.0: {"source": "dig", "payload": "x"};
                1.0: {"source": "dig", "payload": "y"};"#
            ),
            Err(ScriptError::OutOfOrder(_, _))
        ));
        assert!(matches!(
            ScriptInterpreter::from_script(r#"1.0: {"source": "laser", "payload": "x"};"#),
            Err(ScriptError::InvalidEvent(_, StatusParseError::UnknownSource(_)))
        ));
    }

    #[test]
    fn test_shipped_script() {
        let si = ScriptInterpreter::from_script(include_str!("../../scripts/dig_cycle.evs"))
            .unwrap();

        assert_eq!(si.get_num_events(), 9);
        assert_eq!(si.get_duration(), 12.0);
    }

    #[test]
    fn test_missing_script() {
        assert!(matches!(
            ScriptInterpreter::new("/no/such/script.rs"),
            Err(ScriptError::ScriptNotFound(_))
        ));
    }
}
