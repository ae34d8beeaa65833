//! # Coordinator library
//!
//! The rover's high-level coordinator: a rule-driven state machine which turns subsystem status
//! events into operating state changes and command directives.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Coordinator actor - runs the coordinator on its own thread
pub mod actor;

/// Coordinator - owns the operating state and evaluates the rules
pub mod coordinator;

/// Directive client - delivers directives to the subsystems over the network
pub mod directive_client;

/// Command dispatch - delivers directives with retries and reports failures
pub mod dispatch;

/// Event ingress - the priority queue between producers and the coordinator
pub mod ingress;

/// Parameters of the coordinator executable
pub mod params;

/// Transition rules and their validation
pub mod rules;

/// Operating states
pub mod state;

/// Status server - recieves status events from the network
pub mod status_server;

/// Telemetry server - publishes state updates
pub mod tm_server;
