//! # Communications interface crate.
//!
//! Provides all common communications interfaces between the rover coordinator and the
//! subsystems it arbitrates.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Status events sent by the subsystems to the coordinator
pub mod status;

/// Command directives sent by the coordinator to the subsystems
pub mod directive;

/// Network module
pub mod net;
