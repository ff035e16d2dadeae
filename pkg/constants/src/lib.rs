//! Centralized constants for the carton runtime.
//!
//! All contractual paths and network-plan values live here.
//! Change a value in one place and it applies everywhere.

pub mod network;
pub mod paths;
