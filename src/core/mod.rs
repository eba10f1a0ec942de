//! Service configuration and runtime wiring.

pub mod config;
pub mod runtime;
