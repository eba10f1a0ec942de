//! Shared utilities: cross-process locks, durable peer state, identity files.

pub mod ident;
pub mod lock;
pub mod peers;
