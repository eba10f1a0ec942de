//! Driver contracts and their lookup tables.
//!
//! The RPC layer treats every hardware driver as an opaque async call with a
//! context. Registries are built once at startup and injected wherever they
//! are needed, so tests substitute fakes by constructing their own.

pub mod chassis;
pub mod nos;
pub mod pod;
pub mod power;
