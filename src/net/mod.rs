//! Transport plumbing: frame codec, TLS material, region endpoint discovery.

pub mod discovery;
pub mod frame;
pub mod tls;
