//! The rack side of the region RPC link: message catalog, connection
//! lifecycle, handshake, pooling, dispatch and health checking.

pub mod connection;
pub mod dispatcher;
pub mod handshake;
pub mod health;
pub mod messages;
pub mod pool;
