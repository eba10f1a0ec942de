#![deny(clippy::all)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: dispatch tables are long by nature
#![allow(clippy::too_many_lines)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]

//! Rackline - the rack controller's link to the region.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::runtime` - Service wiring and lifecycle
//!
//! ## Networking
//! - `net::frame` - Length-framed JSON envelope codec
//! - `net::tls` - TLS identities for the region link
//! - `net::discovery` - Region event-loop discovery
//!
//! ## RPC
//! - `rpc::messages` - Operation catalog and fault taxonomy
//! - `rpc::connection` - Full-duplex connection handles
//! - `rpc::handshake` - TLS upgrade, identity, authentication, registration
//! - `rpc::pool` - Adaptive connection pool
//! - `rpc::dispatcher` - Region command handlers
//! - `rpc::health` - Connection liveness checks
//!
//! ## Drivers
//! - `drivers::power` - Power driver contract and registry
//! - `drivers::pod` - Pod driver contract and registry
//! - `drivers::chassis` - Chassis probe catalog
//! - `drivers::nos` - Network OS catalog
//!
//! ## External collaborators
//! - `external::dhcp` - DHCP server configuration
//! - `external::boot_images` - Boot image store and importer
//! - `external::sysinfo` - Host introspection
//! - `external::scan` - Network scanning
//! - `external::net` - Address-in-use probing
//! - `external::svc` - Host service control
//! - `external::tags` - Tag evaluation
//!
//! ## Utilities
//! - `util::lock` - Host-wide named locks
//! - `util::ident` - System id and shared secret
//! - `util::peers` - Saved region peer state
//!
//! ## Operations
//! - `ops::telemetry` - Logging setup

// Core infrastructure
pub mod core;

// Networking
pub mod net;

// RPC
pub mod rpc;

// Drivers and external collaborators
pub mod drivers;
pub mod external;

// Utilities
pub mod util;

// Operations
pub mod ops;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, runtime};
pub use ops::telemetry;
pub use rpc::{dispatcher, messages, pool};
