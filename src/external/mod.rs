//! Interfaces to everything outside the process: the DHCP server, the boot
//! image store, host introspection, network scanning, service control and
//! tag evaluation. Each is a trait so the dispatcher can be tested without
//! touching the host.

pub mod boot_images;
pub mod dhcp;
pub mod net;
pub mod scan;
pub mod svc;
pub mod sysinfo;
pub mod tags;
