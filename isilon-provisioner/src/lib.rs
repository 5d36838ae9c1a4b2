//! Isilon dynamic volume provisioner
//!
//! Creates, exports and quota-limits volumes on a OneFS appliance for
//! cluster volume claims, and tears them down again when the claim goes away.

// Core modules
pub mod config;
pub mod logging;

// Provisioning
pub mod backend;
pub mod provisioner;
pub mod quota;
pub mod quantity;

// Controller plumbing
pub mod driver;
pub mod shutdown;

pub use provisioner::Provisioner;
