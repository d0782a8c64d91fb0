//! andamio: compose infrastructure from constructs, group it into stacks,
//! and synthesize per-stack artifacts with a dependency-safe apply order.
//!
//! Declaration and synthesis are synchronous and single-threaded. Cloud
//! calls are left to a [`backend::ProvisioningBackend`].

pub mod backend;
pub mod cli;
pub mod constructs;
pub mod core;
pub mod error;
pub mod ledger;
