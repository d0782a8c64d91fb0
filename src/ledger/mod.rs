//! Ledger: BLAKE3 hashing and the append-only deploy event log.

pub mod eventlog;
pub mod hasher;
