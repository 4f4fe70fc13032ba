//! Medley - self-hosted media library manager
//!
//! Hosts out-of-process plugins (indexers, downloaders, UI extensions)
//! behind a supervised RPC boundary and aggregates search across them.
//!
//! This library exposes the core functionality of medley for the CLI
//! binary, bundled plugins, and integration testing.

pub mod bridge;
pub mod config;
pub mod manifest;
pub mod protocol;
pub mod rpc;
pub mod sdk;
pub mod search;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod transport;
