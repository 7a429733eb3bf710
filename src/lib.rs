// =============================================================================
// Palaver Matrix Homeserver - Library Root
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   Crate root for the Palaver homeserver core. Wires together the canonical
//   JSON codec, the Matrix event model, the room DAG services (timeline,
//   metadata, state, acquirer, evaluation VM) and the HTTP resource layer.
//
// Features:
//   • Canonical JSON serialization and event hashing/signing
//   • Room DAG storage with gap measurement (sounding/twain)
//   • Concurrent backfill acquisition from federation peers
//   • Staged event evaluation pipeline with fault masks
//
// Architecture:
//   • Async/await native implementation on Tokio
//   • Trait-based storage abstraction with bundled memory engine
//   • Per-room cooperative serialization
//
// Dependencies:
//   • Tokio async runtime
//   • Structured logging with tracing
//   • Error handling with thiserror
//   • Serialization with serde
//
// References:
//   • Matrix.org specification: https://matrix.org/
//   • Matrix spec: https://spec.matrix.org/
//
// =============================================================================

pub mod api;
pub mod canonical;
pub mod config;
pub mod database;
pub mod mxid;
pub mod service;
pub mod utils;

#[doc(hidden)]
pub mod test_utils;

use std::sync::RwLock;

pub use config::Config;
pub use database::KeyValueDatabase;
pub use service::{pdu::PduEvent, Services};
pub use utils::error::{Error, ErrorKind, Result};

static SERVICES: RwLock<Option<&'static Services>> = RwLock::new(None);

/// Returns the global services handle.
///
/// Panics if called before `init_services` during startup.
pub fn services() -> &'static Services {
    SERVICES
        .read()
        .unwrap()
        .expect("SERVICES should be initialized when this is called")
}

/// Installs the global services handle. Called once at startup after the
/// database and service container have been built and leaked to 'static.
pub fn init_services(services: &'static Services) {
    *SERVICES.write().unwrap() = Some(services);
}
