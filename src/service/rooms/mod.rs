// =============================================================================
// Palaver Matrix Homeserver - Rooms Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   Aggregation of the per-room services: the DAG timeline store, the
//   metadata bookkeeping, the materialized state, the evaluation VM, the
//   authorization rules and the acquirer.
//
// Dependencies:
//   • Tokio async runtime
//
// References:
//   • Matrix spec: https://spec.matrix.org/v1.11/rooms/
//
// =============================================================================

pub mod acquire;
pub mod auth;
pub mod metadata;
pub mod state;
pub mod timeline;
pub mod vm;

pub trait Data: timeline::Data + metadata::Data + state::Data {}

impl<T: timeline::Data + metadata::Data + state::Data> Data for T {}

pub struct Service {
    pub timeline: timeline::Service,
    pub metadata: metadata::Service,
    pub state: state::Service,
    pub vm: vm::Service,
}
