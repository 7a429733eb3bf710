// =============================================================================
// Palaver Matrix Homeserver - Database Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   The concrete key-value database: named ordered trees opened from the
//   engine, one handle per persisted region. Service data traits are
//   implemented over these trees in the key_value submodule.
//
// Features:
//   • One tree per write-appendix region
//   • Engine-agnostic construction
//
// Dependencies:
//   • Tokio async runtime
//   • Serialization with serde
//
// References:
//   • Matrix spec: https://spec.matrix.org/
//
// =============================================================================

pub mod abstraction;
pub mod key_value;

use std::sync::Arc;

use abstraction::{KeyValueDatabaseEngine, KvTree, MemoryEngine};

use crate::{Config, Result};

pub struct KeyValueDatabase {
    _engine: Arc<dyn KeyValueDatabaseEngine>,

    /// Counters and the server signing keypair.
    pub(crate) global: Arc<dyn KvTree>,

    /// EventId -> event index (monotone u64 assigned at insertion).
    pub(crate) eventid_idx: Arc<dyn KvTree>,
    /// Event index -> EventId.
    pub(crate) idx_eventid: Arc<dyn KvTree>,
    /// Event index -> canonical event JSON.
    pub(crate) idx_pdujson: Arc<dyn KvTree>,

    /// RoomId + depth + index -> EventId. Depth-ordered room sequence.
    pub(crate) roomid_depth_idx: Arc<dyn KvTree>,
    /// RoomId + index -> depth. Index-ordered room sequence.
    pub(crate) roomid_idx: Arc<dyn KvTree>,
    /// RoomId + EventId -> referring event index. Prev/auth backlinks.
    pub(crate) referencedevents: Arc<dyn KvTree>,
    /// RoomId + EventId -> depth. Forward extremities (head set).
    pub(crate) roomid_head: Arc<dyn KvTree>,
    /// RoomId + EventId -> {depth, origin}. Heads beyond local knowledge.
    pub(crate) roomid_candidate_heads: Arc<dyn KvTree>,

    /// RoomId + type + state_key -> event index. Materialized current state.
    pub(crate) roomid_statekey: Arc<dyn KvTree>,
    /// RoomId + UserId -> membership. Joined/invited/banned bookkeeping.
    pub(crate) roomid_membership: Arc<dyn KvTree>,

    /// ServerName + key id -> key document. Peer public-key cache.
    pub(crate) server_signingkeys: Arc<dyn KvTree>,

    /// UserId + DeviceId -> display name.
    pub(crate) userid_devices: Arc<dyn KvTree>,
    /// UserId + DeviceId -> device keys JSON.
    pub(crate) userid_devicekeys: Arc<dyn KvTree>,
    /// Access token -> UserId.
    pub(crate) token_userid: Arc<dyn KvTree>,
}

impl KeyValueDatabase {
    /// Opens every tree on the bundled memory engine.
    pub fn load_or_create(config: &Config) -> Result<Self> {
        let engine = Arc::new(MemoryEngine::open(config)?);

        Ok(Self {
            global: engine.open_tree("global")?,
            eventid_idx: engine.open_tree("eventid_idx")?,
            idx_eventid: engine.open_tree("idx_eventid")?,
            idx_pdujson: engine.open_tree("idx_pdujson")?,
            roomid_depth_idx: engine.open_tree("roomid_depth_idx")?,
            roomid_idx: engine.open_tree("roomid_idx")?,
            referencedevents: engine.open_tree("referencedevents")?,
            roomid_head: engine.open_tree("roomid_head")?,
            roomid_candidate_heads: engine.open_tree("roomid_candidate_heads")?,
            roomid_statekey: engine.open_tree("roomid_statekey")?,
            roomid_membership: engine.open_tree("roomid_membership")?,
            server_signingkeys: engine.open_tree("server_signingkeys")?,
            userid_devices: engine.open_tree("userid_devices")?,
            userid_devicekeys: engine.open_tree("userid_devicekeys")?,
            token_userid: engine.open_tree("token_userid")?,
            _engine: engine,
        })
    }
}
