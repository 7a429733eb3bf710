// =============================================================================
// Palaver Matrix Homeserver - Room Metadata Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   DAG bookkeeping around the timeline: which events have been referenced,
//   the room's forward-extremity head set, and the candidate heads other
//   servers claim exist beyond our local frontier.
//
// Dependencies:
//   • Structured logging with tracing
//
// References:
//   • Matrix spec: https://spec.matrix.org/v1.11/rooms/
//
// =============================================================================

mod data;

pub use data::Data;

use crate::{
    mxid::{EventId, RoomId, ServerName},
    Result,
};

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    pub fn mark_as_referenced(
        &self,
        room_id: &RoomId,
        event_ids: &[EventId],
        ref_idx: u64,
    ) -> Result<()> {
        for event_id in event_ids {
            self.db.mark_as_referenced(room_id, event_id, ref_idx)?;
        }

        Ok(())
    }

    pub fn is_event_referenced(&self, room_id: &RoomId, event_id: &EventId) -> Result<bool> {
        self.db.is_event_referenced(room_id, event_id)
    }

    pub fn head_set(&self, room_id: &RoomId) -> Result<Vec<(EventId, i64)>> {
        self.db.head_set(room_id)
    }

    /// Replaces referenced extremities with the newly appended event.
    pub fn replace_head(
        &self,
        room_id: &RoomId,
        referenced: &[EventId],
        new_head: (&EventId, i64),
    ) -> Result<()> {
        self.db.replace_head(room_id, referenced, new_head)
    }

    pub fn add_candidate_head(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        depth: i64,
        origin: Option<&ServerName>,
    ) -> Result<()> {
        self.db.add_candidate_head(room_id, event_id, depth, origin)
    }

    pub fn remove_candidate_head(&self, room_id: &RoomId, event_id: &EventId) -> Result<()> {
        self.db.remove_candidate_head(room_id, event_id)
    }

    pub fn candidate_heads(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<(EventId, i64, Option<ServerName>)>> {
        self.db.candidate_heads(room_id)
    }
}
