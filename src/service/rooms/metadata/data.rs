use crate::{
    mxid::{EventId, RoomId, ServerName},
    Result,
};

/// Storage surface for DAG bookkeeping: prev/auth backlinks, the forward
/// extremity head set, and candidate heads beyond local knowledge.
pub trait Data: Send + Sync {
    fn mark_as_referenced(&self, room_id: &RoomId, event_id: &EventId, ref_idx: u64)
        -> Result<()>;

    fn is_event_referenced(&self, room_id: &RoomId, event_id: &EventId) -> Result<bool>;

    /// The forward extremities of the room: `(event_id, depth)`.
    fn head_set(&self, room_id: &RoomId) -> Result<Vec<(EventId, i64)>>;

    /// Removes `remove` from and adds `add` to the head set atomically
    /// enough for a single writer.
    fn replace_head(
        &self,
        room_id: &RoomId,
        remove: &[EventId],
        add: (&EventId, i64),
    ) -> Result<()>;

    fn add_candidate_head(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        depth: i64,
        origin: Option<&ServerName>,
    ) -> Result<()>;

    fn remove_candidate_head(&self, room_id: &RoomId, event_id: &EventId) -> Result<()>;

    /// Head events claimed to exist beyond local knowledge:
    /// `(event_id, claimed_depth, origin_hint)`.
    fn candidate_heads(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<(EventId, i64, Option<ServerName>)>>;
}
