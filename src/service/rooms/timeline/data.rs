use crate::{
    canonical::CanonicalObject,
    mxid::{EventId, RoomId},
    Result,
};

/// Storage surface for the room DAG: the global event index plus the
/// per-room depth- and index-ordered sequences.
pub trait Data: Send + Sync {
    /// The index assigned to an event, if it has been indexed.
    fn index_of(&self, event_id: &EventId) -> Result<Option<u64>>;

    /// The event ID at an index.
    fn event_id_at(&self, idx: u64) -> Result<Option<EventId>>;

    /// The stored canonical JSON of the event at an index.
    fn pdu_json_at(&self, idx: u64) -> Result<Option<CanonicalObject>>;

    /// Inserts an event into the global index trees. The body is stored
    /// only when `json` is given; the ID mapping is always written.
    fn index_pdu(&self, idx: u64, event_id: &EventId, json: Option<&CanonicalObject>)
        -> Result<()>;

    /// Appends an indexed event to the room's depth and index sequences.
    fn append_to_room(&self, room_id: &RoomId, depth: i64, idx: u64, event_id: &EventId)
        -> Result<()>;

    /// Replaces the stored JSON of an already-indexed event (redaction).
    fn replace_pdu_json(&self, idx: u64, json: &CanonicalObject) -> Result<()>;

    /// The frontier event of maximum depth: `(event_id, depth, idx)`.
    fn top(&self, room_id: &RoomId) -> Result<Option<(EventId, i64, u64)>>;

    /// Room entries in depth order starting at `(depth, idx)`, descending
    /// when `backwards`. Yields `(depth, idx, event_id)`.
    fn events_from<'a>(
        &'a self,
        room_id: &RoomId,
        depth: i64,
        idx: u64,
        backwards: bool,
    ) -> Box<dyn Iterator<Item = (i64, u64, EventId)> + 'a>;

    /// Room entries with depth in `[low, high]`, ascending.
    fn events_in_depth_range<'a>(
        &'a self,
        room_id: &RoomId,
        low: i64,
        high: i64,
    ) -> Box<dyn Iterator<Item = (i64, u64, EventId)> + 'a>;

    /// Number of room events with index in `[low, high]`.
    fn count_between(&self, room_id: &RoomId, low: u64, high: u64) -> Result<u64>;
}
