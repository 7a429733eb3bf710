use crate::{
    mxid::{RoomId, UserId},
    Result,
};

/// Storage surface for the materialized current room state and the
/// membership bookkeeping derived from it.
pub trait Data: Send + Sync {
    fn set_state(&self, room_id: &RoomId, kind: &str, state_key: &str, idx: u64) -> Result<()>;

    fn state_idx(&self, room_id: &RoomId, kind: &str, state_key: &str) -> Result<Option<u64>>;

    fn set_membership(&self, room_id: &RoomId, user_id: &UserId, membership: &str) -> Result<()>;

    fn membership(&self, room_id: &RoomId, user_id: &UserId) -> Result<Option<String>>;

    fn members_with(&self, room_id: &RoomId, membership: &str) -> Result<Vec<UserId>>;
}
