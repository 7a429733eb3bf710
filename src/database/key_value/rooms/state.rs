use crate::{
    database::{
        key_value::{join2, join3, prefixed},
        KeyValueDatabase,
    },
    mxid::{RoomId, UserId},
    service, utils, Error, Result,
};

impl service::rooms::state::Data for KeyValueDatabase {
    fn set_state(&self, room_id: &RoomId, kind: &str, state_key: &str, idx: u64) -> Result<()> {
        self.roomid_statekey.insert(
            &join3(room_id.as_bytes(), kind.as_bytes(), state_key.as_bytes()),
            &idx.to_be_bytes(),
        )
    }

    fn state_idx(&self, room_id: &RoomId, kind: &str, state_key: &str) -> Result<Option<u64>> {
        self.roomid_statekey
            .get(&join3(room_id.as_bytes(), kind.as_bytes(), state_key.as_bytes()))?
            .map(|bytes| {
                utils::u64_from_bytes(&bytes)
                    .map_err(|_| Error::bad_database("Invalid state index bytes."))
            })
            .transpose()
    }

    fn set_membership(&self, room_id: &RoomId, user_id: &UserId, membership: &str) -> Result<()> {
        self.roomid_membership.insert(
            &join2(room_id.as_bytes(), user_id.as_bytes()),
            membership.as_bytes(),
        )
    }

    fn membership(&self, room_id: &RoomId, user_id: &UserId) -> Result<Option<String>> {
        self.roomid_membership
            .get(&join2(room_id.as_bytes(), user_id.as_bytes()))?
            .map(|bytes| {
                utils::string_from_bytes(&bytes)
                    .map_err(|_| Error::bad_database("Invalid membership bytes."))
            })
            .transpose()
    }

    fn members_with(&self, room_id: &RoomId, membership: &str) -> Result<Vec<UserId>> {
        let prefix = prefixed(room_id.as_bytes());

        Ok(self
            .roomid_membership
            .scan_prefix(prefix.clone())
            .filter(|(_, value)| value.as_slice() == membership.as_bytes())
            .filter_map(|(key, _)| {
                key.get(prefix.len()..)
                    .and_then(|id| utils::string_from_bytes(id).ok())
                    .and_then(|id| UserId::parse(id).ok())
            })
            .collect())
    }
}
