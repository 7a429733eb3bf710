use serde::{Deserialize, Serialize};

use crate::{
    database::{
        key_value::{join2, prefixed},
        KeyValueDatabase,
    },
    mxid::{EventId, RoomId, ServerName},
    service, utils, Error, Result,
};

#[derive(Deserialize, Serialize)]
struct CandidateHead {
    depth: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<ServerName>,
}

impl service::rooms::metadata::Data for KeyValueDatabase {
    fn mark_as_referenced(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        ref_idx: u64,
    ) -> Result<()> {
        self.referencedevents.insert(
            &join2(room_id.as_bytes(), event_id.as_bytes()),
            &ref_idx.to_be_bytes(),
        )
    }

    fn is_event_referenced(&self, room_id: &RoomId, event_id: &EventId) -> Result<bool> {
        Ok(self
            .referencedevents
            .get(&join2(room_id.as_bytes(), event_id.as_bytes()))?
            .is_some())
    }

    fn head_set(&self, room_id: &RoomId) -> Result<Vec<(EventId, i64)>> {
        let prefix = prefixed(room_id.as_bytes());

        self.roomid_head
            .scan_prefix(prefix.clone())
            .map(|(key, value)| {
                let event_id = key
                    .get(prefix.len()..)
                    .and_then(|id| utils::string_from_bytes(id).ok())
                    .and_then(|id| EventId::parse(id).ok())
                    .ok_or_else(|| Error::bad_database("Invalid head event id."))?;
                let depth = utils::u64_from_bytes(&value)
                    .map_err(|_| Error::bad_database("Invalid head depth bytes."))?
                    as i64;
                Ok((event_id, depth))
            })
            .collect()
    }

    fn replace_head(
        &self,
        room_id: &RoomId,
        remove: &[EventId],
        add: (&EventId, i64),
    ) -> Result<()> {
        for event_id in remove {
            self.roomid_head
                .remove(&join2(room_id.as_bytes(), event_id.as_bytes()))?;
        }

        let (event_id, depth) = add;
        self.roomid_head.insert(
            &join2(room_id.as_bytes(), event_id.as_bytes()),
            &(depth.max(0) as u64).to_be_bytes(),
        )
    }

    fn add_candidate_head(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        depth: i64,
        origin: Option<&ServerName>,
    ) -> Result<()> {
        let candidate = CandidateHead {
            depth,
            origin: origin.cloned(),
        };
        let value = serde_json::to_vec(&candidate)
            .map_err(|_| Error::bad_database("Failed to serialize candidate head."))?;

        self.roomid_candidate_heads
            .insert(&join2(room_id.as_bytes(), event_id.as_bytes()), &value)
    }

    fn remove_candidate_head(&self, room_id: &RoomId, event_id: &EventId) -> Result<()> {
        self.roomid_candidate_heads
            .remove(&join2(room_id.as_bytes(), event_id.as_bytes()))
    }

    fn candidate_heads(
        &self,
        room_id: &RoomId,
    ) -> Result<Vec<(EventId, i64, Option<ServerName>)>> {
        let prefix = prefixed(room_id.as_bytes());

        self.roomid_candidate_heads
            .scan_prefix(prefix.clone())
            .map(|(key, value)| {
                let event_id = key
                    .get(prefix.len()..)
                    .and_then(|id| utils::string_from_bytes(id).ok())
                    .and_then(|id| EventId::parse(id).ok())
                    .ok_or_else(|| Error::bad_database("Invalid candidate head event id."))?;
                let candidate: CandidateHead = serde_json::from_slice(&value)
                    .map_err(|_| Error::bad_database("Invalid candidate head value."))?;
                Ok((event_id, candidate.depth, candidate.origin))
            })
            .collect()
    }
}
