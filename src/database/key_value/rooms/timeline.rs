use serde_json::Value;

use crate::{
    canonical::{self, CanonicalObject},
    database::{
        key_value::{join2, prefixed},
        KeyValueDatabase,
    },
    mxid::{EventId, RoomId},
    service, utils, Error, Result,
};

/// Key under the room prefix: depth then index, both big-endian.
fn depth_key(room_id: &RoomId, depth: i64, idx: u64) -> Vec<u8> {
    let mut key = prefixed(room_id.as_bytes());
    key.extend_from_slice(&(depth.max(0) as u64).to_be_bytes());
    key.extend_from_slice(&idx.to_be_bytes());
    key
}

fn parse_depth_entry(prefix_len: usize, key: &[u8], value: &[u8]) -> Option<(i64, u64, EventId)> {
    let suffix = key.get(prefix_len..)?;
    let depth = utils::u64_from_bytes(suffix.get(..8)?).ok()? as i64;
    let idx = utils::u64_from_bytes(suffix.get(8..16)?).ok()?;
    let event_id = EventId::parse(utils::string_from_bytes(value).ok()?).ok()?;
    Some((depth, idx, event_id))
}

impl service::rooms::timeline::Data for KeyValueDatabase {
    fn index_of(&self, event_id: &EventId) -> Result<Option<u64>> {
        self.eventid_idx
            .get(event_id.as_bytes())?
            .map(|bytes| {
                utils::u64_from_bytes(&bytes)
                    .map_err(|_| Error::bad_database("Invalid event index bytes."))
            })
            .transpose()
    }

    fn event_id_at(&self, idx: u64) -> Result<Option<EventId>> {
        self.idx_eventid
            .get(&idx.to_be_bytes())?
            .map(|bytes| {
                let s = utils::string_from_bytes(&bytes)
                    .map_err(|_| Error::bad_database("Invalid event id bytes."))?;
                EventId::parse(s)
            })
            .transpose()
    }

    fn pdu_json_at(&self, idx: u64) -> Result<Option<CanonicalObject>> {
        self.idx_pdujson
            .get(&idx.to_be_bytes())?
            .map(|bytes| {
                let s = utils::string_from_bytes(&bytes)
                    .map_err(|_| Error::bad_database("Invalid event JSON bytes."))?;
                canonical::parse_object(&s)
            })
            .transpose()
    }

    fn index_pdu(
        &self,
        idx: u64,
        event_id: &EventId,
        json: Option<&CanonicalObject>,
    ) -> Result<()> {
        let idx_bytes = idx.to_be_bytes();
        self.eventid_idx.insert(event_id.as_bytes(), &idx_bytes)?;
        self.idx_eventid.insert(&idx_bytes, event_id.as_bytes())?;

        if let Some(json) = json {
            let serialized = canonical::to_canonical_string(&Value::Object(json.clone()))?;
            self.idx_pdujson.insert(&idx_bytes, serialized.as_bytes())?;
        }

        Ok(())
    }

    fn append_to_room(
        &self,
        room_id: &RoomId,
        depth: i64,
        idx: u64,
        event_id: &EventId,
    ) -> Result<()> {
        self.roomid_depth_idx
            .insert(&depth_key(room_id, depth, idx), event_id.as_bytes())?;
        self.roomid_idx.insert(
            &join2(room_id.as_bytes(), &idx.to_be_bytes()),
            &(depth.max(0) as u64).to_be_bytes(),
        )?;

        Ok(())
    }

    fn replace_pdu_json(&self, idx: u64, json: &CanonicalObject) -> Result<()> {
        let serialized = canonical::to_canonical_string(&Value::Object(json.clone()))?;
        self.idx_pdujson
            .insert(&idx.to_be_bytes(), serialized.as_bytes())
    }

    fn top(&self, room_id: &RoomId) -> Result<Option<(EventId, i64, u64)>> {
        let prefix = prefixed(room_id.as_bytes());

        // One past every possible depth/index suffix.
        let mut from = prefix.clone();
        from.extend_from_slice(&[0xff; 16]);

        Ok(self
            .roomid_depth_idx
            .iter_from(&from, true)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .find_map(|(key, value)| parse_depth_entry(prefix.len(), &key, &value))
            .map(|(depth, idx, event_id)| (event_id, depth, idx)))
    }

    fn events_from<'a>(
        &'a self,
        room_id: &RoomId,
        depth: i64,
        idx: u64,
        backwards: bool,
    ) -> Box<dyn Iterator<Item = (i64, u64, EventId)> + 'a> {
        let prefix = prefixed(room_id.as_bytes());
        let from = depth_key(room_id, depth, idx);
        let prefix_len = prefix.len();

        Box::new(
            self.roomid_depth_idx
                .iter_from(&from, backwards)
                .take_while(move |(key, _)| key.starts_with(&prefix))
                .filter_map(move |(key, value)| parse_depth_entry(prefix_len, &key, &value)),
        )
    }

    fn events_in_depth_range<'a>(
        &'a self,
        room_id: &RoomId,
        low: i64,
        high: i64,
    ) -> Box<dyn Iterator<Item = (i64, u64, EventId)> + 'a> {
        let prefix = prefixed(room_id.as_bytes());
        let from = depth_key(room_id, low, 0);
        let prefix_len = prefix.len();

        Box::new(
            self.roomid_depth_idx
                .iter_from(&from, false)
                .take_while(move |(key, _)| key.starts_with(&prefix))
                .filter_map(move |(key, value)| parse_depth_entry(prefix_len, &key, &value))
                .take_while(move |(depth, _, _)| *depth <= high),
        )
    }

    fn count_between(&self, room_id: &RoomId, low: u64, high: u64) -> Result<u64> {
        let prefix = prefixed(room_id.as_bytes());
        let from = join2(room_id.as_bytes(), &low.to_be_bytes());

        let count = self
            .roomid_idx
            .iter_from(&from, false)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .take_while(|(key, _)| {
                key.get(prefix.len()..)
                    .and_then(|suffix| utils::u64_from_bytes(suffix).ok())
                    .map(|idx| idx <= high)
                    .unwrap_or(false)
            })
            .count();

        Ok(count as u64)
    }
}
