// =============================================================================
// Palaver Matrix Homeserver - Timeline Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   The room DAG store: indexes events, retrieves them by ID or index,
//   enumerates the room sequence in depth order, and measures the shape of
//   missing intervals (sounding and twain) used to size backfill requests.
//   Also constructs, hashes and signs locally-originated events.
//
// Features:
//   • Opaque monotone event indices as cheap primary keys
//   • Sounding/twain gap measurement over the depth sequence
//   • Missing-reference enumeration for the acquirer
//   • Local event construction with hash, signature and derived ID
//
// Architecture:
//   • All reads go through the storage trait; no locks on query paths
//
// Dependencies:
//   • Structured logging with tracing
//   • Serialization with serde
//
// References:
//   • Matrix spec: https://spec.matrix.org/v1.11/rooms/
//
// =============================================================================

mod data;

use std::collections::HashSet;

pub use data::Data;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    canonical::CanonicalObject,
    mxid::{EventId, RoomId, UserId},
    service::pdu::{self, EventType, PduBuilder, PduEvent, RoomVersion},
    services, Error, ErrorKind, Result,
};

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    /// Whether the event has been indexed locally.
    pub fn pdu_exists(&self, event_id: &EventId) -> Result<bool> {
        Ok(self.db.index_of(event_id)?.is_some())
    }

    pub fn index_of(&self, event_id: &EventId) -> Result<Option<u64>> {
        self.db.index_of(event_id)
    }

    pub fn event_id_at(&self, idx: u64) -> Result<Option<EventId>> {
        self.db.event_id_at(idx)
    }

    /// Returns the pdu at an index as its typed view. Stored wire objects
    /// for modern room versions carry no event_id field; it is restored
    /// from the index here.
    pub fn get_pdu_at(&self, idx: u64) -> Result<Option<PduEvent>> {
        match self.db.pdu_json_at(idx)? {
            Some(json) => {
                let mut pdu = PduEvent::from_object(&json)?;
                if pdu.event_id.is_none() {
                    pdu.event_id = self.db.event_id_at(idx)?;
                }
                Ok(Some(pdu))
            }
            None => Ok(None),
        }
    }

    /// Returns the pdu for an event ID.
    pub fn get_pdu(&self, event_id: &EventId) -> Result<Option<PduEvent>> {
        match self.db.index_of(event_id)? {
            Some(idx) => self.get_pdu_at(idx),
            None => Ok(None),
        }
    }

    /// Returns the stored JSON of a pdu.
    pub fn get_pdu_json(&self, event_id: &EventId) -> Result<Option<CanonicalObject>> {
        match self.db.index_of(event_id)? {
            Some(idx) => self.db.pdu_json_at(idx),
            None => Ok(None),
        }
    }

    /// The current frontier event of maximum depth.
    pub fn top(&self, room_id: &RoomId) -> Result<Option<(EventId, i64, u64)>> {
        self.db.top(room_id)
    }

    /// The configured recent-history depth window `(low, high)`.
    pub fn viewport(&self, room_id: &RoomId) -> Result<(i64, i64)> {
        let high = self.top(room_id)?.map(|(_, depth, _)| depth).unwrap_or(0);
        let size = services().globals.config.viewport_size as i64;
        Ok(((high - size).max(0), high))
    }

    /// Deepest contiguous depth reached from `ref` descending the room
    /// sequence without a break in depth numbering.
    pub fn sounding(&self, room_id: &RoomId, ref_id: &EventId) -> Result<(i64, u64)> {
        let ref_idx = self
            .db
            .index_of(ref_id)?
            .ok_or(Error::BadRequest(ErrorKind::NotFound, "Reference event is not indexed"))?;
        let ref_pdu = self
            .get_pdu_at(ref_idx)?
            .ok_or(Error::bad_database("Indexed event has no body"))?;

        let mut sound = (ref_pdu.depth, ref_idx);
        let mut prev_depth = ref_pdu.depth;
        for (depth, idx, _) in self.db.events_from(room_id, ref_pdu.depth, ref_idx, true) {
            if depth == prev_depth || depth == prev_depth - 1 {
                sound = (depth, idx);
                prev_depth = depth;
            } else {
                break;
            }
        }

        Ok(sound)
    }

    /// The first present depth below the break under the sounding, if the
    /// room has a gap beneath `ref`.
    pub fn twain(&self, room_id: &RoomId, ref_id: &EventId) -> Result<Option<(i64, u64)>> {
        let (sound_depth, sound_idx) = self.sounding(room_id, ref_id)?;

        for (depth, idx, _) in self.db.events_from(room_id, sound_depth, sound_idx, true) {
            if depth < sound_depth - 1 {
                return Ok(Some((depth, idx)));
            }
        }

        Ok(None)
    }

    /// Enumerates `(missing_id, ref_depth, ref_idx)` for events referenced
    /// by local events in the depth range but absent themselves. The
    /// callback returns false to stop.
    pub fn missing_in_range(
        &self,
        room_id: &RoomId,
        low: i64,
        high: i64,
        mut cb: impl FnMut(&EventId, i64, u64) -> Result<bool>,
    ) -> Result<()> {
        let mut reported: HashSet<EventId> = HashSet::new();

        for (ref_depth, ref_idx, _ref_id) in self.db.events_in_depth_range(room_id, low, high) {
            let Some(pdu) = self.get_pdu_at(ref_idx)? else {
                continue;
            };

            for referenced in pdu.prev_events.iter().chain(pdu.auth_events.iter()) {
                if self.db.index_of(referenced)?.is_some() {
                    continue;
                }

                if !reported.insert(referenced.clone()) {
                    continue;
                }

                if !cb(referenced, ref_depth, ref_idx)? {
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Number of room events between two indices inclusive.
    pub fn count_between(&self, room_id: &RoomId, low: u64, high: u64) -> Result<u64> {
        self.db.count_between(room_id, low, high)
    }

    /// Room events in depth order starting at `from`, for pagination.
    /// Yields `(idx, PduEvent)`.
    pub fn pdus_from<'a>(
        &'a self,
        room_id: &RoomId,
        from: &EventId,
        backwards: bool,
    ) -> Result<Box<dyn Iterator<Item = Result<(u64, PduEvent)>> + 'a>> {
        let idx = self
            .db
            .index_of(from)?
            .ok_or(Error::BadRequest(ErrorKind::NotFound, "Unknown pagination event"))?;
        let pdu = self
            .get_pdu_at(idx)?
            .ok_or(Error::bad_database("Indexed event has no body"))?;

        let iter = self
            .db
            .events_from(room_id, pdu.depth, idx, backwards)
            .map(move |(_, idx, _)| {
                let pdu = services()
                    .rooms
                    .timeline
                    .get_pdu_at(idx)?
                    .ok_or(Error::bad_database("Indexed event has no body"))?;
                Ok((idx, pdu))
            });

        Ok(Box::new(iter))
    }

    /// Up to `limit` events walking backward from each of `from`, as
    /// federation wire objects.
    pub fn backfill_pdus(
        &self,
        room_id: &RoomId,
        from: &[EventId],
        limit: usize,
    ) -> Result<Vec<CanonicalObject>> {
        let room_version = services().rooms.state.room_version(room_id)?;
        let mut out = Vec::new();
        let mut seen: HashSet<u64> = HashSet::new();

        for event_id in from {
            let Some(idx) = self.db.index_of(event_id)? else {
                continue;
            };
            let Some(pdu) = self.get_pdu_at(idx)? else {
                continue;
            };

            for (_, idx, _) in self.db.events_from(room_id, pdu.depth, idx, true) {
                if out.len() >= limit {
                    break;
                }

                if !seen.insert(idx) {
                    continue;
                }

                if let Some(pdu) = self.get_pdu_at(idx)? {
                    out.push(pdu.to_federation_object(room_version)?);
                }
            }
        }

        Ok(out)
    }

    /// Builds, hashes and signs a locally-originated event, placing it on
    /// the room's current frontier. No evaluation happens here; the caller
    /// feeds the object through the VM.
    pub fn create_hash_and_sign_event(
        &self,
        pdu_builder: PduBuilder,
        sender: &UserId,
        room_id: &RoomId,
        _mutex_lock: &tokio::sync::MutexGuard<'_, ()>,
    ) -> Result<(EventId, CanonicalObject)> {
        let PduBuilder {
            event_type,
            content,
            state_key,
            redacts,
            timestamp,
        } = pdu_builder;

        let prev_events: Vec<(EventId, i64)> = services()
            .rooms
            .metadata
            .head_set(room_id)?
            .into_iter()
            .take(20)
            .collect();

        // If there was no create event yet, assume we are creating a room.
        let room_version = match services().rooms.state.room_version(room_id) {
            Ok(version) => version,
            Err(_) if event_type == EventType::RoomCreate => content
                .get("room_version")
                .and_then(Value::as_str)
                .and_then(RoomVersion::parse)
                .ok_or(Error::BadRequest(ErrorKind::Invalid, "Unsupported room version"))?,
            Err(e) => return Err(e),
        };

        // Our depth is the maximum depth of prev_events + 1.
        let depth = prev_events
            .iter()
            .map(|(_, depth)| *depth)
            .max()
            .map(|d| d + 1)
            .unwrap_or(0);

        let auth_events = services().rooms.state.auth_event_ids(
            room_id,
            &event_type,
            sender,
            state_key.as_deref(),
            &content,
        )?;

        let mut object = CanonicalObject::new();
        object.insert("room_id".to_owned(), json!(room_id.as_str()));
        object.insert("sender".to_owned(), json!(sender.as_str()));
        object.insert(
            "origin".to_owned(),
            json!(services().globals.server_name().as_str()),
        );
        object.insert(
            "origin_server_ts".to_owned(),
            json!(timestamp.unwrap_or_else(crate::utils::millis_since_unix_epoch)),
        );
        object.insert("type".to_owned(), json!(event_type.as_str()));
        object.insert("content".to_owned(), content);
        object.insert("depth".to_owned(), json!(depth));
        object.insert(
            "prev_events".to_owned(),
            json!(prev_events.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>()),
        );
        object.insert(
            "auth_events".to_owned(),
            json!(auth_events.iter().map(EventId::as_str).collect::<Vec<_>>()),
        );

        if let Some(state_key) = &state_key {
            object.insert("state_key".to_owned(), json!(state_key));
        }

        if let Some(redacts) = &redacts {
            object.insert("redacts".to_owned(), json!(redacts.as_str()));
        }

        // Legacy identifiers are out-of-band and covered by the hashes, so
        // they go in before hashing; modern ones derive from the hashed
        // content and never appear on the wire.
        if room_version.server_based_ids() {
            let event_id =
                pdu::derive_event_id(&object, room_version, services().globals.server_name())?;
            object.insert("event_id".to_owned(), json!(event_id.as_str()));
        }

        // Hash, then sign over the essential projection.
        let hashes = pdu::make_hashes(&object)?;
        object.insert("hashes".to_owned(), hashes);

        pdu::sign(
            &mut object,
            services().globals.keypair(),
            services().globals.server_name(),
            services().globals.key_id(),
            room_version,
        )?;

        let serialized = crate::canonical::to_canonical_string(&Value::Object(object.clone()))?;
        if serialized.len() > services().globals.event_max_size() {
            return Err(Error::BadRequest(ErrorKind::Invalid, "Event exceeds maximum size"));
        }

        let event_id = match object.get("event_id").and_then(Value::as_str) {
            Some(event_id) => EventId::parse(event_id)?,
            None => pdu::derive_event_id(&object, room_version, services().globals.server_name())?,
        };

        debug!(event_id = event_id.as_str(), depth, "created local event");
        Ok((event_id, object))
    }

    /// Creates a local event and feeds it through the VM. This function
    /// takes the room state mutex, meaning only one writer mutates the room
    /// at a time.
    pub async fn build_and_append_pdu(
        &self,
        pdu_builder: PduBuilder,
        sender: &UserId,
        room_id: &RoomId,
        state_lock: &tokio::sync::MutexGuard<'_, ()>,
    ) -> Result<EventId> {
        let (event_id, object) =
            self.create_hash_and_sign_event(pdu_builder, sender, room_id, state_lock)?;

        // The state mutex is already held by our caller; the VM must not
        // re-acquire it.
        let opts = super::vm::Opts {
            state_lock_held: true,
            ..Default::default()
        };
        let outcome = services().rooms.vm.eval_one(object, &opts).await?;
        match outcome {
            super::vm::Outcome::Accepted { .. } => Ok(event_id),
            super::vm::Outcome::Rejected { fault, .. } => Err(Error::BadRequestString(
                ErrorKind::Auth,
                format!("Event was rejected by the {fault:?} pipeline fault"),
            )),
        }
    }
}
