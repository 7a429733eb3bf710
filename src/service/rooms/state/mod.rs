// =============================================================================
// Palaver Matrix Homeserver - Room State Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   Materialized current room state: the (type, state_key) map maintained
//   by the VM's commit path, the membership bookkeeping derived from it,
//   the power-levels cache, and the auth-event selection used when
//   constructing local events.
//
// Features:
//   • Room version resolution from the create event
//   • Power-levels content cache, invalidated by the effects phase
//   • Auth-event selection per event type
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

use std::{collections::HashMap, sync::Mutex as StdMutex};

pub use data::Data;
use serde_json::Value;

use crate::{
    mxid::{RoomId, UserId},
    service::pdu::{EventType, PduEvent, RoomVersion},
    services, Error, ErrorKind, Result,
};

pub struct Service {
    pub db: &'static dyn Data,

    pub power_levels_cache: StdMutex<HashMap<RoomId, Value>>,
}

impl Service {
    /// The current state event for `(type, state_key)`, if any.
    pub fn state_get(
        &self,
        room_id: &RoomId,
        kind: &EventType,
        state_key: &str,
    ) -> Result<Option<PduEvent>> {
        match self.db.state_idx(room_id, kind.as_str(), state_key)? {
            Some(idx) => services().rooms.timeline.get_pdu_at(idx),
            None => Ok(None),
        }
    }

    pub fn set_state(
        &self,
        room_id: &RoomId,
        kind: &EventType,
        state_key: &str,
        idx: u64,
    ) -> Result<()> {
        self.db.set_state(room_id, kind.as_str(), state_key, idx)
    }

    /// Whether a create event is known for this room.
    pub fn room_exists(&self, room_id: &RoomId) -> Result<bool> {
        Ok(self
            .db
            .state_idx(room_id, EventType::RoomCreate.as_str(), "")?
            .is_some())
    }

    /// The room version from the create event content.
    pub fn room_version(&self, room_id: &RoomId) -> Result<RoomVersion> {
        let create = self
            .state_get(room_id, &EventType::RoomCreate, "")?
            .ok_or(Error::BadRequest(ErrorKind::NotFound, "Room has no create event"))?;

        let content = create.content_value()?;
        let version = content
            .get("room_version")
            .and_then(Value::as_str)
            .unwrap_or("1");

        RoomVersion::parse(version)
            .ok_or(Error::BadRequest(ErrorKind::Invalid, "Unsupported room version"))
    }

    pub fn update_membership(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        membership: &str,
    ) -> Result<()> {
        self.db.set_membership(room_id, user_id, membership)
    }

    pub fn membership(&self, room_id: &RoomId, user_id: &UserId) -> Result<Option<String>> {
        self.db.membership(room_id, user_id)
    }

    pub fn is_joined(&self, room_id: &RoomId, user_id: &UserId) -> Result<bool> {
        Ok(self.membership(room_id, user_id)?.as_deref() == Some("join"))
    }

    pub fn room_members(&self, room_id: &RoomId) -> Result<Vec<UserId>> {
        self.db.members_with(room_id, "join")
    }

    /// The current power-levels content, from cache when warm. Rooms
    /// without a power-levels event fall back to the implicit defaults.
    pub fn power_levels(&self, room_id: &RoomId) -> Result<Value> {
        if let Some(cached) = self.power_levels_cache.lock().unwrap().get(room_id) {
            return Ok(cached.clone());
        }

        let content = match self.state_get(room_id, &EventType::RoomPowerLevels, "")? {
            Some(pdu) => pdu.content_value()?,
            None => Value::Object(Default::default()),
        };

        self.power_levels_cache
            .lock()
            .unwrap()
            .insert(room_id.clone(), content.clone());
        Ok(content)
    }

    /// Drops the cached power-levels content after a state change.
    pub fn invalidate_power_levels(&self, room_id: &RoomId) {
        self.power_levels_cache.lock().unwrap().remove(room_id);
    }

    /// Selects the auth events referenced by a new local event: the create
    /// event, the current power levels, the sender's membership, and for
    /// membership changes the join rules and the target's membership.
    pub fn auth_event_ids(
        &self,
        room_id: &RoomId,
        kind: &EventType,
        sender: &UserId,
        state_key: Option<&str>,
        _content: &Value,
    ) -> Result<Vec<crate::mxid::EventId>> {
        let mut out = Vec::new();

        if *kind == EventType::RoomCreate {
            return Ok(out);
        }

        let mut push = |pdu: Option<PduEvent>| {
            if let Some(pdu) = pdu {
                if let Some(event_id) = pdu.event_id {
                    out.push(event_id);
                }
            }
        };

        push(self.state_get(room_id, &EventType::RoomCreate, "")?);
        push(self.state_get(room_id, &EventType::RoomPowerLevels, "")?);
        push(self.state_get(room_id, &EventType::RoomMember, sender.as_str())?);

        if *kind == EventType::RoomMember {
            push(self.state_get(room_id, &EventType::RoomJoinRules, "")?);

            if let Some(target) = state_key {
                if target != sender.as_str() {
                    push(self.state_get(room_id, &EventType::RoomMember, target)?);
                }
            }
        }

        Ok(out)
    }
}
