// =============================================================================
// Palaver Matrix Homeserver - Room Authorization Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   Room version 1+ authorization rules applied by the evaluation pipeline:
//   create-event provenance, membership transitions under the join rules,
//   and power-level gating for state and timeline events. The same checker
//   runs against the auth chain referenced by an event and against the
//   current room state.
//
// Dependencies:
//   • Serialization with serde
//
// References:
//   • Matrix spec: https://spec.matrix.org/v1.11/rooms/v1/#authorization-rules
//
// =============================================================================

use serde_json::Value;

use crate::{
    mxid::UserId,
    service::pdu::{EventType, PduEvent},
    Error, ErrorKind, Result,
};

/// Effective power levels with the implicit defaults applied.
#[derive(Clone, Debug)]
pub struct PowerLevels {
    pub users_default: i64,
    pub events_default: i64,
    pub state_default: i64,
    pub ban: i64,
    pub kick: i64,
    pub redact: i64,
    pub invite: i64,
    users: Value,
    events: Value,
    /// Set when the room has no power-levels event; the creator then holds
    /// level 100 implicitly.
    creator: Option<UserId>,
}

impl PowerLevels {
    /// From a power-levels content object.
    pub fn from_content(content: &Value) -> Self {
        let level = |key: &str, default: i64| content.get(key).and_then(Value::as_i64).unwrap_or(default);

        Self {
            users_default: level("users_default", 0),
            events_default: level("events_default", 0),
            state_default: level("state_default", 50),
            ban: level("ban", 50),
            kick: level("kick", 50),
            redact: level("redact", 50),
            invite: level("invite", 0),
            users: content.get("users").cloned().unwrap_or(Value::Null),
            events: content.get("events").cloned().unwrap_or(Value::Null),
            creator: None,
        }
    }

    /// The implicit levels of a room without a power-levels event: the
    /// creator holds 100 and nothing is gated.
    pub fn implicit(creator: UserId) -> Self {
        Self {
            users_default: 0,
            events_default: 0,
            state_default: 0,
            ban: 50,
            kick: 50,
            redact: 50,
            invite: 0,
            users: Value::Null,
            events: Value::Null,
            creator: Some(creator),
        }
    }

    pub fn user_level(&self, user_id: &UserId) -> i64 {
        if self.creator.as_ref() == Some(user_id) {
            return 100;
        }

        self.users
            .get(user_id.as_str())
            .and_then(Value::as_i64)
            .unwrap_or(self.users_default)
    }

    pub fn event_level(&self, kind: &EventType, is_state: bool) -> i64 {
        self.events
            .get(kind.as_str())
            .and_then(Value::as_i64)
            .unwrap_or(if is_state {
                self.state_default
            } else {
                self.events_default
            })
    }
}

/// A snapshot of the state an event is authorized against. Built either
/// from the event's referenced auth chain or from the current room state.
pub struct AuthState {
    pub create: Option<PduEvent>,
    pub power_levels: Option<PduEvent>,
    pub join_rules: Option<PduEvent>,
    pub sender_membership: Option<String>,
    pub target_membership: Option<String>,
}

impl AuthState {
    fn levels(&self) -> Result<PowerLevels> {
        if let Some(pl) = &self.power_levels {
            return Ok(PowerLevels::from_content(&pl.content_value()?));
        }

        let creator = self
            .create
            .as_ref()
            .and_then(|c| c.content_value().ok())
            .and_then(|c| c.get("creator").and_then(Value::as_str).map(str::to_owned))
            .and_then(|c| UserId::parse(c).ok())
            .ok_or(Error::BadRequest(ErrorKind::Auth, "Room has no creator to anchor power levels"))?;

        Ok(PowerLevels::implicit(creator))
    }

    fn join_rule(&self) -> String {
        self.join_rules
            .as_ref()
            .and_then(|jr| jr.content_value().ok())
            .and_then(|c| c.get("join_rule").and_then(Value::as_str).map(str::to_owned))
            .unwrap_or_else(|| "invite".to_owned())
    }
}

fn deny(message: &'static str) -> Error {
    Error::BadRequest(ErrorKind::Auth, message)
}

/// Applies the authorization rules to `event` against `state`. Returns
/// `Err(Auth)` when the event is not authorized.
pub fn auth_check(event: &PduEvent, state: &AuthState) -> Result<()> {
    // Rule 1: the create event stands alone at the root of the DAG.
    if event.kind == EventType::RoomCreate {
        if !event.prev_events.is_empty() || !event.auth_events.is_empty() {
            return Err(deny("Create event must not reference prior events"));
        }

        if event.room_id.server_name() != event.sender.server_name() {
            return Err(deny("Create event sender must share the room's server"));
        }

        return Ok(());
    }

    // Rule 2: everything else descends from a create event.
    let Some(create) = &state.create else {
        return Err(deny("Event is not anchored to a create event"));
    };

    // Federation opt-out recorded at creation binds remote senders.
    let create_content = create.content_value()?;
    if create_content.get("m.federate").and_then(Value::as_bool) == Some(false)
        && event.sender.server_name() != create.sender.server_name()
    {
        return Err(deny("Room does not federate"));
    }

    let levels = state.levels()?;
    let sender_level = levels.user_level(&event.sender);
    let sender_membership = state.sender_membership.as_deref();

    if sender_membership == Some("ban") {
        return Err(deny("Sender is banned from the room"));
    }

    if event.kind == EventType::RoomMember {
        return member_check(event, state, &levels, sender_level);
    }

    // All remaining event kinds require a joined sender.
    if sender_membership != Some("join") {
        return Err(deny("Sender is not joined to the room"));
    }

    let required = levels.event_level(&event.kind, event.state_key.is_some());
    if sender_level < required {
        return Err(deny("Sender power level is insufficient for this event"));
    }

    match event.kind {
        EventType::RoomPowerLevels => power_levels_check(event, &levels, sender_level),
        EventType::RoomRedaction => {
            if sender_level < levels.redact {
                return Err(deny("Sender power level is insufficient to redact"));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn member_check(
    event: &PduEvent,
    state: &AuthState,
    levels: &PowerLevels,
    sender_level: i64,
) -> Result<()> {
    let content = event.content_value()?;
    let membership = content
        .get("membership")
        .and_then(Value::as_str)
        .ok_or(Error::BadRequest(ErrorKind::Invalid, "Member event without membership"))?;

    let target = event
        .state_key
        .as_deref()
        .ok_or(Error::BadRequest(ErrorKind::Invalid, "Member event without state_key"))?;
    let target = UserId::parse(target)?;

    let sender_membership = state.sender_membership.as_deref();
    let target_membership = state.target_membership.as_deref();
    let target_level = levels.user_level(&target);

    match membership {
        "join" => {
            if event.sender != target {
                return Err(deny("Cannot join on behalf of another user"));
            }

            if target_membership == Some("ban") {
                return Err(deny("User is banned from the room"));
            }

            // The creator's bootstrap join references only the create event.
            let creator_join = state
                .create
                .as_ref()
                .map(|c| c.sender == event.sender && event.prev_events.len() == 1)
                .unwrap_or(false);

            let allowed = creator_join
                || state.join_rule() == "public"
                || matches!(target_membership, Some("join") | Some("invite"));

            if !allowed {
                return Err(deny("Join rules do not allow this join"));
            }

            Ok(())
        }
        "invite" => {
            if sender_membership != Some("join") {
                return Err(deny("Inviter is not joined to the room"));
            }

            if matches!(target_membership, Some("join") | Some("ban")) {
                return Err(deny("Target cannot be invited in their current membership"));
            }

            if sender_level < levels.invite {
                return Err(deny("Sender power level is insufficient to invite"));
            }

            Ok(())
        }
        "leave" => {
            if event.sender == target {
                // Leaving (or rejecting an invite) is always allowed for
                // current members.
                if !matches!(sender_membership, Some("join") | Some("invite")) {
                    return Err(deny("Sender has no membership to renounce"));
                }
                return Ok(());
            }

            if sender_membership != Some("join") {
                return Err(deny("Kicker is not joined to the room"));
            }

            if sender_level < levels.kick || sender_level <= target_level {
                return Err(deny("Sender power level is insufficient to kick"));
            }

            Ok(())
        }
        "ban" => {
            if sender_membership != Some("join") {
                return Err(deny("Sender is not joined to the room"));
            }

            if sender_level < levels.ban || sender_level <= target_level {
                return Err(deny("Sender power level is insufficient to ban"));
            }

            Ok(())
        }
        _ => Err(Error::BadRequest(ErrorKind::Invalid, "Unknown membership state")),
    }
}

fn power_levels_check(event: &PduEvent, old: &PowerLevels, sender_level: i64) -> Result<()> {
    let content = event.content_value()?;
    let new = PowerLevels::from_content(&content);

    // No level may be raised above the sender's own.
    for level in [
        new.users_default,
        new.events_default,
        new.state_default,
        new.ban,
        new.kick,
        new.redact,
        new.invite,
    ] {
        if level > sender_level {
            return Err(deny("Cannot set a level above your own"));
        }
    }

    if let Some(users) = content.get("users").and_then(Value::as_object) {
        for (user, level) in users {
            let level = level.as_i64().unwrap_or(0);
            if level > sender_level {
                return Err(deny("Cannot promote a user above your own level"));
            }

            if user != event.sender.as_str() {
                let old_level = UserId::parse(user)
                    .map(|u| old.user_level(&u))
                    .unwrap_or(0);
                if old_level >= sender_level && level != old_level {
                    return Err(deny("Cannot change the level of a peer or superior"));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical;
    use crate::mxid::EventId;
    use serde_json::json;

    fn pdu(object: serde_json::Value) -> PduEvent {
        let object = match object {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        };
        PduEvent::from_object(&object).unwrap()
    }

    fn create_pdu() -> PduEvent {
        pdu(json!({
            "type": "m.room.create",
            "room_id": "!r:example.org",
            "sender": "@alice:example.org",
            "origin_server_ts": 1,
            "depth": 0,
            "prev_events": [],
            "auth_events": [],
            "content": {"creator": "@alice:example.org", "room_version": "5"}
        }))
    }

    fn state(sender_membership: Option<&str>, target_membership: Option<&str>) -> AuthState {
        AuthState {
            create: Some(create_pdu()),
            power_levels: None,
            join_rules: None,
            sender_membership: sender_membership.map(str::to_owned),
            target_membership: target_membership.map(str::to_owned),
        }
    }

    fn member(sender: &str, target: &str, membership: &str, prev: &[&str]) -> PduEvent {
        pdu(json!({
            "type": "m.room.member",
            "room_id": "!r:example.org",
            "sender": sender,
            "state_key": target,
            "origin_server_ts": 1,
            "depth": 1,
            "prev_events": prev,
            "auth_events": ["$create"],
            "content": {"membership": membership}
        }))
    }

    #[test]
    fn create_event_authorizes_itself() {
        let auth_state = AuthState {
            create: None,
            power_levels: None,
            join_rules: None,
            sender_membership: None,
            target_membership: None,
        };
        assert!(auth_check(&create_pdu(), &auth_state).is_ok());
    }

    #[test]
    fn create_event_from_foreign_server_is_denied() {
        let event = pdu(json!({
            "type": "m.room.create",
            "room_id": "!r:example.org",
            "sender": "@mallory:evil.example",
            "origin_server_ts": 1,
            "depth": 0,
            "prev_events": [],
            "auth_events": [],
            "content": {"creator": "@mallory:evil.example"}
        }));
        let auth_state = state(None, None);
        assert!(auth_check(&event, &auth_state).is_err());
    }

    #[test]
    fn creator_bootstrap_join_is_allowed() {
        let event = member("@alice:example.org", "@alice:example.org", "join", &["$create"]);
        assert!(auth_check(&event, &state(None, None)).is_ok());
    }

    #[test]
    fn uninvited_join_to_invite_room_is_denied() {
        let event = member("@bob:example.org", "@bob:example.org", "join", &["$x", "$y"]);
        assert!(auth_check(&event, &state(None, None)).is_err());
    }

    #[test]
    fn invited_join_is_allowed() {
        let event = member("@bob:example.org", "@bob:example.org", "join", &["$x", "$y"]);
        assert!(auth_check(&event, &state(None, Some("invite"))).is_ok());
    }

    #[test]
    fn banned_sender_is_denied() {
        let event = pdu(json!({
            "type": "m.room.message",
            "room_id": "!r:example.org",
            "sender": "@bob:example.org",
            "origin_server_ts": 1,
            "depth": 2,
            "prev_events": ["$x"],
            "auth_events": ["$create"],
            "content": {"body": "hi"}
        }));
        assert!(auth_check(&event, &state(Some("ban"), None)).is_err());
    }

    #[test]
    fn message_requires_join() {
        let event = pdu(json!({
            "type": "m.room.message",
            "room_id": "!r:example.org",
            "sender": "@bob:example.org",
            "origin_server_ts": 1,
            "depth": 2,
            "prev_events": ["$x"],
            "auth_events": ["$create"],
            "content": {"body": "hi"}
        }));
        assert!(auth_check(&event, &state(Some("join"), None)).is_ok());
        assert!(auth_check(&event, &state(None, None)).is_err());
    }

    #[test]
    fn invite_requires_joined_sender() {
        let event = member("@alice:example.org", "@bob:example.org", "invite", &["$x"]);
        assert!(auth_check(&event, &state(Some("join"), None)).is_ok());
        assert!(auth_check(&event, &state(None, None)).is_err());
    }

    #[test]
    fn kick_requires_higher_level_than_target() {
        // With implicit levels both users sit at 0, except the creator.
        let event = member("@bob:example.org", "@carol:example.org", "leave", &["$x"]);
        assert!(auth_check(&event, &state(Some("join"), Some("join"))).is_err());

        let by_creator = member("@alice:example.org", "@carol:example.org", "leave", &["$x"]);
        assert!(auth_check(&by_creator, &state(Some("join"), Some("join"))).is_ok());
    }

    #[test]
    fn power_levels_cannot_exceed_own() {
        let event = pdu(json!({
            "type": "m.room.power_levels",
            "room_id": "!r:example.org",
            "sender": "@alice:example.org",
            "state_key": "",
            "origin_server_ts": 1,
            "depth": 2,
            "prev_events": ["$x"],
            "auth_events": ["$create"],
            "content": {"users": {"@bob:example.org": 150}}
        }));
        assert!(auth_check(&event, &state(Some("join"), None)).is_err());
    }

    #[test]
    fn self_leave_is_allowed_from_invite() {
        let event = member("@bob:example.org", "@bob:example.org", "leave", &["$x"]);
        assert!(auth_check(&event, &state(Some("invite"), Some("invite"))).is_ok());
    }

    #[test]
    fn canonical_event_ids_parse() {
        // Guards the test fixtures above against MXID drift.
        assert!(EventId::parse("$create").is_ok());
        assert!(canonical::parse_object("{}").is_ok());
    }
}
