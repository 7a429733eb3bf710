// =============================================================================
// Palaver Matrix Homeserver - Room Creation Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   POST /_matrix/client/r0/createRoom. Commits the create event first;
//   from that point the room exists and every subsequent step records its
//   failure into the response errors array instead of aborting.
//
// Features:
//   • Spec presets: private_chat, public_chat, trusted_private_chat
//   • Initial state vector, name/topic overrides, invite loop
//   • Per-step error accumulation
//
// Dependencies:
//   • HTTP routing with axum
//   • Serialization with serde
//   • Structured logging with tracing
//
// References:
//   • Matrix spec: https://spec.matrix.org/v1.11/client-server-api/#post_matrixclientv3createroom
//
// =============================================================================

use axum::{http::HeaderMap, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::{
    mxid::{RoomId, UserId},
    service::pdu::{EventType, PduBuilder},
    services, Error, ErrorKind, Result,
};

/// 14.2.1.3: the room name MUST NOT exceed 255 bytes.
const NAME_MAX_LEN: usize = 255;

/// The number of creation-content keys carried into the create event.
const CREATION_CONTENT_MAX_KEYS: usize = 16;

const SPEC_PRESETS: &[&str] = &["private_chat", "public_chat", "trusted_private_chat"];

fn spec_preset(preset: &str) -> bool {
    SPEC_PRESETS.contains(&preset)
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateRoomBody {
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub room_version: Option<String>,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub invite: Vec<String>,
    #[serde(default)]
    pub initial_state: Vec<InitialStateEvent>,
    #[serde(default)]
    pub power_level_content_override: Option<Value>,
    #[serde(default)]
    pub creation_content: Option<Value>,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub is_direct: bool,
    #[serde(default)]
    pub guest_can_join: bool,
    #[serde(default)]
    pub parent_room_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InitialStateEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub state_key: String,
    pub content: Value,
}

#[derive(Serialize)]
pub struct CreateRoomResponse {
    pub room_id: String,
    pub errors: Vec<String>,
}

/// Records a non-fatal step failure into the response errors array.
fn report_error(errors: &mut Vec<String>, room_id: &RoomId, user_id: &UserId, message: String) {
    warn!(
        room_id = room_id.as_str(),
        user_id = user_id.as_str(),
        "error when creating room: {}",
        message
    );
    errors.push(message);
}

pub async fn create_room_route(
    headers: HeaderMap,
    Json(body): Json<CreateRoomBody>,
) -> Result<impl IntoResponse> {
    let sender = super::authenticated_user(&headers)?;
    let (room_id, errors) = create_room(body, &sender).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateRoomResponse {
            room_id: room_id.as_str().to_owned(),
            errors,
        }),
    ))
}

/// Creates a room for `sender` and returns its ID together with the
/// non-fatal errors accumulated along the way.
pub async fn create_room(
    mut body: CreateRoomBody,
    sender: &UserId,
) -> Result<(RoomId, Vec<String>)> {
    // The room version and creator are unconditionally server-assigned.
    body.room_version = Some(services().globals.config.default_room_version.clone());
    body.creator = Some(sender.as_str().to_owned());

    // Presets outside the specification are cleared, not rejected.
    if let Some(preset) = &body.preset {
        if !spec_preset(preset) {
            body.preset = None;
        }
    }

    let room_id = RoomId::generate(services().globals.server_name());
    let mut errors = Vec::new();

    create(&body, sender, &room_id, &mut errors).await?;

    Ok((room_id, errors))
}

/// The room creation sequence. The create event commits first; afterwards
/// the room officially exists and no step may abort the whole process, so
/// failures accumulate into `errors`. Direct-chat invite failure is the
/// one exception.
async fn create(
    body: &CreateRoomBody,
    creator: &UserId,
    room_id: &RoomId,
    errors: &mut Vec<String>,
) -> Result<()> {
    let mutex = services().globals.room_mutex_state(room_id).await;
    let state_lock = mutex.lock().await;

    let preset = body.preset.as_deref().unwrap_or_default();

    // Initial create event is committed here first.
    create_event(body, creator, room_id, &state_lock).await?;

    // Creator join event.
    if let Err(e) = services()
        .rooms
        .timeline
        .build_and_append_pdu(
            PduBuilder::state(
                EventType::RoomMember,
                creator.as_str(),
                json!({ "membership": "join" }),
            ),
            creator,
            room_id,
            &state_lock,
        )
        .await
    {
        report_error(errors, room_id, creator, format!("Failed to join creator: {e}"));
    }

    // Initial power_levels.
    let power_content = match &body.power_level_content_override {
        Some(content) => content.clone(),
        None => default_power_levels(creator, preset, &body.invite),
    };

    if let Err(e) = services()
        .rooms
        .timeline
        .build_and_append_pdu(
            PduBuilder::state(EventType::RoomPowerLevels, "", power_content),
            creator,
            room_id,
            &state_lock,
        )
        .await
    {
        report_error(errors, room_id, creator, format!("Failed to set power_levels: {e}"));
    }

    // Initial join_rules; the invite default needs no event.
    let join_rule = match preset {
        "public_chat" => "public",
        _ => "invite",
    };

    if join_rule != "invite" {
        if let Err(e) = services()
            .rooms
            .timeline
            .build_and_append_pdu(
                PduBuilder::state(EventType::RoomJoinRules, "", json!({ "join_rule": join_rule })),
                creator,
                room_id,
                &state_lock,
            )
            .await
        {
            report_error(errors, room_id, creator, format!("Failed to set join_rules: {e}"));
        }
    }

    // Initial history_visibility; every preset shares history.
    if let Err(e) = services()
        .rooms
        .timeline
        .build_and_append_pdu(
            PduBuilder::state(
                EventType::RoomHistoryVisibility,
                "",
                json!({ "history_visibility": "shared" }),
            ),
            creator,
            room_id,
            &state_lock,
        )
        .await
    {
        report_error(
            errors,
            room_id,
            creator,
            format!("Failed to set history_visibility: {e}"),
        );
    }

    // The user's initial state vector. Takes precedence over preset
    // events, but gets overridden by the name and topic keys.
    for (i, event) in body.initial_state.iter().enumerate() {
        if let Err(e) = services()
            .rooms
            .timeline
            .build_and_append_pdu(
                PduBuilder::state(
                    EventType::from(&event.kind),
                    event.state_key.clone(),
                    event.content.clone(),
                ),
                creator,
                room_id,
                &state_lock,
            )
            .await
        {
            report_error(
                errors,
                room_id,
                creator,
                format!("Failed to set initial_state event @{i}: {e}"),
            );
        }
    }

    // Override room name.
    if let Some(name) = &body.name {
        let name = truncate_utf8(name, NAME_MAX_LEN);
        if let Err(e) = services()
            .rooms
            .timeline
            .build_and_append_pdu(
                PduBuilder::state(EventType::RoomName, "", json!({ "name": name })),
                creator,
                room_id,
                &state_lock,
            )
            .await
        {
            report_error(errors, room_id, creator, format!("Failed to set room name: {e}"));
        }
    }

    // Override topic.
    if let Some(topic) = &body.topic {
        if let Err(e) = services()
            .rooms
            .timeline
            .build_and_append_pdu(
                PduBuilder::state(EventType::RoomTopic, "", json!({ "topic": topic })),
                creator,
                room_id,
                &state_lock,
            )
            .await
        {
            report_error(errors, room_id, creator, format!("Failed to set room topic: {e}"));
        }
    }

    // Invitation vector.
    for user_id in &body.invite {
        let result = async {
            let user_id = UserId::parse(user_id)?;
            let mut content = Map::new();
            content.insert("membership".to_owned(), json!("invite"));
            if body.is_direct {
                content.insert("is_direct".to_owned(), json!(true));
            }

            services()
                .rooms
                .timeline
                .build_and_append_pdu(
                    PduBuilder::state(
                        EventType::RoomMember,
                        user_id.as_str(),
                        Value::Object(content),
                    ),
                    creator,
                    room_id,
                    &state_lock,
                )
                .await
        }
        .await;

        if let Err(e) = result {
            report_error(
                errors,
                room_id,
                creator,
                format!("Failed to invite user '{user_id}': {e}"),
            );

            // For DMs, a room without the counter-party is pointless.
            if body.is_direct {
                return Err(e);
            }
        }
    }

    // Guest access: forbidden unless explicitly requested.
    if body.guest_can_join {
        if let Err(e) = services()
            .rooms
            .timeline
            .build_and_append_pdu(
                PduBuilder::state(
                    EventType::RoomGuestAccess,
                    "",
                    json!({ "guest_access": "can_join" }),
                ),
                creator,
                room_id,
                &state_lock,
            )
            .await
        {
            report_error(errors, room_id, creator, format!("Failed to set guest_access: {e}"));
        }
    }

    // Room directory listing; no directory collaborates with this build.
    if body.visibility.as_deref() == Some("public") {
        debug!(room_id = room_id.as_str(), "room requested public visibility");
    }

    Ok(())
}

/// Builds and commits the m.room.create event.
async fn create_event(
    body: &CreateRoomBody,
    creator: &UserId,
    room_id: &RoomId,
    state_lock: &tokio::sync::MutexGuard<'_, ()>,
) -> Result<()> {
    let mut content = Map::new();

    // Creation-content passthrough, capped on key count.
    if let Some(Value::Object(user_content)) = &body.creation_content {
        for (key, value) in user_content.iter().take(CREATION_CONTENT_MAX_KEYS) {
            content.insert(key.clone(), value.clone());
        }
    }

    content.insert("creator".to_owned(), json!(creator.as_str()));
    content.insert(
        "room_version".to_owned(),
        json!(body
            .room_version
            .clone()
            .unwrap_or_else(|| services().globals.config.default_room_version.clone())),
    );

    services()
        .rooms
        .timeline
        .build_and_append_pdu(
            PduBuilder::state(EventType::RoomCreate, "", Value::Object(content)),
            creator,
            room_id,
            state_lock,
        )
        .await
        .map_err(|e| match e {
            Error::BadRequest(_, _) | Error::BadRequestString(_, _) => e,
            _ => Error::BadRequest(ErrorKind::Internal, "Failed to create room"),
        })?;

    Ok(())
}

/// The default power-levels content. The creator takes level 100; for
/// trusted_private_chat every invitee is promoted to the same level.
fn default_power_levels(creator: &UserId, preset: &str, invite: &[String]) -> Value {
    let mut users = Map::new();
    users.insert(creator.as_str().to_owned(), json!(100));

    if preset == "trusted_private_chat" {
        for user_id in invite {
            if UserId::parse(user_id).is_ok() {
                users.insert(user_id.clone(), json!(100));
            }
        }
    }

    json!({
        "ban": 50,
        "events": {},
        "events_default": 0,
        "invite": 0,
        "kick": 50,
        "redact": 50,
        "state_default": 50,
        "users": users,
        "users_default": 0
    })
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }

    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_presets_are_recognized() {
        assert!(spec_preset("private_chat"));
        assert!(spec_preset("public_chat"));
        assert!(spec_preset("trusted_private_chat"));
        assert!(!spec_preset("secret_chat"));
    }

    #[test]
    fn default_power_levels_promote_trusted_invitees() {
        let creator = UserId::parse("@alice:example.org").unwrap();
        let invite = vec!["@bob:example.org".to_owned(), "not-an-mxid".to_owned()];

        let content = default_power_levels(&creator, "trusted_private_chat", &invite);
        let users = content.get("users").unwrap();
        assert_eq!(users.get("@alice:example.org").unwrap(), 100);
        assert_eq!(users.get("@bob:example.org").unwrap(), 100);
        assert!(users.get("not-an-mxid").is_none());

        let plain = default_power_levels(&creator, "private_chat", &invite);
        assert!(plain.get("users").unwrap().get("@bob:example.org").is_none());
    }

    #[test]
    fn name_truncation_respects_char_boundaries() {
        let long = "é".repeat(200);
        let truncated = truncate_utf8(&long, NAME_MAX_LEN);
        assert!(truncated.len() <= NAME_MAX_LEN);
        assert!(truncated.chars().all(|c| c == 'é'));
    }
}
