// =============================================================================
// Palaver Matrix Homeserver - Federation API Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   Server-server endpoint handlers: backfill, cached key query and the
//   user device-keys query, plus X-Matrix request-signature verification
//   for the endpoints that require an authenticated origin.
//
// Features:
//   • Backfill limited walks over the room sequence
//   • Key-document streaming per server
//   • Origin signature verification against the key cache
//
// Dependencies:
//   • HTTP routing with axum
//   • Signatures via ed25519-dalek
//   • Serialization with serde
//
// References:
//   • Matrix spec: https://spec.matrix.org/v1.11/server-server-api/
//
// =============================================================================

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use axum::{
    extract::{Path, Query, RawQuery},
    http::HeaderMap,
    Json,
};
use ed25519_dalek::{Signature, Verifier};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::{
    canonical,
    mxid::{DeviceId, EventId, RoomId, ServerName, UserId},
    services, Error, ErrorKind, Result,
};

/// Default and ceiling for backfill limits.
const BACKFILL_LIMIT_DEFAULT: usize = 10;
const BACKFILL_LIMIT_MAX: usize = 100;

/// Verifies the X-Matrix authorization of a federation request and
/// returns the origin server. The signature is checked over the canonical
/// request object against the origin's cached keys.
fn verify_origin(
    headers: &HeaderMap,
    method: &str,
    uri: &str,
    content: Option<&Value>,
) -> Result<ServerName> {
    let authorization = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("X-Matrix "))
        .ok_or(Error::BadRequest(ErrorKind::Auth, "Missing X-Matrix authorization"))?;

    let mut origin = None;
    let mut key_id = None;
    let mut signature = None;
    for part in authorization.split(',') {
        let Some((name, value)) = part.trim().split_once('=') else {
            continue;
        };
        let value = value.trim_matches('"');
        match name {
            "origin" => origin = Some(value),
            "key" => key_id = Some(value),
            "sig" => signature = Some(value),
            _ => {}
        }
    }

    let origin = ServerName::parse(
        origin.ok_or(Error::BadRequest(ErrorKind::Auth, "X-Matrix origin missing"))?,
    )?;
    let key_id = key_id.ok_or(Error::BadRequest(ErrorKind::Auth, "X-Matrix key missing"))?;
    let signature_b64 =
        signature.ok_or(Error::BadRequest(ErrorKind::Auth, "X-Matrix sig missing"))?;

    let mut request = Map::new();
    request.insert("method".to_owned(), json!(method));
    request.insert("uri".to_owned(), json!(uri));
    request.insert("origin".to_owned(), json!(origin.as_str()));
    request.insert(
        "destination".to_owned(),
        json!(services().globals.server_name().as_str()),
    );
    if let Some(content) = content {
        request.insert("content".to_owned(), content.clone());
    }

    let preimage = canonical::to_canonical_bytes(&Value::Object(request))?;

    let pk = services()
        .keys
        .verify_key(&origin, key_id)?
        .ok_or(Error::BadRequest(ErrorKind::Auth, "Origin key is not cached"))?;

    let sig_bytes = STANDARD_NO_PAD
        .decode(signature_b64)
        .map_err(|_| Error::BadRequest(ErrorKind::Auth, "X-Matrix sig is not valid base64"))?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| Error::BadRequest(ErrorKind::Auth, "X-Matrix sig has wrong length"))?;

    pk.verify(&preimage, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| Error::BadRequest(ErrorKind::Auth, "Request signature verification failed"))?;

    Ok(origin)
}

/// `GET /_matrix/key/v2/query/{serverName}/{keyId}`
///
/// Returns the cached key document, or 404 when this server has never
/// cached that key.
pub async fn key_query_route(
    Path((server_name, key_id)): Path<(String, String)>,
    RawQuery(_query): RawQuery,
) -> Result<Json<Value>> {
    let server_name = ServerName::parse(&server_name)?;

    match services().keys.key_document(&server_name, &key_id)? {
        Some(document) => Ok(Json(document)),
        None => Err(Error::BadRequestString(
            ErrorKind::NotFound,
            format!("Key '{key_id}' from server '{server_name}' is not cached by this server"),
        )),
    }
}

/// `GET /_matrix/key/v2/query/{serverName}`
///
/// Streams all cached keys for the server. The minimum_valid_until_ts
/// condition is deliberately not applied, matching synapse behavior.
pub async fn key_query_all_route(
    Path(server_name): Path<String>,
    RawQuery(_query): RawQuery,
) -> Result<Json<Value>> {
    let server_name = ServerName::parse(&server_name)?;
    let server_keys = services().keys.key_documents(&server_name)?;

    Ok(Json(json!({ "server_keys": server_keys })))
}

/// `POST /_matrix/federation/v1/user/keys/query`
///
/// Body: `{device_keys: {user_id: [device_id, ...]}}`. An empty device
/// list means all devices of that user.
pub async fn user_keys_query_route(
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let origin = verify_origin(
        &headers,
        "POST",
        "/_matrix/federation/v1/user/keys/query",
        Some(&body),
    )?;
    debug!(origin = origin.as_str(), "user keys query");

    let request_keys = body
        .get("device_keys")
        .and_then(Value::as_object)
        .ok_or(Error::BadRequest(ErrorKind::Invalid, "Missing device_keys object"))?;

    let mut response_keys = Map::new();
    for (user_id, device_ids) in request_keys {
        let user_id = UserId::parse(user_id)?;
        let requested: Vec<DeviceId> = device_ids
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(DeviceId::new)
                    .collect()
            })
            .unwrap_or_default();

        let devices = if requested.is_empty() {
            services().users.device_ids(&user_id)?
        } else {
            requested
        };

        let mut user_keys = Map::new();
        for device_id in devices {
            // Devices without uploaded keys are skipped.
            let Some(keys) = services().users.device_keys(&user_id, &device_id)? else {
                continue;
            };

            let mut entry = match keys {
                Value::Object(map) => map,
                _ => continue,
            };

            if let Some(display_name) =
                services().users.device_display_name(&user_id, &device_id)?
            {
                entry.insert(
                    "unsigned".to_owned(),
                    json!({ "device_display_name": display_name }),
                );
            }

            user_keys.insert(device_id.as_str().to_owned(), Value::Object(entry));
        }

        response_keys.insert(user_id.as_str().to_owned(), Value::Object(user_keys));
    }

    Ok(Json(json!({ "device_keys": response_keys })))
}

/// `GET /_matrix/federation/v1/backfill/{roomId}?v=...&limit=...`
///
/// Returns up to `limit` events walking backward from each `v`. The `v`
/// parameter repeats, so the query deserializes as pairs.
pub async fn backfill_route(
    Path(room_id): Path<String>,
    Query(query): Query<Vec<(String, String)>>,
) -> Result<Json<Value>> {
    let room_id = RoomId::parse(&room_id)?;

    let mut from = Vec::new();
    let mut limit = BACKFILL_LIMIT_DEFAULT;
    for (name, value) in &query {
        match name.as_str() {
            "v" => from.push(EventId::parse(value)?),
            "limit" => {
                limit = value
                    .parse::<usize>()
                    .map_err(|_| Error::BadRequest(ErrorKind::Invalid, "Invalid backfill limit"))?
                    .min(BACKFILL_LIMIT_MAX);
            }
            _ => {}
        }
    }

    if from.is_empty() {
        return Err(Error::BadRequest(ErrorKind::Invalid, "At least one 'v' event is required"));
    }

    let pdus = services().rooms.timeline.backfill_pdus(&room_id, &from, limit)?;
    debug!(room_id = room_id.as_str(), pdus = pdus.len(), "backfill");

    Ok(Json(json!({
        "origin": services().globals.server_name().as_str(),
        "origin_server_ts": crate::utils::millis_since_unix_epoch(),
        "pdus": pdus,
    })))
}
