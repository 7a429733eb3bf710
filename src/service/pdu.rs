// =============================================================================
// Palaver Matrix Homeserver - Pdu Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   The Matrix event model: the typed PDU view, content hashing, the
//   redaction projection ("essential" fields), ed25519 signing and
//   verification, and event-ID derivation across room versions. Every
//   preimage is produced through the canonical JSON codec; the output must
//   match every other homeserver in the federation bit for bit.
//
// Features:
//   • Content hash over the stripped event object
//   • Redaction projection with per-type content whitelists
//   • Multi-party signature verification against cached peer keys
//   • Reference-hash event IDs for room versions 3 and later
//
// Architecture:
//   • Preimages computed from the retained source buffer when present
//   • Owned event values; no borrowed views escape the arena
//
// Dependencies:
//   • Serialization with serde
//   • SHA-256 via sha2, signatures via ed25519-dalek
//   • Structured logging with tracing
//
// References:
//   • Matrix spec: https://spec.matrix.org/v1.11/rooms/
//
// =============================================================================

use std::{collections::BTreeMap, fmt, sync::Arc};

use base64::{
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
    Engine as _,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, value::RawValue as RawJsonValue, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    canonical::{self, CanonicalObject},
    mxid::{EventId, RoomId, ServerName, UserId},
    Error, ErrorKind, Result,
};

/// Top-level fields stripped before computing the content hash.
const CONTENT_HASH_STRIP: &[&str] = &[
    "signatures",
    "hashes",
    "unsigned",
    "age_ts",
    "outlier",
    "destinations",
];

/// Top-level fields preserved by the redaction projection.
const ESSENTIAL_KEYS: &[&str] = &[
    "auth_events",
    "content",
    "depth",
    "event_id",
    "hashes",
    "membership",
    "origin",
    "origin_server_ts",
    "prev_events",
    "prev_state",
    "room_id",
    "sender",
    "state_key",
    "type",
];

/// A supported room version, which determines the event-ID format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoomVersion {
    V1,
    V2,
    V3,
    V4,
    V5,
    V6,
    V7,
    V8,
    V9,
    V10,
    V11,
}

impl RoomVersion {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "1" => Self::V1,
            "2" => Self::V2,
            "3" => Self::V3,
            "4" => Self::V4,
            "5" => Self::V5,
            "6" => Self::V6,
            "7" => Self::V7,
            "8" => Self::V8,
            "9" => Self::V9,
            "10" => Self::V10,
            "11" => Self::V11,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "1",
            Self::V2 => "2",
            Self::V3 => "3",
            Self::V4 => "4",
            Self::V5 => "5",
            Self::V6 => "6",
            Self::V7 => "7",
            Self::V8 => "8",
            Self::V9 => "9",
            Self::V10 => "10",
            Self::V11 => "11",
        }
    }

    /// Whether event IDs are generated out-of-band (`$random:server`).
    pub fn server_based_ids(&self) -> bool {
        matches!(self, Self::V1 | Self::V2)
    }
}

impl fmt::Display for RoomVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Matrix event type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    RoomAliases,
    RoomCanonicalAlias,
    RoomCreate,
    RoomGuestAccess,
    RoomHistoryVisibility,
    RoomJoinRules,
    RoomMember,
    RoomMessage,
    RoomName,
    RoomPowerLevels,
    RoomRedaction,
    RoomTopic,
    Other(String),
}

impl EventType {
    pub fn from(s: &str) -> Self {
        match s {
            "m.room.aliases" => Self::RoomAliases,
            "m.room.canonical_alias" => Self::RoomCanonicalAlias,
            "m.room.create" => Self::RoomCreate,
            "m.room.guest_access" => Self::RoomGuestAccess,
            "m.room.history_visibility" => Self::RoomHistoryVisibility,
            "m.room.join_rules" => Self::RoomJoinRules,
            "m.room.member" => Self::RoomMember,
            "m.room.message" => Self::RoomMessage,
            "m.room.name" => Self::RoomName,
            "m.room.power_levels" => Self::RoomPowerLevels,
            "m.room.redaction" => Self::RoomRedaction,
            "m.room.topic" => Self::RoomTopic,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::RoomAliases => "m.room.aliases",
            Self::RoomCanonicalAlias => "m.room.canonical_alias",
            Self::RoomCreate => "m.room.create",
            Self::RoomGuestAccess => "m.room.guest_access",
            Self::RoomHistoryVisibility => "m.room.history_visibility",
            Self::RoomJoinRules => "m.room.join_rules",
            Self::RoomMember => "m.room.member",
            Self::RoomMessage => "m.room.message",
            Self::RoomName => "m.room.name",
            Self::RoomPowerLevels => "m.room.power_levels",
            Self::RoomRedaction => "m.room.redaction",
            Self::RoomTopic => "m.room.topic",
            Self::Other(other) => other,
        }
    }

    /// Whether an event of this type requires a state_key.
    pub fn is_state(&self) -> bool {
        matches!(
            self,
            Self::RoomAliases
                | Self::RoomCanonicalAlias
                | Self::RoomCreate
                | Self::RoomGuestAccess
                | Self::RoomHistoryVisibility
                | Self::RoomJoinRules
                | Self::RoomMember
                | Self::RoomName
                | Self::RoomPowerLevels
                | Self::RoomTopic
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EventType::from(&s))
    }
}

/// Content hashes of a PDU.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EventHash {
    /// The SHA-256 hash, base64 unpadded.
    pub sha256: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PduEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    pub room_id: RoomId,
    pub sender: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<ServerName>,
    pub origin_server_ts: u64,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub content: Box<RawJsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub prev_events: Vec<EventId>,
    pub auth_events: Vec<EventId>,
    pub depth: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redacts: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Box<RawJsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hashes: Option<EventHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signatures: Option<BTreeMap<ServerName, BTreeMap<String, String>>>,

    /// The raw JSON this event was parsed from, when it arrived over the
    /// wire. Hash preimages are taken from this buffer so that unknown
    /// fields survive re-serialization.
    #[serde(skip)]
    pub source: Option<Arc<str>>,
}

impl PduEvent {
    /// Builds the typed view over a parsed event object, retaining the
    /// source buffer for preimage fidelity.
    pub fn from_object(object: &CanonicalObject) -> Result<Self> {
        let source: Arc<str> =
            canonical::to_canonical_string(&Value::Object(object.clone()))?.into();
        let mut pdu: PduEvent =
            serde_json::from_str(&source).map_err(|e| Error::BadJson(e.to_string()))?;
        pdu.source = Some(source);
        Ok(pdu)
    }

    /// The event as a JSON object. Prefers the retained source buffer.
    pub fn to_object(&self) -> Result<CanonicalObject> {
        if let Some(source) = &self.source {
            return canonical::parse_object(source);
        }

        let raw = serde_json::to_string(self).map_err(|e| Error::BadJson(e.to_string()))?;
        canonical::parse_object(&raw)
    }

    /// The event object as transmitted over federation: room-version 3+
    /// events carry no event_id field on the wire.
    pub fn to_federation_object(&self, room_version: RoomVersion) -> Result<CanonicalObject> {
        let mut object = self.to_object()?;
        if !room_version.server_based_ids() {
            object.remove("event_id");
        }
        Ok(object)
    }

    pub fn content_value(&self) -> Result<Value> {
        serde_json::from_str(self.content.get()).map_err(|e| Error::BadJson(e.to_string()))
    }

    /// Applies the redaction projection to this stored event in place.
    pub fn redact(&mut self, room_version: RoomVersion) -> Result<()> {
        let object = self.to_object()?;
        let redacted = essential(&object, room_version)?;
        let mut redacted = PduEvent::from_object(&redacted)?;
        redacted.event_id = self.event_id.clone();
        *self = redacted;
        Ok(())
    }
}

/// A draft event under construction by the local API, before the DAG
/// placement, hashing and signing performed at commit time.
#[derive(Clone, Debug)]
pub struct PduBuilder {
    pub event_type: EventType,
    pub content: Value,
    pub state_key: Option<String>,
    pub redacts: Option<EventId>,
    pub timestamp: Option<u64>,
}

impl PduBuilder {
    pub fn state(event_type: EventType, state_key: impl Into<String>, content: Value) -> Self {
        Self {
            event_type,
            content,
            state_key: Some(state_key.into()),
            redacts: None,
            timestamp: None,
        }
    }

    pub fn timeline(event_type: EventType, content: Value) -> Self {
        Self {
            event_type,
            content,
            state_key: None,
            redacts: None,
            timestamp: None,
        }
    }
}

/// The canonical bytes of the event with the given top-level fields
/// stripped; the input to every digest over an event object.
pub fn hash_preimage(object: &CanonicalObject, strip: &[&str]) -> Result<Vec<u8>> {
    let mut stripped = object.clone();
    for key in strip {
        stripped.remove(*key);
    }

    canonical::to_canonical_bytes(&Value::Object(stripped))
}

/// SHA-256 over the canonical event with volatile fields stripped.
pub fn content_hash(object: &CanonicalObject) -> Result<[u8; 32]> {
    let preimage = hash_preimage(object, CONTENT_HASH_STRIP)?;
    Ok(Sha256::digest(&preimage).into())
}

/// Whether the `hashes.sha256` of the object matches its recomputed
/// content hash. Absent or malformed hashes fail closed.
pub fn verify_content_hash(object: &CanonicalObject) -> Result<bool> {
    let claimed = object
        .get("hashes")
        .and_then(|h| h.get("sha256"))
        .and_then(Value::as_str);

    let Some(claimed) = claimed else {
        return Ok(false);
    };

    let computed = STANDARD_NO_PAD.encode(content_hash(object)?);
    Ok(claimed == computed)
}

/// The redaction projection: keeps the essential top-level fields and the
/// per-type content whitelist, and clears `signatures`.
pub fn essential(object: &CanonicalObject, room_version: RoomVersion) -> Result<CanonicalObject> {
    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(Error::BadRequest(ErrorKind::Invalid, "Event is missing a type"))?
        .to_owned();

    let mut out = CanonicalObject::new();
    for key in ESSENTIAL_KEYS {
        if let Some(value) = object.get(*key) {
            out.insert((*key).to_owned(), value.clone());
        }
    }

    // The redacts pointer survives only under the legacy identifier scheme;
    // later room versions elide it from the preimage.
    if kind == "m.room.redaction" && room_version.server_based_ids() {
        if let Some(redacts) = object.get("redacts") {
            out.insert("redacts".to_owned(), redacts.clone());
        }
    }

    let content = object
        .get("content")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let essential_content = match kind.as_str() {
        "m.room.aliases" => content_subset(&content, &["aliases"]),
        "m.room.create" => content_subset(&content, &["creator"]),
        "m.room.history_visibility" => content_subset(&content, &["history_visibility"]),
        "m.room.join_rules" => content_subset(&content, &["join_rule"]),
        "m.room.member" => content_subset(&content, &["membership"]),
        "m.room.power_levels" => content_subset(
            &content,
            &[
                "ban",
                "events",
                "events_default",
                "kick",
                "redact",
                "state_default",
                "users",
                "users_default",
            ],
        ),
        _ => CanonicalObject::new(),
    };

    out.insert("content".to_owned(), Value::Object(essential_content));
    out.remove("signatures");

    Ok(out)
}

fn content_subset(content: &CanonicalObject, keys: &[&str]) -> CanonicalObject {
    let mut out = CanonicalObject::new();
    for key in keys {
        if let Some(value) = content.get(*key) {
            out.insert((*key).to_owned(), value.clone());
        }
    }
    out
}

/// The canonical signing preimage: the essential projection without the
/// unsigned section. Under the modern identifier scheme events carry no
/// event_id on the wire, so a locally-annotated one is excluded.
fn signing_preimage(object: &CanonicalObject, room_version: RoomVersion) -> Result<Vec<u8>> {
    let mut essential = essential(object, room_version)?;
    essential.remove("unsigned");
    if !room_version.server_based_ids() {
        essential.remove("event_id");
    }
    canonical::to_canonical_bytes(&Value::Object(essential))
}

/// Signs the event with this server's secret key and merges the signature
/// into `signatures[origin][key_id]`.
pub fn sign(
    object: &mut CanonicalObject,
    secret_key: &SigningKey,
    origin: &ServerName,
    key_id: &str,
    room_version: RoomVersion,
) -> Result<()> {
    let preimage = signing_preimage(object, room_version)?;
    let signature: Signature = secret_key.sign(&preimage);
    let signature_b64 = STANDARD_NO_PAD.encode(signature.to_bytes());

    let signatures = object
        .entry("signatures".to_owned())
        .or_insert_with(|| Value::Object(CanonicalObject::new()));
    let signatures = signatures
        .as_object_mut()
        .ok_or(Error::BadRequest(ErrorKind::Invalid, "Event signatures is not an object"))?;
    let origin_sigs = signatures
        .entry(origin.as_str().to_owned())
        .or_insert_with(|| Value::Object(CanonicalObject::new()));
    let origin_sigs = origin_sigs
        .as_object_mut()
        .ok_or(Error::BadRequest(ErrorKind::Invalid, "Origin signatures is not an object"))?;
    origin_sigs.insert(key_id.to_owned(), Value::String(signature_b64));

    Ok(())
}

/// Verifies one signature from `signatures[origin][key_id]` under `pk`.
pub fn verify_signature(
    object: &CanonicalObject,
    pk: &VerifyingKey,
    origin: &ServerName,
    key_id: &str,
    room_version: RoomVersion,
) -> Result<bool> {
    let sig_b64 = object
        .get("signatures")
        .and_then(|s| s.get(origin.as_str()))
        .and_then(|s| s.get(key_id))
        .and_then(Value::as_str)
        .ok_or(Error::BadRequest(ErrorKind::NotFound, "No such signature on event"))?;

    let sig_bytes = STANDARD_NO_PAD
        .decode(sig_b64)
        .map_err(|_| Error::BadRequest(ErrorKind::MalformedInput, "Signature is not valid base64"))?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| Error::BadRequest(ErrorKind::MalformedInput, "Signature has wrong length"))?;
    let signature = Signature::from_bytes(&sig_bytes);

    let preimage = signing_preimage(object, room_version)?;
    Ok(pk.verify(&preimage, &signature).is_ok())
}

/// The key IDs present in `signatures[origin]`, in order.
pub fn signature_key_ids(object: &CanonicalObject, origin: &ServerName) -> Vec<String> {
    object
        .get("signatures")
        .and_then(|s| s.get(origin.as_str()))
        .and_then(Value::as_object)
        .map(|sigs| sigs.keys().cloned().collect())
        .unwrap_or_default()
}

/// The reference-hash preimage digest used for room-version 3+ event IDs.
pub fn reference_hash(object: &CanonicalObject, room_version: RoomVersion) -> Result<[u8; 32]> {
    let mut essential = essential(object, room_version)?;
    essential.remove("signatures");
    essential.remove("unsigned");
    essential.remove("event_id");
    essential.remove("age_ts");

    let preimage = canonical::to_canonical_bytes(&Value::Object(essential))?;
    Ok(Sha256::digest(&preimage).into())
}

/// Derives the event ID for the given room version.
///
/// Versions 1 and 2 generate a random server-scoped ID; version 3 uses the
/// unpadded-base64 reference hash; 4 and later use the url-safe alphabet.
pub fn derive_event_id(
    object: &CanonicalObject,
    room_version: RoomVersion,
    server_name: &ServerName,
) -> Result<EventId> {
    if room_version.server_based_ids() {
        return Ok(EventId::from_parts(&crate::utils::random_string(18), server_name));
    }

    let digest = reference_hash(object, room_version)?;
    let body = match room_version {
        RoomVersion::V3 => STANDARD_NO_PAD.encode(digest),
        _ => URL_SAFE_NO_PAD.encode(digest),
    };

    Ok(EventId::from_digest(&body))
}

/// Whether the event's claimed ID is the one its content derives.
///
/// For versions 1 and 2 the ID is out-of-band, so only presence is checked;
/// for 3 and later the ID is re-derived and compared.
pub fn check_id(object: &CanonicalObject, room_version: RoomVersion, claimed: &EventId) -> bool {
    if room_version.server_based_ids() {
        return object
            .get("event_id")
            .and_then(Value::as_str)
            .map(|id| id == claimed.as_str())
            .unwrap_or(true);
    }

    let derived = match reference_hash(object, room_version) {
        Ok(digest) => match room_version {
            RoomVersion::V3 => EventId::from_digest(&STANDARD_NO_PAD.encode(digest)),
            _ => EventId::from_digest(&URL_SAFE_NO_PAD.encode(digest)),
        },
        Err(_) => return false,
    };

    let matches = &derived == claimed;
    if !matches {
        debug!(
            claimed = claimed.as_str(),
            derived = derived.as_str(),
            "event ID failed re-derivation"
        );
    }
    matches
}

/// Builds the `hashes` member for an event object from its content hash.
pub fn make_hashes(object: &CanonicalObject) -> Result<Value> {
    let digest = content_hash(object)?;
    Ok(json!({ "sha256": STANDARD_NO_PAD.encode(digest) }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_event_object() -> CanonicalObject {
        canonical::parse_object(
            r#"{
                "type": "m.room.create",
                "room_id": "!abc:example.org",
                "sender": "@u:example.org",
                "origin": "example.org",
                "origin_server_ts": 1,
                "depth": 0,
                "prev_events": [],
                "auth_events": [],
                "content": {"creator": "@u:example.org", "room_version": "5"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn content_hash_ignores_volatile_fields() {
        let plain = create_event_object();
        let mut decorated = plain.clone();
        decorated.insert("hashes".to_owned(), json!({ "sha256": "xxxx" }));
        decorated.insert("signatures".to_owned(), json!({ "example.org": {} }));
        decorated.insert("unsigned".to_owned(), json!({ "age_ts": 5 }));

        assert_eq!(
            content_hash(&plain).unwrap(),
            content_hash(&decorated).unwrap()
        );
    }

    #[test]
    fn content_hash_changes_with_content() {
        let plain = create_event_object();
        let mut tampered = plain.clone();
        tampered.insert("content".to_owned(), json!({ "creator": "@evil:example.org" }));

        assert_ne!(
            content_hash(&plain).unwrap(),
            content_hash(&tampered).unwrap()
        );
    }

    #[test]
    fn verify_content_hash_round_trips() {
        let mut object = create_event_object();
        let hashes = make_hashes(&object).unwrap();
        object.insert("hashes".to_owned(), hashes);
        assert!(verify_content_hash(&object).unwrap());

        object.insert("content".to_owned(), json!({ "creator": "@evil:example.org" }));
        assert!(!verify_content_hash(&object).unwrap());
    }

    #[test]
    fn essential_keeps_power_level_whitelist() {
        let object = canonical::parse_object(
            r#"{
                "type": "m.room.power_levels",
                "room_id": "!abc:example.org",
                "sender": "@u:example.org",
                "origin_server_ts": 1,
                "depth": 4,
                "state_key": "",
                "prev_events": [],
                "auth_events": [],
                "content": {"ban": 50, "extra": "x"},
                "signatures": {"example.org": {"ed25519:0": "sig"}}
            }"#,
        )
        .unwrap();

        let essential = essential(&object, RoomVersion::V5).unwrap();
        assert_eq!(essential.get("content").unwrap(), &json!({ "ban": 50 }));
        assert!(essential.get("signatures").is_none());
    }

    #[test]
    fn essential_is_idempotent() {
        let object = create_event_object();
        let once = essential(&object, RoomVersion::V5).unwrap();
        let twice = essential(&once, RoomVersion::V5).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn essential_clears_unknown_type_content() {
        let mut object = create_event_object();
        object.insert("type".to_owned(), json!("org.example.custom"));
        let essential = essential(&object, RoomVersion::V5).unwrap();
        assert_eq!(essential.get("content").unwrap(), &json!({}));
    }

    #[test]
    fn redaction_keeps_redacts_only_for_legacy_versions() {
        let mut object = create_event_object();
        object.insert("type".to_owned(), json!("m.room.redaction"));
        object.insert("redacts".to_owned(), json!("$target:example.org"));

        let v1 = essential(&object, RoomVersion::V1).unwrap();
        assert_eq!(v1.get("redacts").unwrap(), &json!("$target:example.org"));

        let v5 = essential(&object, RoomVersion::V5).unwrap();
        assert!(v5.get("redacts").is_none());
    }

    #[test]
    fn event_id_v3_uses_standard_alphabet() {
        let object = create_event_object();
        let server = ServerName::parse("example.org").unwrap();
        let event_id = derive_event_id(&object, RoomVersion::V3, &server).unwrap();

        let body = &event_id.as_str()[1..];
        assert!(event_id.as_str().starts_with('$'));
        assert_eq!(
            STANDARD_NO_PAD.decode(body).unwrap(),
            reference_hash(&object, RoomVersion::V3).unwrap()
        );
    }

    #[test]
    fn event_id_v4_uses_url_safe_alphabet() {
        let object = create_event_object();
        let server = ServerName::parse("example.org").unwrap();
        let event_id = derive_event_id(&object, RoomVersion::V4, &server).unwrap();

        let body = &event_id.as_str()[1..];
        assert!(!body.contains('+') && !body.contains('/'));
        assert_eq!(
            URL_SAFE_NO_PAD.decode(body).unwrap(),
            reference_hash(&object, RoomVersion::V4).unwrap()
        );
    }

    #[test]
    fn check_id_rederives_for_v3_plus() {
        let object = create_event_object();
        let server = ServerName::parse("example.org").unwrap();
        let event_id = derive_event_id(&object, RoomVersion::V5, &server).unwrap();
        assert!(check_id(&object, RoomVersion::V5, &event_id));

        let wrong = EventId::parse("$not-the-right-id").unwrap();
        assert!(!check_id(&object, RoomVersion::V5, &wrong));
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let mut object = create_event_object();
        let secret = SigningKey::from_bytes(&[7u8; 32]);
        let origin = ServerName::parse("example.org").unwrap();

        sign(&mut object, &secret, &origin, "ed25519:auto", RoomVersion::V5).unwrap();

        let pk = secret.verifying_key();
        assert!(verify_signature(&object, &pk, &origin, "ed25519:auto", RoomVersion::V5).unwrap());

        // A different key must not verify.
        let other = SigningKey::from_bytes(&[9u8; 32]).verifying_key();
        assert!(!verify_signature(&object, &other, &origin, "ed25519:auto", RoomVersion::V5).unwrap());
    }

    #[test]
    fn signature_covers_essential_fields_only() {
        let mut object = create_event_object();
        let secret = SigningKey::from_bytes(&[7u8; 32]);
        let origin = ServerName::parse("example.org").unwrap();
        sign(&mut object, &secret, &origin, "ed25519:auto", RoomVersion::V5).unwrap();

        // Mutating unsigned must not invalidate the signature.
        object.insert("unsigned".to_owned(), json!({ "age": 4 }));
        let pk = secret.verifying_key();
        assert!(verify_signature(&object, &pk, &origin, "ed25519:auto", RoomVersion::V5).unwrap());

        // Mutating essential content must.
        object.insert("content".to_owned(), json!({ "creator": "@evil:example.org" }));
        assert!(!verify_signature(&object, &pk, &origin, "ed25519:auto", RoomVersion::V5).unwrap());
    }

    #[test]
    fn typed_view_round_trips_through_object() {
        let object = create_event_object();
        let pdu = PduEvent::from_object(&object).unwrap();
        assert_eq!(pdu.kind, EventType::RoomCreate);
        assert_eq!(pdu.depth, 0);
        assert!(pdu.source.is_some());

        let back = pdu.to_object().unwrap();
        assert_eq!(back.get("sender"), object.get("sender"));
    }

    #[test]
    fn federation_object_strips_event_id_for_modern_versions() {
        let mut object = create_event_object();
        object.insert("event_id".to_owned(), json!("$abc"));
        let pdu = PduEvent::from_object(&object).unwrap();

        let v5 = pdu.to_federation_object(RoomVersion::V5).unwrap();
        assert!(v5.get("event_id").is_none());

        let v1 = pdu.to_federation_object(RoomVersion::V1).unwrap();
        assert!(v1.get("event_id").is_some());
    }
}
