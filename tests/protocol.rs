// =============================================================================
// Palaver Matrix Homeserver - Protocol Integration Tests
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   End-to-end protocol behavior over the full service stack: room
//   creation presets, the evaluation pipeline's duplicate handling, the
//   acquirer's gap fill, and the federation backfill walk.
//
// =============================================================================

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, RawQuery},
    http::HeaderMap,
};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use ed25519_dalek::Signer;
use palaver::{
    api::{
        client_server::message::get_messages_route,
        client_server::room::{create_room, CreateRoomBody},
        server_server,
    },
    canonical::{self, CanonicalObject},
    mxid::{DeviceId, EventId, RoomId, UserId},
    service::{
        pdu::{self, EventType, PduBuilder, RoomVersion},
        rooms::{
            acquire::{Acquire, Opts as AcquireOpts},
            vm::{Fault, Opts as VmOpts},
        },
    },
    services, test_utils,
};
use serde_json::{json, Value};

/// Builds a fully hashed, signed event in the test server's name and
/// derives its ID the way a remote homeserver would.
fn signed_event(
    kind: &str,
    state_key: Option<&str>,
    sender: &UserId,
    room_id: &RoomId,
    depth: i64,
    prev: &[&EventId],
    auth: &[&EventId],
    content: Value,
) -> (EventId, CanonicalObject) {
    let globals = &services().globals;

    let mut object = CanonicalObject::new();
    object.insert("room_id".to_owned(), json!(room_id.as_str()));
    object.insert("sender".to_owned(), json!(sender.as_str()));
    object.insert("origin".to_owned(), json!(globals.server_name().as_str()));
    object.insert("origin_server_ts".to_owned(), json!(1_700_000_000_000u64 + depth as u64));
    object.insert("type".to_owned(), json!(kind));
    object.insert("content".to_owned(), content);
    object.insert("depth".to_owned(), json!(depth));
    object.insert(
        "prev_events".to_owned(),
        json!(prev.iter().map(|id| id.as_str()).collect::<Vec<_>>()),
    );
    object.insert(
        "auth_events".to_owned(),
        json!(auth.iter().map(|id| id.as_str()).collect::<Vec<_>>()),
    );

    if let Some(state_key) = state_key {
        object.insert("state_key".to_owned(), json!(state_key));
    }

    let hashes = pdu::make_hashes(&object).expect("hashing succeeds");
    object.insert("hashes".to_owned(), hashes);

    pdu::sign(
        &mut object,
        globals.keypair(),
        globals.server_name(),
        globals.key_id(),
        RoomVersion::V5,
    )
    .expect("signing succeeds");

    let event_id = pdu::derive_event_id(&object, RoomVersion::V5, globals.server_name())
        .expect("id derivation succeeds");

    (event_id, object)
}

#[tokio::test]
async fn create_room_public_chat_emits_five_events() {
    test_utils::init_test_services();
    let alice = test_utils::register_test_user("alice", "tok_alice");

    let body = CreateRoomBody {
        preset: Some("public_chat".to_owned()),
        ..Default::default()
    };

    let (room_id, errors) = create_room(body, &alice).await.expect("room creation");
    assert_eq!(errors, Vec::<String>::new());

    // create, creator join, power_levels, join_rules, history_visibility.
    let (_, top_depth, top_idx) = services()
        .rooms
        .timeline
        .top(&room_id)
        .unwrap()
        .expect("room has events");
    assert_eq!(top_depth, 4);
    assert_eq!(
        services().rooms.timeline.count_between(&room_id, 0, top_idx).unwrap(),
        5
    );

    let state = &services().rooms.state;
    let join_rules = state
        .state_get(&room_id, &EventType::RoomJoinRules, "")
        .unwrap()
        .expect("join rules are state");
    assert_eq!(
        join_rules.content_value().unwrap().get("join_rule").unwrap(),
        "public"
    );

    let visibility = state
        .state_get(&room_id, &EventType::RoomHistoryVisibility, "")
        .unwrap()
        .expect("history visibility is state");
    assert_eq!(
        visibility
            .content_value()
            .unwrap()
            .get("history_visibility")
            .unwrap(),
        "shared"
    );

    // Guest access stays at its implied default; no event is emitted.
    assert!(state
        .state_get(&room_id, &EventType::RoomGuestAccess, "")
        .unwrap()
        .is_none());

    assert!(state.is_joined(&room_id, &alice).unwrap());
}

#[tokio::test]
async fn create_room_trusted_private_chat_promotes_invitees() {
    test_utils::init_test_services();
    let carol = test_utils::register_test_user("carol", "tok_carol");

    let body = CreateRoomBody {
        preset: Some("trusted_private_chat".to_owned()),
        invite: vec!["@dave:palaver.test".to_owned()],
        ..Default::default()
    };

    let (room_id, errors) = create_room(body, &carol).await.expect("room creation");
    assert_eq!(errors, Vec::<String>::new());

    let power_levels = services()
        .rooms
        .state
        .state_get(&room_id, &EventType::RoomPowerLevels, "")
        .unwrap()
        .expect("power levels are state");
    let content = power_levels.content_value().unwrap();
    assert_eq!(content["users"]["@dave:palaver.test"], 100);

    let dave = UserId::parse("@dave:palaver.test").unwrap();
    assert_eq!(
        services().rooms.state.membership(&room_id, &dave).unwrap().as_deref(),
        Some("invite")
    );
}

#[tokio::test]
async fn duplicate_event_produces_one_index_and_one_exists() {
    test_utils::init_test_services();

    let room_id = RoomId::parse("!dedupe:palaver.test").unwrap();
    let sender = UserId::parse("@dedupe:palaver.test").unwrap();

    let (create_id, create) = signed_event(
        "m.room.create",
        Some(""),
        &sender,
        &room_id,
        0,
        &[],
        &[],
        json!({ "creator": sender.as_str(), "room_version": "5" }),
    );
    let (join_id, join) = signed_event(
        "m.room.member",
        Some(sender.as_str()),
        &sender,
        &room_id,
        1,
        &[&create_id],
        &[&create_id],
        json!({ "membership": "join" }),
    );
    let (_message_id, message) = signed_event(
        "m.room.message",
        None,
        &sender,
        &room_id,
        2,
        &[&join_id],
        &[&create_id, &join_id],
        json!({ "body": "once" }),
    );

    let opts = VmOpts::for_backfill();
    let outcomes = services()
        .rooms
        .vm
        .eval(vec![create, join, message.clone()], &opts)
        .await
        .unwrap();
    assert!(outcomes.iter().all(|o| o.is_accepted()));
    assert!(outcomes.iter().all(|o| o.fault().is_none()));

    let duplicate = services()
        .rooms
        .vm
        .eval_one(message, &opts)
        .await
        .unwrap();
    assert!(duplicate.is_accepted());
    assert_eq!(duplicate.fault(), Some(Fault::Exists));
}

#[tokio::test]
async fn acquirer_fills_an_interior_gap_with_a_clamped_limit() {
    test_utils::init_test_services();

    let room_id = RoomId::parse("!gap:palaver.test").unwrap();
    let sender = UserId::parse("@gap:palaver.test").unwrap();

    // Depths 0..=80 are contiguous; 81..=89 are absent; 90..=100 are
    // present, with the event at depth 90 referring to the absent event
    // at depth 89.
    let (create_id, create) = signed_event(
        "m.room.create",
        Some(""),
        &sender,
        &room_id,
        0,
        &[],
        &[],
        json!({ "creator": sender.as_str(), "room_version": "5" }),
    );
    let (join_id, join) = signed_event(
        "m.room.member",
        Some(sender.as_str()),
        &sender,
        &room_id,
        1,
        &[&create_id],
        &[&create_id],
        json!({ "membership": "join" }),
    );

    let mut batch = vec![create, join];
    let mut prev_id = join_id.clone();
    let mut depth80_id = None;
    for depth in 2..=80 {
        let (id, event) = signed_event(
            "m.room.message",
            None,
            &sender,
            &room_id,
            depth,
            &[&prev_id],
            &[&create_id, &join_id],
            json!({ "body": format!("message {depth}") }),
        );
        batch.push(event);
        prev_id = id.clone();
        if depth == 80 {
            depth80_id = Some(id);
        }
    }
    let depth80_id = depth80_id.unwrap();

    // The event behind the gap, withheld from the local store.
    let (missing_id, missing_event) = signed_event(
        "m.room.message",
        None,
        &sender,
        &room_id,
        89,
        &[&depth80_id],
        &[&create_id, &join_id],
        json!({ "body": "the gap" }),
    );

    let mut prev_id = missing_id.clone();
    for depth in 90..=100 {
        let (id, event) = signed_event(
            "m.room.message",
            None,
            &sender,
            &room_id,
            depth,
            &[&prev_id],
            &[&create_id, &join_id],
            json!({ "body": format!("message {depth}") }),
        );
        batch.push(event);
        prev_id = id;
    }

    let opts = VmOpts::for_backfill();
    let outcomes = services().rooms.vm.eval(batch, &opts).await.unwrap();
    assert!(outcomes.iter().all(|o| o.is_accepted()));
    assert!(!services().rooms.timeline.pdu_exists(&missing_id).unwrap());

    // The peer can supply the withheld event.
    let fetch = test_utils::test_fetch_client();
    fetch.add_response(&missing_id, vec![missing_event]);

    let mut acquire_opts = AcquireOpts::new(room_id.clone());
    acquire_opts.head = false;
    Acquire::execute(acquire_opts).await.expect("acquire completes");

    let submissions: Vec<_> = fetch
        .submissions()
        .into_iter()
        .filter(|(event_id, _)| event_id == missing_id.as_str())
        .collect();

    // One backfill, sized by the gap estimate: clamp(90 - 80, 1, 48).
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].1, 10);

    assert!(services().rooms.timeline.pdu_exists(&missing_id).unwrap());
}

#[tokio::test]
async fn backfill_walks_backward_from_the_reference() {
    test_utils::init_test_services();
    let erin = test_utils::register_test_user("erin", "tok_erin");

    let body = CreateRoomBody {
        preset: Some("private_chat".to_owned()),
        ..Default::default()
    };
    let (room_id, _) = create_room(body, &erin).await.expect("room creation");

    let mutex = services().globals.room_mutex_state(&room_id).await;
    let mut last_event_id = None;
    for i in 0..6 {
        let state_lock = mutex.lock().await;
        let event_id = services()
            .rooms
            .timeline
            .build_and_append_pdu(
                PduBuilder::timeline(
                    EventType::RoomMessage,
                    json!({ "body": format!("hello {i}") }),
                ),
                &erin,
                &room_id,
                &state_lock,
            )
            .await
            .expect("message commits");
        last_event_id = Some(event_id);
    }

    let from = last_event_id.unwrap();
    let pdus = services()
        .rooms
        .timeline
        .backfill_pdus(&room_id, &[from.clone()], 3)
        .expect("backfill walk");

    assert_eq!(pdus.len(), 3);

    // Backward walk: depths are non-increasing.
    let depths: Vec<i64> = pdus
        .iter()
        .map(|pdu| pdu.get("depth").and_then(Value::as_i64).unwrap())
        .collect();
    assert!(depths.windows(2).all(|w| w[0] >= w[1]));

    // Wire objects for a version-5 room carry no event_id field.
    assert!(pdus.iter().all(|pdu| pdu.get("event_id").is_none()));

    // The federation route performs the same walk over repeated 'v' keys.
    let response = server_server::backfill_route(
        Path(room_id.as_str().to_owned()),
        Query(vec![
            ("v".to_owned(), from.as_str().to_owned()),
            ("limit".to_owned(), "3".to_owned()),
        ]),
    )
    .await
    .expect("backfill responds");
    assert_eq!(response.0["pdus"].as_array().unwrap().len(), 3);
    assert_eq!(response.0["origin"], "palaver.test");
}

#[tokio::test]
async fn messages_paginate_backward_with_exclusive_from() {
    test_utils::init_test_services();
    let frank = test_utils::register_test_user("frank", "tok_frank");

    let body = CreateRoomBody {
        preset: Some("private_chat".to_owned()),
        ..Default::default()
    };
    let (room_id, _) = create_room(body, &frank).await.expect("room creation");

    let mutex = services().globals.room_mutex_state(&room_id).await;
    let mut last_event_id = None;
    for i in 0..4 {
        let state_lock = mutex.lock().await;
        let event_id = services()
            .rooms
            .timeline
            .build_and_append_pdu(
                PduBuilder::timeline(
                    EventType::RoomMessage,
                    json!({ "body": format!("m{i}") }),
                ),
                &frank,
                &room_id,
                &state_lock,
            )
            .await
            .expect("message commits");
        last_event_id = Some(event_id);
    }

    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer tok_frank".parse().unwrap());

    let mut query = HashMap::new();
    query.insert("from".to_owned(), last_event_id.unwrap().as_str().to_owned());
    query.insert("dir".to_owned(), "b".to_owned());
    query.insert("limit".to_owned(), "2".to_owned());

    let response = get_messages_route(
        headers,
        Path(room_id.as_str().to_owned()),
        Query(query),
    )
    .await
    .expect("messages respond");

    let body = response.0;
    let chunk = body.get("chunk").and_then(Value::as_array).unwrap();
    assert_eq!(chunk.len(), 2);

    // Backward pagination, from-token exclusive: the newest returned event
    // is the one before 'from'.
    assert_eq!(chunk[0]["content"]["body"], "m2");
    assert_eq!(chunk[1]["content"]["body"], "m1");
    assert!(chunk.iter().all(|e| e["unsigned"]["age"].is_u64()));
    assert!(!body["end"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn messages_require_membership() {
    test_utils::init_test_services();
    let grace = test_utils::register_test_user("grace", "tok_grace");
    let heidi = test_utils::register_test_user("heidi", "tok_heidi");
    let _ = heidi;

    let body = CreateRoomBody {
        preset: Some("private_chat".to_owned()),
        ..Default::default()
    };
    let (room_id, _) = create_room(body, &grace).await.expect("room creation");
    let (top_id, _, _) = services().rooms.timeline.top(&room_id).unwrap().unwrap();

    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer tok_heidi".parse().unwrap());

    let mut query = HashMap::new();
    query.insert("from".to_owned(), top_id.as_str().to_owned());
    query.insert("dir".to_owned(), "b".to_owned());

    let denied = get_messages_route(
        headers,
        Path(room_id.as_str().to_owned()),
        Query(query),
    )
    .await;
    assert!(denied.is_err());
}

#[tokio::test]
async fn key_query_serves_cached_documents_and_404s_unknown_ids() {
    test_utils::init_test_services();
    let server_name = services().globals.server_name().clone();
    let key_id = services().globals.key_id().to_owned();

    // The single-key form returns the cached document.
    let response = server_server::key_query_route(
        Path((server_name.as_str().to_owned(), key_id.clone())),
        RawQuery(None),
    )
    .await
    .expect("own key is cached");
    assert_eq!(response.0["server_name"], server_name.as_str());
    assert!(response.0["verify_keys"][&key_id]["key"].is_string());

    // An uncached key id is a 404.
    let missing = server_server::key_query_route(
        Path((server_name.as_str().to_owned(), "ed25519:nope".to_owned())),
        RawQuery(None),
    )
    .await;
    assert!(missing.is_err());

    // The all-keys form streams every cached document.
    let all = server_server::key_query_all_route(
        Path(server_name.as_str().to_owned()),
        RawQuery(None),
    )
    .await
    .expect("key stream");
    let server_keys = all.0["server_keys"].as_array().unwrap();
    assert!(!server_keys.is_empty());
}

#[tokio::test]
async fn user_keys_query_verifies_origin_and_returns_device_keys() {
    test_utils::init_test_services();
    let ivan = test_utils::register_test_user("ivan", "tok_ivan");
    let device = DeviceId::new("IVANDEV");

    services()
        .users
        .add_device(&ivan, &device, Some("ivan's laptop"))
        .unwrap();
    services()
        .users
        .set_device_keys(
            &ivan,
            &device,
            &json!({
                "user_id": ivan.as_str(),
                "device_id": device.as_str(),
                "algorithms": ["m.olm.v1.curve25519-aes-sha2"],
                "keys": { "curve25519:IVANDEV": "key" }
            }),
        )
        .unwrap();

    // A device with no uploaded keys must be skipped.
    services()
        .users
        .add_device(&ivan, &DeviceId::new("KEYLESS"), None)
        .unwrap();

    let body = json!({ "device_keys": { ivan.as_str(): [] } });

    // Sign the request the way a peer would; our own key is in the cache.
    let globals = &services().globals;
    let request = json!({
        "method": "POST",
        "uri": "/_matrix/federation/v1/user/keys/query",
        "origin": globals.server_name().as_str(),
        "destination": globals.server_name().as_str(),
        "content": body,
    });
    let preimage = canonical::to_canonical_bytes(&request).unwrap();
    let signature = STANDARD_NO_PAD.encode(globals.keypair().sign(&preimage).to_bytes());

    let mut headers = HeaderMap::new();
    headers.insert(
        "authorization",
        format!(
            "X-Matrix origin={},key=\"{}\",sig=\"{}\"",
            globals.server_name(),
            globals.key_id(),
            signature
        )
        .parse()
        .unwrap(),
    );

    let response = server_server::user_keys_query_route(headers, axum::Json(body.clone()))
        .await
        .expect("authorized query succeeds");

    let device_keys = &response.0["device_keys"][ivan.as_str()];
    assert_eq!(
        device_keys["IVANDEV"]["unsigned"]["device_display_name"],
        "ivan's laptop"
    );
    assert!(device_keys["IVANDEV"]["keys"]["curve25519:IVANDEV"].is_string());
    assert!(device_keys.get("KEYLESS").is_none());

    // Unsigned requests are refused.
    let denied =
        server_server::user_keys_query_route(HeaderMap::new(), axum::Json(body)).await;
    assert!(denied.is_err());
}
