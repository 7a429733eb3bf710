// =============================================================================
// Palaver Matrix Homeserver - Messages Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   GET /_matrix/client/r0/rooms/{roomId}/messages: depth-ordered
//   pagination over the room sequence with filter support and the
//   filter-miss cap.
//
// Dependencies:
//   • HTTP routing with axum
//   • Serialization with serde
//
// References:
//   • Matrix spec: https://spec.matrix.org/v1.11/client-server-api/#get_matrixclientv3roomsroomidmessages
//
// =============================================================================

use std::collections::HashMap;

use axum::{
    extract::{Path, Query},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};

use crate::{
    mxid::{EventId, RoomId},
    service::pdu::PduEvent,
    services, Error, Result,
};

/// Client-Server 6.3.6 query parameters.
struct PaginationTokens {
    limit: usize,
    dir: char,
    from: EventId,
    to: Option<EventId>,
}

impl PaginationTokens {
    fn parse(query: &HashMap<String, String>) -> Result<Self> {
        // The maximum number of events to return. Default: 10, capped 255.
        let limit = match query.get("limit") {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| Error::BadPagination("query parameter 'limit' is invalid"))?
                .min(255),
            None => 10,
        };

        let dir = query
            .get("dir")
            .and_then(|d| d.chars().next())
            .ok_or(Error::BadPagination("query parameter 'dir' is required"))?;
        if dir != 'b' && dir != 'f' {
            return Err(Error::BadPagination("query parameter 'dir' must be 'b' or 'f'"));
        }

        let from = query
            .get("from")
            .ok_or(Error::BadPagination("query parameter 'from' is required"))
            .and_then(|from| {
                EventId::parse(from)
                    .map_err(|_| Error::BadPagination("query parameter 'from' is not a valid token"))
            })?;

        let to = query
            .get("to")
            .filter(|to| !to.is_empty())
            .map(|to| {
                EventId::parse(to)
                    .map_err(|_| Error::BadPagination("query parameter 'to' is not a valid token"))
            })
            .transpose()?;

        Ok(Self { limit, dir, from, to })
    }
}

/// The subset of the room event filter this endpoint honors.
struct RoomEventFilter {
    types: Option<Vec<String>>,
    not_types: Vec<String>,
    senders: Option<Vec<String>>,
    not_senders: Vec<String>,
}

impl RoomEventFilter {
    fn parse(raw: Option<&String>) -> Result<Option<Self>> {
        let Some(raw) = raw.filter(|raw| !raw.is_empty()) else {
            return Ok(None);
        };

        let json: Value = serde_json::from_str(raw)
            .map_err(|_| Error::BadPagination("query parameter 'filter' is not valid JSON"))?;

        let list = |key: &str| -> Option<Vec<String>> {
            json.get(key).and_then(Value::as_array).map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
        };

        Ok(Some(Self {
            types: list("types"),
            not_types: list("not_types").unwrap_or_default(),
            senders: list("senders"),
            not_senders: list("not_senders").unwrap_or_default(),
        }))
    }

    fn matches(&self, pdu: &PduEvent) -> bool {
        let kind = pdu.kind.as_str();
        let sender = pdu.sender.as_str();

        if self.not_types.iter().any(|t| type_glob(t, kind)) {
            return false;
        }

        if let Some(types) = &self.types {
            if !types.iter().any(|t| type_glob(t, kind)) {
                return false;
            }
        }

        if self.not_senders.iter().any(|s| s == sender) {
            return false;
        }

        if let Some(senders) = &self.senders {
            if !senders.iter().any(|s| s == sender) {
                return false;
            }
        }

        true
    }
}

fn type_glob(pattern: &str, kind: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => kind.starts_with(prefix),
        None => pattern == kind,
    }
}

pub async fn get_messages_route(
    headers: HeaderMap,
    Path(room_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>> {
    let sender = super::authenticated_user(&headers)?;
    let room_id = RoomId::parse(&room_id)?;

    let page = PaginationTokens::parse(&query)?;
    let filter = RoomEventFilter::parse(query.get("filter"))?;

    if !services().rooms.state.is_joined(&room_id, &sender)? {
        return Err(Error::BadRequest(
            crate::ErrorKind::Auth,
            "You are not permitted to view the room at this event",
        ));
    }

    let max_filter_miss = services().globals.config.messages_max_filter_miss;
    let current_sequence = services().rooms.vm.current_sequence();

    let mut chunk: Vec<Value> = Vec::new();
    let mut start = String::new();
    let mut end = String::new();
    let mut hit = 0usize;
    let mut miss = 0usize;

    let backwards = page.dir == 'b';
    let iter = services()
        .rooms
        .timeline
        .pdus_from(&room_id, &page.from, backwards)?;

    // The 'from' token is exclusive.
    for entry in iter.skip(1) {
        let (event_idx, pdu) = entry?;
        let event_id = pdu.event_id.clone().ok_or(Error::bad_database("Stored event has no ID"))?;

        if let Some(to) = &page.to {
            if &event_id == to {
                if page.dir != 'b' {
                    start = event_id.as_str().to_owned();
                }
                break;
            }
        }

        match &filter {
            Some(filter) if !filter.matches(&pdu) => miss += 1,
            _ => {
                chunk.push(chunk_entry(&pdu, event_idx, current_sequence)?);
                hit += 1;
            }
        }

        if hit >= page.limit || miss >= max_filter_miss {
            if page.dir == 'b' {
                end = event_id.as_str().to_owned();
            } else {
                start = event_id.as_str().to_owned();
            }
            break;
        }
    }

    Ok(Json(json!({
        "chunk": chunk,
        "start": start,
        "end": end,
    })))
}

/// One chunk entry: the event plus its age derived from the commit
/// sequence distance.
fn chunk_entry(pdu: &PduEvent, event_idx: u64, current_sequence: u64) -> Result<Value> {
    let mut object = pdu.to_object()?;
    if let Some(event_id) = &pdu.event_id {
        object.insert("event_id".to_owned(), json!(event_id.as_str()));
    }

    let age = current_sequence.saturating_sub(event_idx);
    let unsigned = object
        .entry("unsigned".to_owned())
        .or_insert_with(|| Value::Object(Default::default()));
    if let Some(unsigned) = unsigned.as_object_mut() {
        unsigned.insert("age".to_owned(), json!(age));
    }

    Ok(Value::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn pagination_requires_dir_and_from() {
        assert!(PaginationTokens::parse(&query(&[("from", "$a")])).is_err());
        assert!(PaginationTokens::parse(&query(&[("dir", "b")])).is_err());
        assert!(PaginationTokens::parse(&query(&[("dir", "x"), ("from", "$a")])).is_err());
        assert!(PaginationTokens::parse(&query(&[("dir", "b"), ("from", "$a")])).is_ok());
    }

    #[test]
    fn limit_defaults_and_clamps() {
        let default = PaginationTokens::parse(&query(&[("dir", "f"), ("from", "$a")])).unwrap();
        assert_eq!(default.limit, 10);

        let clamped =
            PaginationTokens::parse(&query(&[("dir", "f"), ("from", "$a"), ("limit", "9000")]))
                .unwrap();
        assert_eq!(clamped.limit, 255);

        assert!(
            PaginationTokens::parse(&query(&[("dir", "f"), ("from", "$a"), ("limit", "ten")]))
                .is_err()
        );
    }

    #[test]
    fn filter_glob_matches_type_prefixes() {
        assert!(type_glob("m.room.*", "m.room.message"));
        assert!(!type_glob("m.room.*", "m.presence"));
        assert!(type_glob("m.room.message", "m.room.message"));
    }
}
