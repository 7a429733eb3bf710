// =============================================================================
// Palaver Matrix Homeserver - Fetch Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   The federation fetch client seam: issues backfill and missing-events
//   requests to a peer and resolves with the returned set of events. Ships
//   an HTTP implementation over reqwest and an in-memory implementation
//   used by tests and offline operation.
//
// Features:
//   • Wall-clock timeout per request
//   • Destination hinting
//   • Pluggable transport behind one async trait
//
// Dependencies:
//   • HTTP client with reqwest
//   • Tokio async runtime
//   • Serialization with serde
//
// References:
//   • Matrix spec: https://spec.matrix.org/v1.11/server-server-api/#backfill
//
// =============================================================================

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::{
    canonical::CanonicalObject,
    mxid::{EventId, RoomId, ServerName},
    Error, ErrorKind, Result,
};

/// The operation a fetch performs against the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOp {
    Backfill,
    GetMissingEvents,
}

#[derive(Clone, Debug)]
pub struct FetchOpts {
    pub room_id: RoomId,
    pub event_id: EventId,
    pub backfill_limit: usize,
    pub hint: Option<ServerName>,
    /// Bound attempts to the hinted destination only.
    pub hint_only: bool,
}

/// A set of events returned by a peer.
#[derive(Clone, Debug, Default)]
pub struct FetchResult {
    pub pdus: Vec<CanonicalObject>,
}

#[async_trait]
pub trait FetchClient: Send + Sync {
    async fn fetch(&self, op: FetchOp, opts: &FetchOpts) -> Result<FetchResult>;
}

pub struct Service {
    pub client: Arc<dyn FetchClient>,
}

impl Service {
    /// Validates that a fetch could be submitted at all. Used by the
    /// acquirer to fail submissions synchronously.
    pub fn check(&self, opts: &FetchOpts) -> Result<()> {
        if opts.hint.is_none() {
            return Err(Error::BadRequest(ErrorKind::NotFound, "No destination hint for fetch"));
        }

        if opts.backfill_limit == 0 {
            return Err(Error::BadRequest(ErrorKind::Invalid, "Backfill limit must be positive"));
        }

        Ok(())
    }

    pub async fn backfill(&self, opts: &FetchOpts) -> Result<FetchResult> {
        self.client.fetch(FetchOp::Backfill, opts).await
    }
}

/// Fetches over federation HTTP.
pub struct HttpFetchClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetchClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|_| Error::bad_config("Failed to build federation HTTP client"))?;

        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl FetchClient for HttpFetchClient {
    async fn fetch(&self, op: FetchOp, opts: &FetchOpts) -> Result<FetchResult> {
        let destination = opts
            .hint
            .as_ref()
            .ok_or(Error::BadRequest(ErrorKind::NotFound, "No destination hint for fetch"))?;

        let request = match op {
            FetchOp::Backfill => {
                let url = format!(
                    "https://{}/_matrix/federation/v1/backfill/{}",
                    destination,
                    opts.room_id.as_str(),
                );
                self.client
                    .get(url)
                    .query(&[
                        ("v", opts.event_id.as_str()),
                        ("limit", &opts.backfill_limit.to_string()),
                    ])
                    .timeout(self.timeout)
            }
            FetchOp::GetMissingEvents => {
                let url = format!(
                    "https://{}/_matrix/federation/v1/get_missing_events/{}",
                    destination,
                    opts.room_id.as_str(),
                );
                self.client
                    .post(url)
                    .json(&serde_json::json!({
                        "latest_events": [opts.event_id.as_str()],
                        "earliest_events": [],
                        "limit": opts.backfill_limit,
                    }))
                    .timeout(self.timeout)
            }
        };

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::BadServerResponse("Peer rejected the fetch request"));
        }

        let body: Value = response.json().await?;
        let pdus = body
            .get("pdus")
            .or_else(|| body.get("events"))
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_object)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        debug!(
            destination = destination.as_str(),
            pdus = pdus.len(),
            "fetch resolved"
        );

        Ok(FetchResult { pdus })
    }
}

/// An in-memory peer: canned responses keyed by the requested event. Used
/// by tests and as the offline default.
#[derive(Default)]
pub struct MemoryFetchClient {
    responses: StdRwLock<HashMap<String, Vec<CanonicalObject>>>,
    log: StdMutex<Vec<(String, usize)>>,
}

impl MemoryFetchClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_response(&self, event_id: &EventId, pdus: Vec<CanonicalObject>) {
        self.responses
            .write()
            .unwrap()
            .insert(event_id.as_str().to_owned(), pdus);
    }

    /// The `(event_id, limit)` submissions observed, in order.
    pub fn submissions(&self) -> Vec<(String, usize)> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl FetchClient for MemoryFetchClient {
    async fn fetch(&self, _op: FetchOp, opts: &FetchOpts) -> Result<FetchResult> {
        self.log
            .lock()
            .unwrap()
            .push((opts.event_id.as_str().to_owned(), opts.backfill_limit));

        match self
            .responses
            .read()
            .unwrap()
            .get(opts.event_id.as_str())
        {
            Some(pdus) => Ok(FetchResult { pdus: pdus.clone() }),
            None => Err(Error::BadRequest(ErrorKind::NotFound, "Peer has no such event")),
        }
    }
}
