// =============================================================================
// Palaver Matrix Homeserver - Globals Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   Server-wide state: configuration access, the signing keypair, the
//   monotone event-index counter, per-room serialization mutexes and the
//   cooperative shutdown flag checked at suspension points.
//
// Features:
//   • Process-wide monotone counters behind the storage seam
//   • Per-room cooperative locks for insert and state mutation
//   • Checkpoint-based cancellation
//
// Dependencies:
//   • Tokio async runtime
//   • Structured logging with tracing
//   • Signatures via ed25519-dalek
//
// References:
//   • Matrix spec: https://spec.matrix.org/
//
// =============================================================================

mod data;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

pub use data::{Data, SigningKeys};
use ed25519_dalek::SigningKey;
use tokio::sync::{Mutex, RwLock};

use crate::{
    mxid::{RoomId, ServerName},
    Config, Error, Result,
};

pub struct Service {
    pub db: &'static dyn Data,

    pub config: Config,
    keypair: Arc<SigningKeys>,

    pub roomid_mutex_insert: RwLock<HashMap<RoomId, Arc<Mutex<()>>>>,
    pub roomid_mutex_state: RwLock<HashMap<RoomId, Arc<Mutex<()>>>>,

    shutdown: AtomicBool,
}

impl Service {
    pub fn load(db: &'static dyn Data, config: Config) -> Result<Self> {
        config.validate()?;

        let keypair = match db.load_keypair() {
            Ok(k) => Arc::new(k),
            Err(e) => {
                db.remove_keypair()?;
                return Err(e);
            }
        };

        Ok(Self {
            db,
            config,
            keypair,
            roomid_mutex_insert: RwLock::new(HashMap::new()),
            roomid_mutex_state: RwLock::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn server_name(&self) -> &ServerName {
        &self.config.server_name
    }

    /// Returns this server's signing keypair.
    pub fn keypair(&self) -> &SigningKey {
        &self.keypair.key
    }

    pub fn key_id(&self) -> &str {
        &self.keypair.key_id
    }

    pub fn next_count(&self) -> Result<u64> {
        self.db.next_count()
    }

    pub fn current_count(&self) -> Result<u64> {
        self.db.current_count()
    }

    pub fn event_max_size(&self) -> usize {
        self.config.event_max_size
    }

    /// Acquires the per-room state mutex; held across event construction and
    /// commit so room state mutates under one writer at a time.
    pub async fn room_mutex_state(&self, room_id: &RoomId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.roomid_mutex_state
                .write()
                .await
                .entry(room_id.clone())
                .or_default(),
        )
    }

    /// Acquires the per-room insert mutex; held only across index assignment
    /// and append.
    pub async fn room_mutex_insert(&self, room_id: &RoomId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.roomid_mutex_insert
                .write()
                .await
                .entry(room_id.clone())
                .or_default(),
        )
    }

    /// Requests cooperative cancellation of long-running work.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn interrupted(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Checkpoint: raises the distinguished interrupt error when shutdown
    /// has been requested.
    pub fn interruption_point(&self) -> Result<()> {
        if self.interrupted() {
            return Err(Error::Interrupted);
        }

        Ok(())
    }
}
