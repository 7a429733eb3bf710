// =============================================================================
// Palaver Matrix Homeserver - Service Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   Central service container: builds every service over the database in
//   dependency order and exposes them through the global handle.
//
// Dependencies:
//   • Tokio async runtime
//   • Structured logging with tracing
//
// References:
//   • Matrix spec: https://spec.matrix.org/
//
// =============================================================================

pub mod fetch;
pub mod globals;
pub mod keys;
pub mod pdu;
pub mod rooms;
pub mod users;

use std::{collections::HashMap, sync::Arc, sync::Mutex as StdMutex, time::Duration};

use tracing::{debug, info};

use crate::{Config, Result};

pub struct Services {
    pub globals: globals::Service,
    pub keys: keys::Service,
    pub users: users::Service,
    pub fetch: fetch::Service,
    pub rooms: rooms::Service,
}

impl Services {
    /// Builds all services over one database handle. The federation HTTP
    /// fetch client is the default transport.
    pub fn build<
        D: globals::Data + keys::Data + users::Data + rooms::Data + 'static,
    >(
        db: &'static D,
        config: Config,
    ) -> Result<Self> {
        let fetch_client: Arc<dyn fetch::FetchClient> = Arc::new(fetch::HttpFetchClient::new(
            Duration::from_millis(config.fetch_timeout_ms),
        )?);

        Self::build_with_fetcher(db, config, fetch_client)
    }

    /// Builds all services with an explicit fetch transport; tests inject
    /// the in-memory peer here.
    pub fn build_with_fetcher<
        D: globals::Data + keys::Data + users::Data + rooms::Data + 'static,
    >(
        db: &'static D,
        config: Config,
        fetch_client: Arc<dyn fetch::FetchClient>,
    ) -> Result<Self> {
        info!(server_name = config.server_name.as_str(), "initializing services");

        let globals = globals::Service::load(db, config)?;
        debug!("globals service loaded");

        let current = globals.current_count()?;
        let services = Self {
            globals,
            keys: keys::Service { db },
            users: users::Service { db },
            fetch: fetch::Service { client: fetch_client },
            rooms: rooms::Service {
                timeline: rooms::timeline::Service { db },
                metadata: rooms::metadata::Service { db },
                state: rooms::state::Service {
                    db,
                    power_levels_cache: StdMutex::new(HashMap::new()),
                },
                vm: rooms::vm::Service::new(current),
            },
        };

        debug!("services initialized");
        Ok(services)
    }
}
