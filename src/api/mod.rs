// =============================================================================
// Palaver Matrix Homeserver - API Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   The HTTP resource layer: client-server and server-server endpoint
//   handlers and the router wiring them to paths.
//
// Dependencies:
//   • HTTP routing with axum
//
// References:
//   • Matrix spec: https://spec.matrix.org/
//
// =============================================================================

pub mod client_server;
pub mod server_server;

use axum::{
    routing::{get, post},
    Router,
};

/// All Matrix endpoints this server exposes.
pub fn router() -> Router {
    Router::new()
        .route(
            "/_matrix/client/r0/createRoom",
            post(client_server::room::create_room_route),
        )
        .route(
            "/_matrix/client/r0/rooms/:room_id/messages",
            get(client_server::message::get_messages_route),
        )
        .route(
            "/_matrix/federation/v1/user/keys/query",
            post(server_server::user_keys_query_route),
        )
        .route(
            "/_matrix/key/v2/query/:server_name",
            get(server_server::key_query_all_route),
        )
        .route(
            "/_matrix/key/v2/query/:server_name/:key_id",
            get(server_server::key_query_route),
        )
        .route(
            "/_matrix/federation/v1/backfill/:room_id",
            get(server_server::backfill_route),
        )
}
