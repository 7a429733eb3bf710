// =============================================================================
// Palaver Matrix Homeserver - Client API Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   Client-server endpoint handlers and the bearer-token authentication
//   shared between them.
//
// Dependencies:
//   • HTTP routing with axum
//
// References:
//   • Matrix spec: https://spec.matrix.org/v1.11/client-server-api/
//
// =============================================================================

pub mod message;
pub mod room;

use axum::http::HeaderMap;

use crate::{mxid::UserId, services, Error, ErrorKind, Result};

/// Resolves the authenticated user from the bearer token.
pub fn authenticated_user(headers: &HeaderMap) -> Result<UserId> {
    let token = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(Error::BadRequest(ErrorKind::Auth, "Missing access token"))?;

    services()
        .users
        .user_from_token(token)?
        .ok_or(Error::BadRequest(ErrorKind::Auth, "Unknown access token"))
}
