// =============================================================================
// Palaver Matrix Homeserver - Keys Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   The peer public-key cache: stores signed key documents per server and
//   key ID, resolves verify keys for signature checks, and publishes this
//   server's own key document into the cache at startup.
//
// Features:
//   • Key document storage and per-server enumeration
//   • ed25519 verify-key resolution for event verification
//   • Self-signed own-key publication
//
// Dependencies:
//   • Signatures via ed25519-dalek
//   • Serialization with serde
//
// References:
//   • Matrix spec: https://spec.matrix.org/v1.11/server-server-api/#retrieving-server-keys
//
// =============================================================================

mod data;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
pub use data::Data;
use ed25519_dalek::{Signer, VerifyingKey};
use serde_json::{json, Value};
use tracing::debug;

use crate::{canonical, mxid::ServerName, services, Error, ErrorKind, Result};

/// Validity horizon advertised on our own key document.
const OWN_KEY_VALID_MS: u64 = 7 * 24 * 60 * 60 * 1000;

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    /// The verify key a server advertises for a key ID, when cached.
    ///
    /// Absence is not an error: verification treats it as "does not
    /// verify".
    pub fn verify_key(
        &self,
        server_name: &ServerName,
        key_id: &str,
    ) -> Result<Option<VerifyingKey>> {
        let Some(document) = self.db.key_document(server_name, key_id)? else {
            return Ok(None);
        };

        let Some(key_b64) = document
            .get("verify_keys")
            .and_then(|keys| keys.get(key_id))
            .and_then(|entry| entry.get("key"))
            .and_then(Value::as_str)
        else {
            return Ok(None);
        };

        let bytes = STANDARD_NO_PAD
            .decode(key_b64)
            .map_err(|_| Error::BadRequest(ErrorKind::MalformedInput, "Cached key is not valid base64"))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::BadRequest(ErrorKind::MalformedInput, "Cached key has wrong length"))?;

        Ok(VerifyingKey::from_bytes(&bytes).ok())
    }

    pub fn key_document(&self, server_name: &ServerName, key_id: &str) -> Result<Option<Value>> {
        self.db.key_document(server_name, key_id)
    }

    pub fn key_documents(&self, server_name: &ServerName) -> Result<Vec<Value>> {
        self.db.key_documents(server_name)
    }

    pub fn store_key_document(
        &self,
        server_name: &ServerName,
        key_id: &str,
        document: &Value,
    ) -> Result<()> {
        self.db.store_key_document(server_name, key_id, document)
    }

    /// Builds, signs and caches this server's own key document so local
    /// events verify through the same path as remote ones.
    pub fn publish_own_key(&self) -> Result<()> {
        let globals = &services().globals;
        let server_name = globals.server_name().clone();
        let key_id = globals.key_id().to_owned();
        let verify_key = STANDARD_NO_PAD.encode(globals.keypair().verifying_key().to_bytes());

        let mut document = json!({
            "server_name": server_name.as_str(),
            "valid_until_ts": crate::utils::millis_since_unix_epoch() + OWN_KEY_VALID_MS,
            "verify_keys": {
                &key_id: { "key": verify_key }
            },
            "old_verify_keys": {}
        });

        // Self-sign the canonical document.
        let preimage = canonical::to_canonical_bytes(&document)?;
        let signature = globals.keypair().sign(&preimage);
        document["signatures"] = json!({
            server_name.as_str(): {
                &key_id: STANDARD_NO_PAD.encode(signature.to_bytes())
            }
        });

        self.db.store_key_document(&server_name, &key_id, &document)?;
        debug!(key_id = %key_id, "published own signing key");
        Ok(())
    }
}
