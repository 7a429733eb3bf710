use serde_json::Value;

use crate::{mxid::ServerName, Result};

/// Storage surface for the peer public-key cache.
pub trait Data: Send + Sync {
    fn store_key_document(
        &self,
        server_name: &ServerName,
        key_id: &str,
        document: &Value,
    ) -> Result<()>;

    fn key_document(&self, server_name: &ServerName, key_id: &str) -> Result<Option<Value>>;

    /// All cached key documents for a server, in key-id order.
    fn key_documents(&self, server_name: &ServerName) -> Result<Vec<Value>>;
}
