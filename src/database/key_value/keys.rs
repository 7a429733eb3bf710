use serde_json::Value;

use crate::{
    database::{
        key_value::{join2, prefixed},
        KeyValueDatabase,
    },
    mxid::ServerName,
    service, Error, Result,
};

impl service::keys::Data for KeyValueDatabase {
    fn store_key_document(
        &self,
        server_name: &ServerName,
        key_id: &str,
        document: &Value,
    ) -> Result<()> {
        let value = serde_json::to_vec(document)
            .map_err(|_| Error::bad_database("Failed to serialize key document."))?;

        self.server_signingkeys
            .insert(&join2(server_name.as_bytes(), key_id.as_bytes()), &value)
    }

    fn key_document(&self, server_name: &ServerName, key_id: &str) -> Result<Option<Value>> {
        self.server_signingkeys
            .get(&join2(server_name.as_bytes(), key_id.as_bytes()))?
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|_| Error::bad_database("Invalid key document bytes."))
            })
            .transpose()
    }

    fn key_documents(&self, server_name: &ServerName) -> Result<Vec<Value>> {
        self.server_signingkeys
            .scan_prefix(prefixed(server_name.as_bytes()))
            .map(|(_, bytes)| {
                serde_json::from_slice(&bytes)
                    .map_err(|_| Error::bad_database("Invalid key document bytes."))
            })
            .collect()
    }
}
