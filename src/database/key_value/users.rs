use serde_json::Value;

use crate::{
    database::{
        key_value::{join2, prefixed},
        KeyValueDatabase,
    },
    mxid::{DeviceId, UserId},
    service, utils, Error, Result,
};

impl service::users::Data for KeyValueDatabase {
    fn set_access_token(&self, user_id: &UserId, token: &str) -> Result<()> {
        self.token_userid.insert(token.as_bytes(), user_id.as_bytes())
    }

    fn user_from_token(&self, token: &str) -> Result<Option<UserId>> {
        self.token_userid
            .get(token.as_bytes())?
            .map(|bytes| {
                let s = utils::string_from_bytes(&bytes)
                    .map_err(|_| Error::bad_database("Invalid user id bytes."))?;
                UserId::parse(s)
            })
            .transpose()
    }

    fn add_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        display_name: Option<&str>,
    ) -> Result<()> {
        self.userid_devices.insert(
            &join2(user_id.as_bytes(), device_id.as_str().as_bytes()),
            display_name.unwrap_or_default().as_bytes(),
        )
    }

    fn device_ids(&self, user_id: &UserId) -> Result<Vec<DeviceId>> {
        let prefix = prefixed(user_id.as_bytes());

        Ok(self
            .userid_devices
            .scan_prefix(prefix.clone())
            .filter_map(|(key, _)| {
                key.get(prefix.len()..)
                    .and_then(|id| utils::string_from_bytes(id).ok())
                    .map(DeviceId::new)
            })
            .collect())
    }

    fn device_display_name(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<String>> {
        Ok(self
            .userid_devices
            .get(&join2(user_id.as_bytes(), device_id.as_str().as_bytes()))?
            .and_then(|bytes| utils::string_from_bytes(&bytes).ok())
            .filter(|name| !name.is_empty()))
    }

    fn set_device_keys(&self, user_id: &UserId, device_id: &DeviceId, keys: &Value) -> Result<()> {
        let value = serde_json::to_vec(keys)
            .map_err(|_| Error::bad_database("Failed to serialize device keys."))?;

        self.userid_devicekeys
            .insert(&join2(user_id.as_bytes(), device_id.as_str().as_bytes()), &value)
    }

    fn device_keys(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Option<Value>> {
        self.userid_devicekeys
            .get(&join2(user_id.as_bytes(), device_id.as_str().as_bytes()))?
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|_| Error::bad_database("Invalid device keys bytes."))
            })
            .transpose()
    }
}
