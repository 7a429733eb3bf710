use serde_json::Value;

use crate::{
    mxid::{DeviceId, UserId},
    Result,
};

/// Storage surface for the device registry and client authentication.
pub trait Data: Send + Sync {
    fn set_access_token(&self, user_id: &UserId, token: &str) -> Result<()>;

    fn user_from_token(&self, token: &str) -> Result<Option<UserId>>;

    fn add_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        display_name: Option<&str>,
    ) -> Result<()>;

    fn device_ids(&self, user_id: &UserId) -> Result<Vec<DeviceId>>;

    fn device_display_name(&self, user_id: &UserId, device_id: &DeviceId)
        -> Result<Option<String>>;

    fn set_device_keys(&self, user_id: &UserId, device_id: &DeviceId, keys: &Value) -> Result<()>;

    fn device_keys(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Option<Value>>;
}
