// =============================================================================
// Palaver Matrix Homeserver - Users Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   Local user bookkeeping: access-token resolution for client requests,
//   and the device registry with per-device identity keys served to
//   federation key queries.
//
// Dependencies:
//   • Serialization with serde
//
// References:
//   • Matrix spec: https://spec.matrix.org/v1.11/client-server-api/#devices
//
// =============================================================================

mod data;

pub use data::Data;
use serde_json::Value;

use crate::{
    mxid::{DeviceId, UserId},
    Result,
};

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    pub fn set_access_token(&self, user_id: &UserId, token: &str) -> Result<()> {
        self.db.set_access_token(user_id, token)
    }

    pub fn user_from_token(&self, token: &str) -> Result<Option<UserId>> {
        self.db.user_from_token(token)
    }

    pub fn add_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        display_name: Option<&str>,
    ) -> Result<()> {
        self.db.add_device(user_id, device_id, display_name)
    }

    pub fn device_ids(&self, user_id: &UserId) -> Result<Vec<DeviceId>> {
        self.db.device_ids(user_id)
    }

    pub fn device_display_name(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<String>> {
        self.db.device_display_name(user_id, device_id)
    }

    pub fn set_device_keys(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        keys: &Value,
    ) -> Result<()> {
        self.db.set_device_keys(user_id, device_id, keys)
    }

    pub fn device_keys(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Option<Value>> {
        self.db.device_keys(user_id, device_id)
    }
}
