// =============================================================================
// Palaver Matrix Homeserver - Config Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   Server configuration loaded from a TOML file with serde defaults for
//   every tunable. Protocol-critical knobs (event size bound, default room
//   version, pagination filter cap) live here.
//
// Dependencies:
//   • Serialization with serde
//   • TOML parsing with toml
//
// References:
//   • Matrix spec: https://spec.matrix.org/
//
// =============================================================================

use std::{net::SocketAddr, path::Path};

use serde::Deserialize;

use crate::{mxid::ServerName, Error, Result};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub server_name: ServerName,

    #[serde(default = "default_address")]
    pub address: SocketAddr,

    /// The maximum size of an event we will create. This may also be used in
    /// some contexts for what we will accept.
    #[serde(default = "default_event_max_size")]
    pub event_max_size: usize,

    /// Room version assigned to rooms created without an explicit version.
    #[serde(default = "default_room_version")]
    pub default_room_version: String,

    /// How many filtered-out events a /messages scan may skip before the
    /// page is cut short.
    #[serde(default = "default_max_filter_miss")]
    pub messages_max_filter_miss: usize,

    /// Depth window approximating "recent history" for a room.
    #[serde(default = "default_viewport_size")]
    pub viewport_size: usize,

    /// Default cap on concurrently in-flight backfill fetches.
    #[serde(default = "default_fetch_width")]
    pub fetch_width: usize,

    /// Wall-clock timeout for a single federation fetch.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    #[serde(default = "default_log")]
    pub log: String,
}

fn default_address() -> SocketAddr {
    "127.0.0.1:8008".parse().expect("valid literal")
}

fn default_event_max_size() -> usize {
    65507
}

fn default_room_version() -> String {
    "5".to_owned()
}

fn default_max_filter_miss() -> usize {
    2048
}

fn default_viewport_size() -> usize {
    96
}

fn default_fetch_width() -> usize {
    16
}

fn default_fetch_timeout_ms() -> u64 {
    15_000
}

fn default_log() -> String {
    "info".to_owned()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&raw).map_err(|_| Error::bad_config("Failed to parse config file"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_max_size == 0 {
            return Err(Error::bad_config("event_max_size must be greater than 0"));
        }

        if self.fetch_width == 0 {
            return Err(Error::bad_config("fetch_width must be greater than 0"));
        }

        if crate::service::pdu::RoomVersion::parse(&self.default_room_version).is_none() {
            return Err(Error::bad_config("default_room_version is not supported"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: Config = toml::from_str(r#"server_name = "example.org""#).unwrap();
        assert_eq!(config.event_max_size, 65507);
        assert_eq!(config.default_room_version, "5");
        assert_eq!(config.messages_max_filter_miss, 2048);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_fetch_width_is_rejected() {
        let config: Config =
            toml::from_str("server_name = \"example.org\"\nfetch_width = 0").unwrap();
        assert!(config.validate().is_err());
    }
}
