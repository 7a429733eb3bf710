// =============================================================================
// Palaver Matrix Homeserver - Identifiers Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   Validated Matrix identifier newtypes: user IDs, room IDs, event IDs and
//   server names. Parsing rejects malformed MXIDs at the boundary so the
//   rest of the server can assume well-formed identifiers.
//
// Features:
//   • Sigil and server-part validation
//   • Cheap clones via shared string storage
//   • Transparent serde as plain strings
//
// Dependencies:
//   • Serialization with serde
//
// References:
//   • Matrix spec: https://spec.matrix.org/appendices/#identifier-grammar
//
// =============================================================================

use std::{fmt, sync::Arc};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, ErrorKind, Result};

const MXID_MAX_LEN: usize = 255;

fn valid_server_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MXID_MAX_LEN {
        return false;
    }

    let (host, port) = match name.rsplit_once(':') {
        // An IPv6 literal contains colons itself; only treat the suffix as a
        // port when it parses as one.
        Some((host, port)) if port.parse::<u16>().is_ok() => (host, Some(port)),
        _ => (name, None),
    };

    let _ = port;
    if host.is_empty() {
        return false;
    }

    if host.starts_with('[') && host.ends_with(']') {
        return host[1..host.len() - 1]
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.');
    }

    host.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

macro_rules! mxid_type {
    ($name:ident, $sigil:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }

            pub fn sigil() -> char {
                $sigil
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                $name::parse(&s).map_err(de::Error::custom)
            }
        }
    };
}

mxid_type!(UserId, '@', "A Matrix user ID: `@localpart:server`.");
mxid_type!(RoomId, '!', "A Matrix room ID: `!opaque:server`.");
mxid_type!(EventId, '$', "A Matrix event ID: `$opaque[:server]`.");

impl UserId {
    pub fn parse(s: impl AsRef<str>) -> Result<Self> {
        let s = s.as_ref();
        let rest = s
            .strip_prefix('@')
            .ok_or(Error::BadRequest(ErrorKind::MalformedInput, "User ID must start with '@'"))?;

        let (localpart, server) = rest
            .split_once(':')
            .ok_or(Error::BadRequest(ErrorKind::MalformedInput, "User ID is missing a server name"))?;

        if localpart.is_empty() || !valid_server_name(server) || s.len() > MXID_MAX_LEN {
            return Err(Error::BadRequest(ErrorKind::MalformedInput, "Invalid user ID"));
        }

        Ok(Self(s.into()))
    }

    pub fn localpart(&self) -> &str {
        let rest = &self.0['@'.len_utf8()..];
        rest.split_once(':').map(|(l, _)| l).unwrap_or(rest)
    }

    pub fn server_name(&self) -> ServerName {
        let (_, server) = self.0.split_once(':').expect("validated at parse");
        ServerName(server.into())
    }
}

impl RoomId {
    pub fn parse(s: impl AsRef<str>) -> Result<Self> {
        let s = s.as_ref();
        let rest = s
            .strip_prefix('!')
            .ok_or(Error::BadRequest(ErrorKind::MalformedInput, "Room ID must start with '!'"))?;

        let (opaque, server) = rest
            .split_once(':')
            .ok_or(Error::BadRequest(ErrorKind::MalformedInput, "Room ID is missing a server name"))?;

        if opaque.is_empty() || !valid_server_name(server) || s.len() > MXID_MAX_LEN {
            return Err(Error::BadRequest(ErrorKind::MalformedInput, "Invalid room ID"));
        }

        Ok(Self(s.into()))
    }

    /// Generates a fresh room ID on the given server.
    pub fn generate(server_name: &ServerName) -> Self {
        let localpart = crate::utils::random_string(18);
        Self(format!("!{}:{}", localpart, server_name).into())
    }

    pub fn server_name(&self) -> ServerName {
        let (_, server) = self.0.split_once(':').expect("validated at parse");
        ServerName(server.into())
    }
}

impl EventId {
    pub fn parse(s: impl AsRef<str>) -> Result<Self> {
        let s = s.as_ref();
        let rest = s
            .strip_prefix('$')
            .ok_or(Error::BadRequest(ErrorKind::MalformedInput, "Event ID must start with '$'"))?;

        if rest.is_empty() || s.len() > MXID_MAX_LEN {
            return Err(Error::BadRequest(ErrorKind::MalformedInput, "Invalid event ID"));
        }

        Ok(Self(s.into()))
    }

    /// Builds a room-version 1/2 style event ID: `$<body>:<server>`.
    pub fn from_parts(body: &str, server_name: &ServerName) -> Self {
        Self(format!("${}:{}", body, server_name).into())
    }

    /// Builds a room-version 3+ style event ID: `$<digest>` with no server.
    pub fn from_digest(digest_b64: &str) -> Self {
        Self(format!("${}", digest_b64).into())
    }

    /// The server part, present only on room-version 1/2 identifiers.
    pub fn server_name(&self) -> Option<ServerName> {
        self.0
            .split_once(':')
            .map(|(_, server)| ServerName(server.into()))
    }
}

/// A Matrix server name: a hostname with optional port.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerName(Arc<str>);

impl ServerName {
    pub fn parse(s: impl AsRef<str>) -> Result<Self> {
        let s = s.as_ref();
        if !valid_server_name(s) {
            return Err(Error::BadRequest(ErrorKind::MalformedInput, "Invalid server name"));
        }

        Ok(Self(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ServerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for ServerName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ServerName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ServerName::parse(&s).map_err(de::Error::custom)
    }
}

/// A device identifier; opaque, no sigil.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_parses_and_splits() {
        let user_id = UserId::parse("@alice:example.org").unwrap();
        assert_eq!(user_id.localpart(), "alice");
        assert_eq!(user_id.server_name().as_str(), "example.org");
    }

    #[test]
    fn user_id_requires_sigil_and_server() {
        assert!(UserId::parse("alice:example.org").is_err());
        assert!(UserId::parse("@alice").is_err());
        assert!(UserId::parse("@:example.org").is_err());
    }

    #[test]
    fn room_id_generation_is_well_formed() {
        let server = ServerName::parse("example.org").unwrap();
        let room_id = RoomId::generate(&server);
        assert!(RoomId::parse(room_id.as_str()).is_ok());
        assert_eq!(room_id.server_name().as_str(), "example.org");
    }

    #[test]
    fn event_id_server_part_is_optional() {
        let v1 = EventId::parse("$abcdef:example.org").unwrap();
        assert_eq!(v1.server_name().unwrap().as_str(), "example.org");

        let v4 = EventId::parse("$Rqnc-F-dvnEYJTyHq_iKxU2bZ1CI92-kuZq3a5lr5Zg").unwrap();
        assert!(v4.server_name().is_none());
    }

    #[test]
    fn server_name_accepts_ports_and_rejects_junk() {
        assert!(ServerName::parse("example.org:8448").is_ok());
        assert!(ServerName::parse("[::1]:8448").is_ok());
        assert!(ServerName::parse("exa mple.org").is_err());
        assert!(ServerName::parse("").is_err());
    }

    #[test]
    fn identifiers_serde_as_plain_strings() {
        let user_id = UserId::parse("@bob:example.org").unwrap();
        let json = serde_json::to_string(&user_id).unwrap();
        assert_eq!(json, "\"@bob:example.org\"");
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, user_id);

        let bad: std::result::Result<UserId, _> = serde_json::from_str("\"not-an-mxid\"");
        assert!(bad.is_err());
    }
}
