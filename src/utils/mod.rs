// =============================================================================
// Palaver Matrix Homeserver - Utils Module
// =============================================================================
//
// Project: Palaver - Federated Matrix Homeserver Core
// Author: Palaver Development Team
// Date: 2025-11-08
// Version: 0.3.0
// License: Apache 2.0 / MIT
//
// Description:
//   Small shared helpers: wall-clock millis, random localparts, byte codecs
//   for the ordered key-value trees.
//
// Dependencies:
//   • Serialization with serde
//
// References:
//   • Matrix spec: https://spec.matrix.org/
//
// =============================================================================

pub mod error;

use std::time::{SystemTime, UNIX_EPOCH};

use rand::{distributions::Alphanumeric, Rng};

pub fn millis_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_millis() as u64
}

pub fn random_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub fn u64_from_bytes(bytes: &[u8]) -> Result<u64, std::array::TryFromSliceError> {
    let array: [u8; 8] = bytes.try_into()?;
    Ok(u64::from_be_bytes(array))
}

pub fn i64_from_bytes(bytes: &[u8]) -> Result<i64, std::array::TryFromSliceError> {
    let array: [u8; 8] = bytes.try_into()?;
    Ok(i64::from_be_bytes(array))
}

pub fn string_from_bytes(bytes: &[u8]) -> Result<String, std::string::FromUtf8Error> {
    String::from_utf8(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_roundtrips_through_be_bytes() {
        let value = 0x1122_3344_5566_7788u64;
        assert_eq!(u64_from_bytes(&value.to_be_bytes()).unwrap(), value);
    }

    #[test]
    fn u64_from_short_slice_fails() {
        assert!(u64_from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn random_strings_have_requested_length() {
        assert_eq!(random_string(18).len(), 18);
        assert_ne!(random_string(18), random_string(18));
    }
}
