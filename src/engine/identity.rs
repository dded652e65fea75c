// Device and session identifiers.

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

const DEVICE_ID_SALT: &[u8] = b"netpulse/device-id/v1";

/// Bytes of the digest kept in the device id.
const DEVICE_ID_BYTES: usize = 16;

/// Stable opaque device id: truncated SHA-256 over the hardware identifiers plus a salt.
pub fn hash_device_id(hardware_ids: &[String]) -> String {
    let mut hasher = Sha256::new();
    for id in hardware_ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(DEVICE_ID_SALT);
    let digest = hasher.finalize();
    hex::encode(&digest[..DEVICE_ID_BYTES])
}

/// Session ids are the wall-clock time of session creation in milliseconds.
pub fn new_session_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_is_stable() {
        let ids = vec!["imei-1".to_string(), "serial-2".to_string()];
        let a = hash_device_id(&ids);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, hash_device_id(&ids));
    }

    #[test]
    fn test_device_id_depends_on_field_boundaries() {
        let a = hash_device_id(&["ab".to_string(), "c".to_string()]);
        let b = hash_device_id(&["a".to_string(), "bc".to_string()]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_id_is_wall_clock_millis() {
        let id = new_session_id();
        // Later than 2020-01-01.
        assert!(id > 1_577_836_800_000);
    }
}
