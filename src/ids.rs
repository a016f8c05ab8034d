//! Identifier generation: device codes, device ids, and request
//! correlation ids.

use rand::Rng;
use uuid::Uuid;

/// Device activation codes are short enough to type from a terminal prompt.
pub const DEVICE_CODE_LEN: usize = 6;

const DEVICE_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const BASE36_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generates a candidate device code: 6 uppercase alphanumerics.
///
/// Uniqueness against live rows is enforced by the caller, which retries
/// with fresh candidates.
pub fn generate_device_code() -> String {
    let mut rng = rand::thread_rng();
    (0..DEVICE_CODE_LEN)
        .map(|_| DEVICE_CODE_ALPHABET[rng.gen_range(0..DEVICE_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Generates a device id: `device_<unix-ms>_<9 base36 chars>`.
pub fn generate_device_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| BASE36_ALPHABET[rng.gen_range(0..BASE36_ALPHABET.len())] as char)
        .collect();
    format!(
        "device_{}_{}",
        chrono::Utc::now().timestamp_millis(),
        suffix
    )
}

/// Generates a request correlation id.
///
/// 128-bit random, unguessable, and never reused within a server lifetime.
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generates a telemetry id for an in-flight request entry.
pub fn generate_telemetry_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_code_shape() {
        for _ in 0..50 {
            let code = generate_device_code();
            assert_eq!(code.len(), DEVICE_CODE_LEN);
            assert!(code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn device_id_shape() {
        let id = generate_device_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "device");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2]
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn request_ids_do_not_repeat() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(generate_request_id()));
        }
    }
}
