//! Time-ordered base36 identifiers.
//!
//! Generated ids sort lexicographically in creation order: the first six
//! characters encode whole seconds since the Confab epoch, the rest is random.

use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Lowercase alphanumeric characters in ASCII order, so that int-encoded ids
/// compare the same way as the integers they encode.
pub const BASE36_CHARS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Time-ordered ids count seconds from January 1st 2007 00:00:00 UTC.
///
/// Six base36 characters hold seconds from this epoch until 2075.
pub const CONFAB_EPOCH: i64 = 1_167_609_600;

const TIME_CHARS: usize = 6;

/// Generate a time-ordered id: 6 chars of timestamp followed by random chars.
///
/// `num_chars` must be at least 6. Pass `None` to use the current time.
pub fn unique_id_from_datetime(timestamp: Option<DateTime<Utc>>, num_chars: usize) -> String {
    assert!(num_chars >= TIME_CHARS);
    let now = timestamp.unwrap_or_else(Utc::now);
    let secs = (now.timestamp() - CONFAB_EPOCH).max(0) as u64;
    let mut id = unique_id_from_int(secs, TIME_CHARS);
    id.push_str(&unique_id_random(num_chars - TIME_CHARS));
    id
}

/// Generate `num_chars` random base36 characters.
pub fn unique_id_random(num_chars: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..num_chars)
        .map(|_| BASE36_CHARS[rng.gen_range(0..BASE36_CHARS.len())] as char)
        .collect()
}

/// Derive a deterministic base36 id from the SHA-256 hash of a value.
///
/// Used for ids that must be stable across replicas (channel workspaces,
/// conversation threads). `num_chars` is capped at 44.
pub fn unique_id_from_str(value: &str, num_chars: usize, salt: Option<&str>) -> String {
    assert!(num_chars <= 44);
    let salted = match salt {
        Some(salt) => format!("{salt}:{value}"),
        None => value.to_string(),
    };
    let digest = Sha256::digest(salted.as_bytes());

    use base64::Engine as _;
    let encoded = base64::engine::general_purpose::STANDARD.encode(digest);
    let alphanum: String = encoded
        .to_lowercase()
        .chars()
        .map(|c| match c {
            '+' => 'a',
            '/' => 'b',
            '=' => '0',
            other => other,
        })
        .collect();
    alphanum[..num_chars].to_string()
}

/// Convert an integer to a fixed-length base36 string (most significant first).
pub fn unique_id_from_int(mut value: u64, num_chars: usize) -> String {
    let base = BASE36_CHARS.len() as u64;
    let mut digits: Vec<u8> = Vec::new();

    while value > 0 {
        digits.push(BASE36_CHARS[(value % base) as usize]);
        value /= base;
    }
    while digits.len() < num_chars {
        digits.push(b'0');
    }

    digits.reverse();
    digits.truncate(num_chars);
    String::from_utf8(digits).expect("base36 output is ascii")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn int_encoding_is_fixed_length_and_ordered() {
        assert_eq!(unique_id_from_int(0, 6), "000000");
        assert_eq!(unique_id_from_int(35, 6), "00000z");
        assert_eq!(unique_id_from_int(36, 6), "000010");
        assert!(unique_id_from_int(1000, 6) < unique_id_from_int(1001, 6));
    }

    #[test]
    fn datetime_ids_sort_by_time() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let a = unique_id_from_datetime(Some(early), 24);
        let b = unique_id_from_datetime(Some(late), 24);
        assert_eq!(a.len(), 24);
        assert!(a[..6] < b[..6]);
    }

    #[test]
    fn known_epoch_mapping() {
        // January 1st 2025 00:00:00 UTC maps to "9e7xc0".
        let dt = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let id = unique_id_from_datetime(Some(dt), 6);
        assert_eq!(id, "9e7xc0");
    }

    #[test]
    fn hash_ids_are_deterministic() {
        let a = unique_id_from_str("hello", 36, Some("salt"));
        let b = unique_id_from_str("hello", 36, Some("salt"));
        let c = unique_id_from_str("hello", 36, Some("other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 36);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
