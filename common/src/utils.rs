use chrono::{DateTime, Utc};
use uuid::Uuid;

const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Length of generated entry ids.
pub const ENTRY_ID_LEN: usize = 10;

/// Short base62 id drawn from a random uuid.
pub fn new_entry_id() -> String {
    let mut n = Uuid::new_v4().as_u128();
    let mut id = String::with_capacity(ENTRY_ID_LEN);
    for _ in 0..ENTRY_ID_LEN {
        id.push(ALPHABET[(n % 62) as usize] as char);
        n /= 62;
    }
    id
}

/// Current time at the millisecond precision entries are stored with.
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Opaque identifier for blobs and in-flight uploads.
pub fn new_object_id() -> String {
    Uuid::new_v4().simple().to_string()
}
