//! UTC ISO-8601 millisecond timestamps and session/client identifiers.

use chrono::Utc;
use uuid::Uuid;

/// Current UTC time formatted as `YYYY-MM-DDTHH:MM:SS.sssZ`.
pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// A fresh v4 UUID, rendered as its canonical 36-character string form.
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}
