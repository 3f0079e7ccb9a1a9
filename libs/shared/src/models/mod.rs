pub mod environment;
pub mod sandbox;
pub mod secret;
pub mod session;
pub mod wire;

use chrono::{SecondsFormat, Utc};

/// Current time as an ISO-8601 UTC string. String-sortable, so timestamp
/// columns can be compared lexically in SQL.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
