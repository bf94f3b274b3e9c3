use chrono::{DateTime, Utc};

/// Return the current UTC timestamp in ISO 8601 format.
pub fn utc_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Snapshot file name for a backup taken at `at`: `snapshot-YYYYMMDD_HHMMSS.db.gz`.
pub fn snapshot_name(at: DateTime<Utc>) -> String {
    format!("snapshot-{}.db.gz", at.format("%Y%m%d_%H%M%S"))
}

/// True if `name` looks like a file produced by [`snapshot_name`].
pub fn is_snapshot_name(name: &str) -> bool {
    let Some(stamp) = name
        .strip_prefix("snapshot-")
        .and_then(|s| s.strip_suffix(".db.gz"))
    else {
        return false;
    };
    chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S").is_ok()
}
