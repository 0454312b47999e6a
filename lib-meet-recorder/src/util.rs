use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

pub(crate) fn generate_id() -> String {
  Uuid::new_v4().to_string()
}

/// Timestamp used for segment directory names, e.g. `20260801T093045Z`.
pub(crate) fn timestamp_str(now: DateTime<Utc>) -> String {
  now.format("%Y%m%dT%H%M%SZ").to_string()
}

/// RFC 3339 UTC timestamp with a trailing `Z`, used in manifests.
pub(crate) fn iso_utc(now: DateTime<Utc>) -> String {
  now.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  #[test]
  fn timestamp_format() {
    let now = Utc.with_ymd_and_hms(2026, 8, 1, 9, 30, 45).unwrap();
    assert_eq!(timestamp_str(now), "20260801T093045Z");
  }

  #[test]
  fn iso_format_has_trailing_z() {
    let now = Utc.with_ymd_and_hms(2026, 8, 1, 9, 30, 45).unwrap();
    let iso = iso_utc(now);
    assert!(iso.starts_with("2026-08-01T09:30:45"));
    assert!(iso.ends_with('Z'));
  }
}
