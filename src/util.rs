//! Shared conversion helpers
//!
//! PostgreSQL timestamps on the replication wire are microseconds since the
//! PostgreSQL epoch (2000-01-01), not the Unix epoch.

use chrono::{DateTime, TimeZone, Utc};

/// Seconds from the Unix epoch (1970) to the PostgreSQL epoch (2000)
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// Convert PostgreSQL wire-format microseconds to a UTC timestamp.
pub fn pg_micros_to_utc(micros: i64) -> DateTime<Utc> {
    let unix_micros = micros + PG_EPOCH_OFFSET_SECS * 1_000_000;
    Utc.timestamp_micros(unix_micros)
        .single()
        .unwrap_or_else(|| Utc.timestamp_micros(0).unwrap())
}

/// Convert a UTC timestamp to PostgreSQL wire-format microseconds.
pub fn utc_to_pg_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros() - PG_EPOCH_OFFSET_SECS * 1_000_000
}

/// Current wall clock in PostgreSQL wire-format microseconds, used by
/// standby status updates.
pub fn pg_now_micros() -> i64 {
    utc_to_pg_micros(Utc::now())
}

/// Parse a timestamptz in the text form pgoutput transmits
/// (`2024-05-01 12:00:00.123456+00`).
pub fn parse_pg_timestamptz(text: &str) -> Option<DateTime<Utc>> {
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(text, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    None
}

/// Hex-encode a digest for registry storage.
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pg_epoch_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 45).unwrap();
        let micros = utc_to_pg_micros(ts);
        assert_eq!(pg_micros_to_utc(micros), ts);
    }

    #[test]
    fn test_pg_epoch_zero_is_y2k() {
        let y2k = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(pg_micros_to_utc(0), y2k);
        assert_eq!(utc_to_pg_micros(y2k), 0);
    }

    #[test]
    fn test_parse_pg_timestamptz() {
        let ts = parse_pg_timestamptz("2024-05-01 12:00:00.123456+00").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
            + chrono::Duration::microseconds(123_456));
        let ts = parse_pg_timestamptz("2024-05-01 12:00:00+02").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap());
        assert!(parse_pg_timestamptz("yesterday").is_none());
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x00, 0xab, 0xff]), "00abff");
        assert_eq!(to_hex(&[]), "");
    }
}
