//! Log sequence numbers
//!
//! A thin wrapper around PostgreSQL's XLogRecPtr (a 64-bit WAL position).
//! Values are totally ordered and round-trip through the server's textual
//! `XXXXXXXX/XXXXXXXX` form without loss.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::errors::CdcError;

/// A position in the source's write-ahead log.
///
/// `Lsn(0)` is PostgreSQL's InvalidXLogRecPtr and is never a valid stream
/// position; it is used as the "start from the slot's confirmed position"
/// sentinel in START_REPLICATION.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// The last position strictly before this one. Used when a final
    /// streaming batch must end just short of a reload marker.
    pub fn prev(&self) -> Lsn {
        Lsn(self.0.saturating_sub(1))
    }

    pub fn max(self, other: Lsn) -> Lsn {
        if other.0 > self.0 { other } else { self }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| CdcError::decode(format!("invalid LSN '{s}': missing '/'")))?;
        let hi = u64::from_str_radix(hi, 16)
            .map_err(|e| CdcError::decode(format!("invalid LSN '{s}': {e}")))?;
        let lo = u64::from_str_radix(lo, 16)
            .map_err(|e| CdcError::decode(format!("invalid LSN '{s}': {e}")))?;
        if hi > u32::MAX as u64 || lo > u32::MAX as u64 {
            return Err(CdcError::decode(format!("invalid LSN '{s}': part overflow")));
        }
        Ok(Lsn((hi << 32) | lo))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl From<Lsn> for u64 {
    fn from(value: Lsn) -> Self {
        value.0
    }
}

impl From<tokio_postgres::types::PgLsn> for Lsn {
    fn from(value: tokio_postgres::types::PgLsn) -> Self {
        Lsn(value.into())
    }
}

impl From<Lsn> for tokio_postgres::types::PgLsn {
    fn from(value: Lsn) -> Self {
        value.0.into()
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_display_round_trip() {
        let lsn = Lsn(0x0000_0001_6B37_1D28);
        assert_eq!(lsn.to_string(), "1/6B371D28");
        assert_eq!("1/6B371D28".parse::<Lsn>().unwrap(), lsn);
    }

    #[test]
    fn test_lsn_parse_rejects_garbage() {
        assert!("16B371D28".parse::<Lsn>().is_err());
        assert!("1/zzz".parse::<Lsn>().is_err());
        assert!("100000000/0".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_lsn_ordering() {
        let a = Lsn(100);
        let b = Lsn(200);
        assert!(a < b);
        assert_eq!(a.max(b), b);
        assert_eq!(b.max(a), b);
        assert_eq!(b.prev(), Lsn(199));
        assert_eq!(Lsn::INVALID.prev(), Lsn::INVALID);
    }

    #[test]
    fn test_lsn_serde_as_text() {
        let lsn = Lsn(0x2_0000_0010);
        let json = serde_json::to_string(&lsn).unwrap();
        assert_eq!(json, "\"2/10\"");
        let back: Lsn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lsn);
    }
}
