//! Timestamp normalization for values crossing the storage boundary.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};

/// A timestamp as the storage engine hands it back.
///
/// Older rows and some engines drop the zone and return a naive value; those
/// are always UTC wall-clock times, never local ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredTimestamp {
    Naive(NaiveDateTime),
    Aware(DateTime<FixedOffset>),
}

impl StoredTimestamp {
    #[must_use]
    pub fn to_utc(self) -> DateTime<Utc> {
        match self {
            Self::Naive(naive) => Utc.from_utc_datetime(&naive),
            Self::Aware(aware) => aware.with_timezone(&Utc),
        }
    }
}

impl From<NaiveDateTime> for StoredTimestamp {
    fn from(value: NaiveDateTime) -> Self {
        Self::Naive(value)
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for StoredTimestamp {
    fn from(value: DateTime<Tz>) -> Self {
        Self::Aware(value.fixed_offset())
    }
}

/// Normalize a stored timestamp into a timezone-aware UTC value.
#[must_use]
pub fn process_timestamp(ts: Option<StoredTimestamp>) -> Option<DateTime<Utc>> {
    ts.map(StoredTimestamp::to_utc)
}
