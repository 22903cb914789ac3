//! ClickHouse Native Protocol (Layer 2)
//!
//! Packet encoding, frame codec and compression framing. The writer is pure
//! (encodes into memory); the reader pulls from any `AsyncRead`.

pub mod compress;
pub mod packet;
#[cfg(any(test, feature = "test-util"))]
pub mod peer;
pub mod reader;
pub mod wire;
pub mod writer;

pub use compress::Method;
pub use packet::{ClientInfo, QueryPacket, ServerPacket};
pub use reader::ChReader;
pub use wire::*;
pub use writer::ChWriter;

use chrono::{DateTime, Days, NaiveDate, Utc};

/// Byte order used for UUIDs on the wire: each 8-byte half is reversed.
/// Applying it twice restores the input.
pub fn swap_uuid(bytes: &mut [u8; 16]) {
    bytes[..8].reverse();
    bytes[8..].reverse();
}

fn epoch_date() -> NaiveDate {
    DateTime::<Utc>::UNIX_EPOCH.date_naive()
}

/// `Date` is days since 1970-01-01.
pub fn date_from_days(days: u16) -> NaiveDate {
    epoch_date() + Days::new(days as u64)
}

/// Dates before the epoch encode as 0.
pub fn days_from_date(date: NaiveDate) -> u16 {
    (date - epoch_date()).num_days().clamp(0, u16::MAX as i64) as u16
}

/// `DateTime` is seconds since the epoch; 0 decodes to the epoch itself.
pub fn datetime_from_secs(secs: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(secs as i64, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Times before the epoch encode as 0, times past 2106 saturate.
pub fn secs_from_datetime(time: &DateTime<Utc>) -> u32 {
    time.timestamp().clamp(0, u32::MAX as i64) as u32
}
