//! Wire format for parking-sensor telemetry frames.
//!
//! A frame is at least 14 bytes. Parsing works on the uppercase hex rendering
//! of the buffer, which is also what gets written to the audit log:
//!
//! ```text
//! hex chars   bytes   field
//! [10..12)    5       occupancy indicator: 00 vacant, 01/02/03 occupied
//! [12..20)    6..=9   collector id (wdc_id), little-endian on the wire
//! [20..28)    10..=13 sensor id (wpsd_id), little-endian on the wire
//! ```
//!
//! Anything past byte 13 is ignored. Parsing is pure; callers decide how to
//! record failures.

use chrono::{DateTime, Utc};
use psr_schemas::OccupancyEvent;

pub mod errors;

pub use errors::{ProtocolError, Result};

/// Minimum frame length in bytes.
pub const MIN_FRAME_BYTES: usize = 14;

/// Minimum frame length in hex characters.
pub const MIN_FRAME_HEX: usize = MIN_FRAME_BYTES * 2;

const OCCUPANCY_RANGE: std::ops::Range<usize> = 10..12;
const COLLECTOR_RANGE: std::ops::Range<usize> = 12..20;
const SENSOR_RANGE: std::ops::Range<usize> = 20..28;

/// Decoded occupancy indicator byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Vacant,
    Occupied,
}

impl Occupancy {
    /// Map the two-character indicator. `00` is vacant, `01`..=`03` occupied.
    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "00" => Ok(Occupancy::Vacant),
            "01" | "02" | "03" => Ok(Occupancy::Occupied),
            other => Err(ProtocolError::InvalidOccupancyCode {
                code: other.to_string(),
            }),
        }
    }

    pub fn is_occupied(self) -> bool {
        self == Occupancy::Occupied
    }
}

/// Decode a raw socket buffer into an [`OccupancyEvent`].
pub fn parse_frame(buf: &[u8], received_at: DateTime<Utc>) -> Result<OccupancyEvent> {
    parse_hex_frame(&hex::encode_upper(buf), received_at)
}

/// Decode a frame already rendered as hex (case-insensitive).
pub fn parse_hex_frame(hex: &str, received_at: DateTime<Utc>) -> Result<OccupancyEvent> {
    let hex = hex.trim().to_ascii_uppercase();
    if hex.len() < MIN_FRAME_HEX {
        return Err(ProtocolError::ShortFrame { hex_len: hex.len() });
    }

    let collector_raw = id_field(&hex, COLLECTOR_RANGE, "wdc_id")?;
    let sensor_raw = id_field(&hex, SENSOR_RANGE, "wpsd_id")?;

    let code = hex
        .get(OCCUPANCY_RANGE)
        .ok_or_else(|| ProtocolError::InvalidOccupancyCode {
            code: "<non-ascii>".to_string(),
        })?;
    let occupancy = Occupancy::from_code(code)?;

    Ok(OccupancyEvent {
        sensor_external_id: rearrange(sensor_raw),
        collector_id: rearrange(collector_raw),
        occupied: occupancy.is_occupied(),
        raw_frame_hex: hex.clone(),
        received_at,
    })
}

/// Reverse the byte order of a hex id: `AABBCCDD` becomes `DDCCBBAA`.
///
/// Applying it twice yields the input.
pub fn rearrange(id: &str) -> String {
    let pairs: Vec<&[u8]> = id.as_bytes().chunks(2).collect();
    pairs
        .into_iter()
        .rev()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect()
}

fn id_field<'a>(
    hex: &'a str,
    range: std::ops::Range<usize>,
    field: &'static str,
) -> Result<&'a str> {
    let raw = hex.get(range).ok_or_else(|| ProtocolError::MalformedId {
        field,
        raw: String::new(),
    })?;
    if is_hex_id(raw) {
        Ok(raw)
    } else {
        Err(ProtocolError::MalformedId {
            field,
            raw: raw.to_string(),
        })
    }
}

/// `^[0-9A-F]{8}$`
fn is_hex_id(s: &str) -> bool {
    s.len() == 8 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'A'..=b'F'))
}
