//! Frame validation failures. All of them are per-frame and non-fatal for
//! the connection that produced them.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Fewer than 14 bytes (28 hex chars).
    #[error("frame too short: {hex_len} hex chars, need at least 28")]
    ShortFrame { hex_len: usize },

    /// Collector or sensor id is not 8 uppercase hex characters.
    #[error("malformed {field}: {raw:?}")]
    MalformedId { field: &'static str, raw: String },

    /// Occupancy indicator outside `00..=03`.
    #[error("invalid occupancy code: {code}")]
    InvalidOccupancyCode { code: String },
}

impl ProtocolError {
    /// Stable short name used in audit `parsed_data`.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::ShortFrame { .. } => "short_frame",
            ProtocolError::MalformedId { .. } => "malformed_id",
            ProtocolError::InvalidOccupancyCode { .. } => "invalid_occupancy_code",
        }
    }
}
