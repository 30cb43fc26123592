//! Error types for the library.

use thiserror::Error;

use crate::types::{Lsn, TrackNum};

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during CD audio extraction
#[derive(Error, Debug)]
pub enum Error {
    /// Unable to read table of contents
    #[error("Unable to read table of contents: {0}")]
    TocReadError(String),

    /// Could not read any data from drive
    #[error("Could not read any data from drive")]
    NoDataRead,

    /// Retry cap exceeded on a multi-sector read
    #[error("Unknown, unrecoverable error reading data at LSN {0}")]
    UnknownReadError(Lsn),

    /// The source failed and does not support retrying
    #[error("Read failed at LSN {0} and the drive does not support retries")]
    ReadNoRetry(Lsn),

    /// Unaddressable sector
    #[error("Unaddressable sector: {0}")]
    UnaddressableSector(Lsn),

    /// Device not open
    #[error("Device not open")]
    DeviceNotOpen,

    /// Invalid track number
    #[error("Invalid track number: {0}")]
    InvalidTrack(TrackNum),

    /// No audio tracks on disc
    #[error("No audio tracks on disc")]
    NoAudioTracks,

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(TransportError),

    /// Sector skip (after max retries exhausted)
    #[error("Sector skip at LSN {0} after {1} retries")]
    SectorSkip(Lsn, i32),
}

impl Error {
    /// Negative status code of the classic C interface.
    ///
    /// Each failure kind keeps its historical number so callers that log or
    /// compare codes see the values they expect.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Error::TocReadError(_) => -2,
            Error::NoDataRead => -6,
            Error::UnknownReadError(_) => -7,
            Error::ReadNoRetry(_) => -8,
            Error::SectorSkip(..) => -10,
            Error::UnaddressableSector(_) => -11,
            Error::DeviceNotOpen => -15,
            Error::InvalidTrack(_) => -401,
            Error::NoAudioTracks => -403,
            Error::TransportError(_) => -500,
        }
    }

    /// Whether this is the non-fatal "treat the sector as lost" sentinel.
    #[must_use]
    pub fn is_skip(&self) -> bool {
        matches!(self, Error::SectorSkip(..))
    }
}

/// Transport-level errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("Error writing packet command to device")]
    WriteError,
    #[error("Error reading command from device")]
    ReadError,
    #[error("SCSI packet data underrun (too little data)")]
    Underrun,
    #[error("Illegal SCSI request (rejected by target)")]
    Illegal,
    #[error("Medium error reading data")]
    Medium,
    #[error("Device busy")]
    Busy,
    #[error("Device not ready")]
    NotReady,
    #[error("Unspecified error")]
    Unknown,
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::TransportError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            Error::TocReadError(String::new()),
            Error::NoDataRead,
            Error::UnknownReadError(0),
            Error::ReadNoRetry(0),
            Error::UnaddressableSector(0),
            Error::DeviceNotOpen,
            Error::InvalidTrack(0),
            Error::NoAudioTracks,
            Error::TransportError(TransportError::Medium),
            Error::SectorSkip(0, 0),
        ];
        let mut codes: Vec<i32> = errors.iter().map(Error::code).collect();
        assert!(codes.iter().all(|&c| c < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_skip_is_not_fatal_kind() {
        assert!(Error::SectorSkip(12, 8).is_skip());
        assert!(!Error::UnknownReadError(12).is_skip());
        assert_eq!(Error::SectorSkip(12, 8).code(), -10);
        assert_eq!(Error::UnknownReadError(12).code(), -7);
    }
}
