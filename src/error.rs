use thiserror::Error;

/// Crate-wide error type.
///
/// Variants follow the error taxonomy of the scrub engine: transient I/O,
/// checksum/header/generation mismatches, uncorrectable blocks, super-block
/// reports, resource exhaustion, structural layout violations, and the
/// cooperative control-flow signals (pause/cancel) that are not data faults.
#[derive(Error, Debug, Clone)]
pub enum ScrubError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("checksum mismatch at logical {logical} mirror {mirror}")]
    Checksum { logical: u64, mirror: u8 },

    #[error("header mismatch at logical {logical} mirror {mirror}: {reason}")]
    Header {
        logical: u64,
        mirror: u8,
        reason: String,
    },

    #[error("generation mismatch at logical {logical}: expected {expected}, found {found}")]
    Generation {
        logical: u64,
        expected: u64,
        found: u64,
    },

    #[error("block at logical {logical} is uncorrectable")]
    Uncorrectable { logical: u64 },

    #[error("super-block error on device {device}: {reason}")]
    SuperBlock { device: u64, reason: String },

    #[error("resource exhausted: {0}")]
    OutOfMemory(String),

    #[error("structural layout violation: {0}")]
    Structural(String),

    #[error("scrub cancelled")]
    Cancelled,

    #[error("scrub paused")]
    Paused,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("device not found: {0}")]
    DeviceNotFound(u64),

    #[error("replace already in progress on device {0}")]
    ReplaceInProgress(u64),

    #[error("raid mapping failed for logical {logical} length {length}: {reason}")]
    RaidMap {
        logical: u64,
        length: u64,
        reason: String,
    },

    #[error("metadata search failed: {0}")]
    MetadataSearch(String),
}

impl From<std::io::Error> for ScrubError {
    fn from(e: std::io::Error) -> Self {
        ScrubError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ScrubError>;

/// Maps an error to the exit-code / status taxonomy from the external
/// interface contract (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubOutcome {
    Cancelled,
    Uncorrectable,
    OutOfMemory,
    InvalidArgument,
    Ok,
}

impl From<&ScrubError> for ScrubOutcome {
    fn from(e: &ScrubError) -> Self {
        match e {
            ScrubError::Cancelled | ScrubError::Paused => ScrubOutcome::Cancelled,
            ScrubError::Uncorrectable { .. } => ScrubOutcome::Uncorrectable,
            ScrubError::OutOfMemory(_) => ScrubOutcome::OutOfMemory,
            ScrubError::InvalidArgument(_)
            | ScrubError::DeviceNotFound(_)
            | ScrubError::ReplaceInProgress(_) => ScrubOutcome::InvalidArgument,
            _ => ScrubOutcome::Ok,
        }
    }
}
