use thiserror::Error;

/// Cause attached to a write-once violation, resolved by reading back the
/// stored record and comparing it against the incoming one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteCause {
    /// Incoming bytes are identical to the stored record.
    SameData,
    /// Incoming bytes differ from the stored record.
    DifferentData,
    /// The address is below the trim mark.
    Trimmed,
    /// The stored record is a hole; the layer above decides whether data
    /// may supersede it.
    Hole,
    /// Incoming rank does not exceed the stored rank.
    Rank,
}

impl std::fmt::Display for OverwriteCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverwriteCause::SameData => write!(f, "same-data"),
            OverwriteCause::DifferentData => write!(f, "different-data"),
            OverwriteCause::Trimmed => write!(f, "trimmed"),
            OverwriteCause::Hole => write!(f, "hole"),
            OverwriteCause::Rank => write!(f, "rank"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Address below trim mark")]
    Trimmed,

    #[error("Write-once violation: {0}")]
    Overwrite(OverwriteCause),

    #[error("Data corruption at address {address}")]
    DataCorruption { address: u64 },

    #[error("Rank-guarded write lost to a higher rank")]
    DataOutranked,

    #[error("Log size quota exceeded")]
    QuotaExceeded,

    #[error("Filesystem out of space: {0}")]
    OutOfSpace(std::io::Error),

    #[error("I/O error: {0}")]
    Io(std::io::Error),

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Log unit failure: {0}")]
    LogUnit(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::StorageFull {
            Error::OutOfSpace(e)
        } else {
            Error::Io(e)
        }
    }
}

impl Error {
    /// Overwrite cause, when this error is a write-once violation.
    pub fn overwrite_cause(&self) -> Option<OverwriteCause> {
        match self {
            Error::Overwrite(cause) => Some(*cause),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_conversion_preserves_kind() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_storage_full_maps_to_out_of_space() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::StorageFull, "full").into();
        assert!(matches!(err, Error::OutOfSpace(_)));
    }

    #[test]
    fn test_overwrite_cause_accessor() {
        let err = Error::Overwrite(OverwriteCause::DifferentData);
        assert_eq!(err.overwrite_cause(), Some(OverwriteCause::DifferentData));
        assert_eq!(Error::Trimmed.overwrite_cause(), None);
    }
}
