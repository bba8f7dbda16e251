//! Error types for the journal.

use seglog_device::DeviceError;
use thiserror::Error;

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur in journal operations.
///
/// Corruption found while scanning is not an error: a scan simply ends at
/// the first record group that fails validation.
#[derive(Debug, Error)]
pub enum JournalError {
    /// The underlying device failed.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// An input/output failure reported by the journal itself.
    #[error("I/O error: {message}")]
    Io {
        /// Description of the failure.
        message: String,
    },

    /// Bad configuration or a request the journal cannot accept.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// Nothing valid was found where data was expected.
    #[error("no data: {message}")]
    NoData {
        /// What was looked for.
        message: String,
    },

    /// The addressed entity does not exist.
    #[error("no entity: {message}")]
    NoEntity {
        /// What was looked for.
        message: String,
    },

    /// An address or size fell outside the permitted range.
    #[error("out of range: {message}")]
    OutOfRange {
        /// Description of the violation.
        message: String,
    },
}

impl JournalError {
    /// Creates an I/O error.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a no-data error.
    pub fn no_data(message: impl Into<String>) -> Self {
        Self::NoData {
            message: message.into(),
        }
    }

    /// Creates a no-entity error.
    pub fn no_entity(message: impl Into<String>) -> Self {
        Self::NoEntity {
            message: message.into(),
        }
    }

    /// Creates an out-of-range error.
    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::OutOfRange {
            message: message.into(),
        }
    }

    /// Returns true for the input/output error class.
    ///
    /// Device failures and journal-level I/O failures both belong here.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Device(_) | Self::Io { .. })
    }
}
