//! Error types and handling for Magnon

/// Result type alias for Magnon operations
pub type Result<T> = std::result::Result<T, MagnonError>;

/// Error types for the Magnon shared memory IPC substrate
#[derive(Debug, thiserror::Error)]
pub enum MagnonError {
    /// I/O related errors (shm_open, ftruncate, mmap, etc.)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The pool has no free run of blocks large enough for a request
    #[error("Out of pool memory: requested {requested} bytes")]
    OutOfPool { requested: usize },

    /// A placement allocation found its blocks already in use
    #[error("Placement conflict at pool offset {offset}")]
    PlacementConflict { offset: i32 },

    /// Invalid parameters or configuration
    #[error("Invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// A queue's descriptor table has no free slot for another consumer
    #[error("Too many consumers: the table holds at most {max}")]
    TooManyConsumers { max: usize },

    /// Platform-specific errors
    #[error("Platform error: {message}")]
    Platform { message: String },
}

impl MagnonError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create an out-of-pool error
    pub fn out_of_pool(requested: usize) -> Self {
        Self::OutOfPool { requested }
    }

    /// Create a placement conflict error
    pub fn placement_conflict(offset: i32) -> Self {
        Self::PlacementConflict { offset }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a too-many-consumers error
    pub fn too_many_consumers(max: usize) -> Self {
        Self::TooManyConsumers { max }
    }

    /// Create a platform error
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
        }
    }
}

impl From<nix::errno::Errno> for MagnonError {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::from_io(
            std::io::Error::from_raw_os_error(errno as i32),
            "System call failed",
        )
    }
}
