//! Error types for the QCCTV core
//!
//! # Error Recovery Strategies
//!
//! Different error types require different recovery approaches:
//!
//! ## Transient Errors (Never Tear Down Sessions)
//!
//! - Malformed or corrupt stream data is **not** represented by this type at
//!   all: the stream parser resynchronizes locally and exposes counters
//!   (see [`crate::wire::StreamParser`]).
//!
//! - **`Codec`**: A single frame failed to encode or decode. The frame is
//!   dropped and a counter incremented. Only a *sustained* encoder failure
//!   (more than 2 seconds without a good frame) raises the `VideoFailure`
//!   status flag.
//!
//! - **`Storage`**: A recording could not be written. Counted and logged,
//!   never surfaced to the session.
//!
//! ## Session-Fatal Errors
//!
//! - **`Io`**: Socket errors close the owning session; the peer is reported
//!   absent through the session state machine, not through this type.
//!
//! ## Startup Errors (Fix and Restart)
//!
//! - **`Config`**: Configuration file is invalid. Fix the file and restart.
//! - **`Driver`**: The camera driver rejected a request (flashlight, focus).
//!   Raises `LightFailure`/`VideoFailure` flags on the camera status.

use thiserror::Error;

/// Errors that can occur in the QCCTV core
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Image codec error: {0}")]
    Codec(String),

    #[error("Camera driver error: {0}")]
    Driver(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    Other(String),
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
