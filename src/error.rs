//! Error handling for the device and pairing core
//!
//! One error type covers the whole crate. Envelope and crypto errors are
//! recovered close to where they happen (the packet is dropped and logged);
//! pairing failures travel as [`DeviceSignal`](crate::device::DeviceSignal)
//! values instead of errors; transport failures are absorbed into the `bool`
//! result of a send. Nothing in the crate unwinds.

use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the device and pairing core
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error (configuration files, key material)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// RSA key or encryption error
    #[error("crypto failure: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    /// A packet failed to parse or is missing required fields
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// No persisted record exists for the device
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Configuration is missing or invalid
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Plugin registration or instantiation error
    #[error("plugin error: {0}")]
    Plugin(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = Error::DeviceNotFound("test-device".to_string());
        assert_eq!(error.to_string(), "device not found: test-device");

        let error = Error::MalformedPacket("missing type field".to_string());
        assert_eq!(error.to_string(), "malformed packet: missing type field");
    }

    #[test]
    fn test_io_error_conversion() {
        use std::io::{Error as IoError, ErrorKind};

        let io_error = IoError::new(ErrorKind::NotFound, "file not found");
        let error: Error = io_error.into();

        assert!(matches!(error, Error::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let error: Error = json_error.into();

        assert!(matches!(error, Error::Json(_)));
    }
}
