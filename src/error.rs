//! Error types for sdlock.
//!
//! Uses thiserror for derive macros. Lock protocol violations are reported as
//! `Fatal` once and as `Poisoned` for every later operation on the same device.

use crate::exit_codes;
use thiserror::Error;

/// Main error type for sdlock operations.
#[derive(Error, Debug)]
pub enum SdError {
    /// User provided invalid arguments or referenced an unknown device.
    #[error("{0}")]
    UserError(String),

    /// Configuration could not be read, parsed, or validated.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The locking protocol was violated or a synchronization primitive failed.
    ///
    /// The device involved is poisoned afterwards.
    #[error("Fatal device lock error: {0}")]
    Fatal(String),

    /// The device was poisoned by an earlier fatal error.
    #[error("device '{0}' is poisoned by an earlier fatal lock error")]
    Poisoned(String),
}

impl SdError {
    /// Returns the appropriate exit code for this error type.
    pub fn exit_code(&self) -> i32 {
        match self {
            SdError::UserError(_) => exit_codes::USER_ERROR,
            SdError::ConfigError(_) => exit_codes::CONFIG_ERROR,
            SdError::Fatal(_) | SdError::Poisoned(_) => exit_codes::FATAL_LOCK_ERROR,
        }
    }

    /// Whether this error leaves lock bookkeeping unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SdError::Fatal(_) | SdError::Poisoned(_))
    }
}

/// Result type alias for sdlock operations.
pub type Result<T> = std::result::Result<T, SdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_error_has_correct_exit_code() {
        let err = SdError::UserError("unknown device".to_string());
        assert_eq!(err.exit_code(), exit_codes::USER_ERROR);
        assert!(!err.is_fatal());
    }

    #[test]
    fn config_error_has_correct_exit_code() {
        let err = SdError::ConfigError("bad yaml".to_string());
        assert_eq!(err.exit_code(), exit_codes::CONFIG_ERROR);
    }

    #[test]
    fn fatal_and_poisoned_share_exit_code() {
        let fatal = SdError::Fatal("double block".to_string());
        let poisoned = SdError::Poisoned("Tape0".to_string());
        assert_eq!(fatal.exit_code(), exit_codes::FATAL_LOCK_ERROR);
        assert_eq!(poisoned.exit_code(), exit_codes::FATAL_LOCK_ERROR);
        assert!(fatal.is_fatal());
        assert!(poisoned.is_fatal());
    }

    #[test]
    fn error_messages_are_descriptive() {
        let err = SdError::ConfigError("devices must not be empty".to_string());
        assert_eq!(err.to_string(), "Configuration error: devices must not be empty");

        let err = SdError::Poisoned("Tape0".to_string());
        assert_eq!(
            err.to_string(),
            "device 'Tape0' is poisoned by an earlier fatal lock error"
        );
    }
}
