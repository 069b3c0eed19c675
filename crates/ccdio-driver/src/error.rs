//! Error types for DIO calibration and feedback operations

use std::time::Duration;
use thiserror::Error;

/// Result type alias for driver operations
pub type Result<T> = std::result::Result<T, DioError>;

/// Errors that can occur while talking to the CC and its instruments
#[derive(Debug, Error)]
pub enum DioError {
    /// Invalid link, program or calibration plan, detected before any I/O
    #[error("Configuration error: {reason}")]
    Configuration {
        /// What was wrong
        reason: String,
    },

    /// Connection lost or refused
    #[error("Communication with {endpoint} failed: {reason}")]
    Communication {
        /// Instrument endpoint
        endpoint: String,
        /// Reason for failure
        reason: String,
    },

    /// Transport or completion deadline exceeded
    #[error("{operation} timed out after {duration_ms}ms")]
    Timeout {
        /// Operation that was waiting
        operation: String,
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// A consumer rejected an invalid calibration result
    #[error("DIO calibration failed on slot {slot}: condition {condition:#x}, margin {margin}")]
    CalibrationFailure {
        /// Receiving CCIO slot
        slot: u8,
        /// Condition code
        condition: u32,
        /// Margin found
        margin: u32,
    },

    /// Malformed response or device-reported fault
    #[error("Protocol violation: {reason} (raw: {raw:?})")]
    ProtocolViolation {
        /// What was expected
        reason: String,
        /// Raw response or status word
        raw: String,
    },

    /// I/O error outside an established connection (files, sockets setup)
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

/// Coarse classification used by callers deciding whether to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fix the setup; retrying will not help
    Configuration,
    /// Link to the instrument failed; a retry may succeed
    Communication,
    /// Calibration produced no usable offset
    Calibration,
    /// Instrument answered with something unexpected
    Protocol,
}

impl DioError {
    /// Create a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a communication error
    pub fn communication(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Communication {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a protocol violation
    pub fn protocol(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
            raw: raw.into(),
        }
    }

    /// Classify the error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Communication { .. } | Self::Timeout { .. } | Self::Io { .. } => {
                ErrorKind::Communication
            }
            Self::CalibrationFailure { .. } => ErrorKind::Calibration,
            Self::ProtocolViolation { .. } => ErrorKind::Protocol,
        }
    }
}

impl From<ccdio_chip::program::ProgramError> for DioError {
    fn from(err: ccdio_chip::program::ProgramError) -> Self {
        Self::configuration(format!("program: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_count_as_communication() {
        let err = DioError::timeout("*OPC?", Duration::from_millis(1500));
        assert_eq!(err.kind(), ErrorKind::Communication);
        assert_eq!(err.to_string(), "*OPC? timed out after 1500ms");
    }

    #[test]
    fn program_errors_are_configuration() {
        let err: DioError = ccdio_chip::program::ProgramError::UndefinedLabel("loop".into()).into();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("@loop"));
    }

    #[test]
    fn protocol_keeps_raw_response() {
        let err = DioError::protocol("expected integer", "garbage");
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("\"garbage\""));
    }
}
