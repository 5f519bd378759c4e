//! Error types and result definitions for the tuya-local crate.
//! Includes Tuya-specific error codes and conversion from standard IO/JSON errors.

use thiserror::Error;

/// Represents all possible errors that can occur when communicating with a Tuya device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TuyaError {
    /// Standard IO error (network, reset, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// TCP connection could not be established
    #[error("Socket connection failed")]
    ConnectionFailed,

    /// Connect, handshake, request or liveness deadline expired
    #[error("Timeout waiting for device")]
    Timeout,

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Magic prefix/suffix or length field does not describe a valid frame
    #[error("Framing error: {0}")]
    Framing(String),

    /// The message header was invalid
    #[error("Invalid header")]
    InvalidHeader,

    /// CRC check failed for the received message
    #[error("CRC mismatch")]
    CrcMismatch,

    /// HMAC signature verification failed (v3.4)
    #[error("HMAC mismatch")]
    HmacMismatch,

    /// GCM tag or handshake proof did not verify
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Ciphertext length or padding is invalid, or hex/base64 could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// The payload received from the device was malformed or unexpected
    #[error("Invalid payload")]
    InvalidPayload,

    /// Failed to encrypt a message for the device
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Local or session key does not have the cipher's key length
    #[error("Invalid key length: expected 16 bytes, got {0}")]
    InvalidKey(usize),

    /// Unsupported protocol version string
    #[error("Unsupported protocol version '{0}'")]
    InvalidVersion(String),

    /// Symbolic code is not part of the device schema
    #[error("Unknown datapoint '{0}'")]
    UnknownDatapoint(String),

    /// Value cannot be coerced into the datapoint's type
    #[error("Invalid value for '{code}': {reason}")]
    InvalidValue { code: String, reason: String },

    /// Session is not in the active phase
    #[error("Device not connected")]
    NotConnected,

    /// Request was abandoned because the connection was dropped or stopped
    #[error("Request cancelled")]
    Cancelled,

    /// Device ID not found in schema store
    #[error("Device ID '{0}' not found")]
    DeviceNotFound(String),

    /// Schema store failure
    #[error("Schema store error: {0}")]
    Schema(String),

    /// Device description is incomplete or inconsistent
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// A specialized Result type for Tuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

/// Broad failure classes used for reconnect decisions and operator logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Framing,
    Integrity,
    Authentication,
    Caller,
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Framing => "framing",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Caller => "caller",
            ErrorKind::Config => "config",
        };
        f.write_str(s)
    }
}

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => TuyaError::ConnectionFailed,
            std::io::ErrorKind::TimedOut => TuyaError::Timeout,
            _ => TuyaError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}

impl TuyaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TuyaError::Io(_) | TuyaError::ConnectionFailed | TuyaError::Timeout => {
                ErrorKind::Transport
            }
            TuyaError::Framing(_)
            | TuyaError::InvalidHeader
            | TuyaError::Decode(_)
            | TuyaError::InvalidPayload
            | TuyaError::Json(_) => ErrorKind::Framing,
            TuyaError::CrcMismatch | TuyaError::HmacMismatch => ErrorKind::Integrity,
            TuyaError::Authentication(_) => ErrorKind::Authentication,
            TuyaError::UnknownDatapoint(_)
            | TuyaError::InvalidValue { .. }
            | TuyaError::NotConnected
            | TuyaError::Cancelled => ErrorKind::Caller,
            TuyaError::EncryptionFailed
            | TuyaError::InvalidKey(_)
            | TuyaError::InvalidVersion(_)
            | TuyaError::DeviceNotFound(_)
            | TuyaError::Schema(_)
            | TuyaError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            TuyaError::Io(_) | TuyaError::ConnectionFailed => ERR_CONNECT,
            TuyaError::Timeout => ERR_TIMEOUT,
            TuyaError::Json(_) => ERR_JSON,
            TuyaError::Framing(_) | TuyaError::InvalidHeader => ERR_PAYLOAD,
            TuyaError::Decode(_) | TuyaError::InvalidPayload => ERR_PAYLOAD,
            TuyaError::CrcMismatch | TuyaError::HmacMismatch => ERR_KEY_OR_VER,
            TuyaError::Authentication(_) => ERR_KEY_OR_VER,
            TuyaError::EncryptionFailed | TuyaError::InvalidKey(_) => ERR_KEY_OR_VER,
            TuyaError::InvalidVersion(_) | TuyaError::Config(_) => ERR_PARAMS,
            TuyaError::UnknownDatapoint(_) => ERR_FUNCTION,
            TuyaError::InvalidValue { .. } => ERR_RANGE,
            TuyaError::NotConnected => ERR_OFFLINE,
            TuyaError::Cancelled => ERR_CANCELLED,
            TuyaError::DeviceNotFound(_) | TuyaError::Schema(_) => ERR_SCHEMA,
        }
    }
}

// Response codes reported with connection events
define_error_codes! {
    ERR_SUCCESS = 0 => "Connection Successful",
    ERR_JSON = 900 => "Invalid JSON Response from Device",
    ERR_CONNECT = 901 => "Network Error: Unable to Connect",
    ERR_TIMEOUT = 902 => "Timeout Waiting for Device",
    ERR_RANGE = 903 => "Specified Value Out of Range",
    ERR_PAYLOAD = 904 => "Unexpected Payload from Device",
    ERR_OFFLINE = 905 => "Network Error: Device Unreachable",
    ERR_FUNCTION = 907 => "Function Not Supported by Device",
    ERR_PARAMS = 912 => "Missing Function Parameters",
    ERR_KEY_OR_VER = 914 => "Check device key or version",
    ERR_SCHEMA = 916 => "Device schema unavailable",
    ERR_CANCELLED = 917 => "Request cancelled",
}
