// Copyright (c) 2023 Shift Crypto AG

use serde::Deserialize;

/// Error code reported when the user aborted a touch confirmation.
pub const ERR_TOUCH_ABORT: i64 = 600;
/// Error code reported when a touch confirmation timed out.
pub const ERR_TOUCH_TIMEOUT: i64 = 601;
/// Error code reported when the micro SD card is required but missing.
pub const ERR_SD_CARD: i64 = 400;
/// Error code reported while the device is still booting.
pub const ERR_INITIALIZING: i64 = 503;

/// Structured error payload reported by the device.
///
/// Replies carry this under the `error` key as `{code: int, message: string}`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, thiserror::Error)]
#[error("device error {code}: {message}")]
pub struct DeviceError {
    pub code: i64,
    pub message: String,
}

impl DeviceError {
    /// Whether the user aborted or let a touch confirmation time out.
    /// Callers treat this as an expected outcome, not a failure.
    pub fn is_abort(&self) -> bool {
        self.code == ERR_TOUCH_ABORT || self.code == ERR_TOUCH_TIMEOUT
    }

    /// Whether the micro SD card was missing during an operation requiring it.
    pub fn is_sd_card_missing(&self) -> bool {
        self.code == ERR_SD_CARD
    }

    /// Whether the device is still initializing after boot. Retried a bounded
    /// number of times during session construction only.
    pub fn is_initializing(&self) -> bool {
        self.code == ERR_INITIALIZING
    }
}

/// Wire protocol error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport I/O failure
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Report shorter than the minimum frame overhead
    #[error("short frame: got {actual} bytes, expected at least {expected}")]
    ShortFrame { expected: usize, actual: usize },

    /// Truncated report write
    #[error("short write: wrote {0} of {1} report bytes")]
    ShortWrite(usize, usize),

    /// First frame did not carry the wallet channel identifier
    #[error("channel identifier mismatch")]
    ChannelIdMismatch,

    /// First frame carried an unexpected command byte
    #[error("command byte mismatch (got {actual:#04x}, expected {expected:#04x})")]
    CommandMismatch { actual: u8, expected: u8 },

    /// Message exceeds what the framing can carry
    #[error("message of {len} bytes exceeds maximum of {max}")]
    MessageTooLong { len: usize, max: usize },

    /// Channel decryption failed. Never retried.
    #[error("failed to decrypt reply")]
    Decrypt,

    /// Key stretching produced inconsistent results (memory fault)
    #[error("key stretching is not reproducible")]
    KeyStretch,

    /// Reply was not valid JSON
    #[error("malformed reply: {0}")]
    Json(#[from] serde_json::Error),

    /// A required reply field was absent
    #[error("unexpected reply: field '{0}' is missing")]
    MissingField(&'static str),

    /// A reply field was present but malformed
    #[error("unexpected reply: field '{field}' is invalid: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    /// Structured error reported by the device
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl Error {
    /// The device error payload, if this is a device-reported failure.
    pub fn device_error(&self) -> Option<&DeviceError> {
        match self {
            Error::Device(e) => Some(e),
            _ => None,
        }
    }
}
