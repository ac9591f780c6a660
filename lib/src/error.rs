// Copyright (c) 2023 Shift Crypto AG

// Host-side error taxonomy. Framing, channel and device errors come from
// the proto crate; invariant and validation errors originate here and are
// unrecoverable within a session.

use bitcoin::OutPoint;

use crate::proto;

/// BitBox host library error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Framing, channel or device-reported error
    #[error(transparent)]
    Proto(#[from] proto::Error),

    /// Firmware or bootloader version outside the supported range
    #[error("the {kind} version '{version}' is not supported")]
    UnsupportedVersion {
        kind: &'static str,
        version: semver::Version,
    },

    /// Operation requires a prior successful login
    #[error("not logged in")]
    NotLoggedIn,

    /// Name rejected locally before reaching the device
    #[error("invalid device or wallet name '{0}'")]
    InvalidName(String),

    /// Random type must be "true" or "pseudo"
    #[error("invalid random type '{0}'")]
    InvalidRandomType(String),

    /// The device returned two different xpubs for the same path.
    /// Indicates a flaky or compromised device; neither value is usable.
    #[error("critical: the device returned inconsistent xpubs for path '{path}'")]
    InconsistentXpub { path: String },

    /// BIP32 parsing or derivation failure
    #[error("bip32: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),

    /// The extended key does not belong to the configured network
    #[error("xpub does not match the configured network")]
    XpubNetworkMismatch,

    /// Hash and key path lists passed to sign differ in length
    #[error("got {hashes} signature hashes but {keypaths} key paths")]
    SignRequestMismatch { hashes: usize, keypaths: usize },

    /// Signing requires at least one hash
    #[error("empty signature request")]
    EmptySignRequest,

    /// The device returned the wrong number of signatures
    #[error("got {actual} signatures, expected {expected}")]
    SignatureCount { expected: usize, actual: usize },

    /// No previous output entry exists for a transaction input
    #[error("no previous output for input spending {0}")]
    MissingPreviousOutput(OutPoint),

    /// Signature hash computation failed (bad input index or script form)
    #[error("sighash computation failed for input {input}: {reason}")]
    Sighash { input: usize, reason: String },

    /// Gap-limit tail invariant does not hold; the caller failed to sync
    /// the chain before use
    #[error("address chain out of sync: {actual} unused tail addresses, expected {expected}")]
    GapLimitViolation { expected: usize, actual: usize },

    /// Inputs/outputs are not in canonical (BIP69) order
    #[error("transaction is not canonically ordered")]
    NotCanonicallyOrdered,

    /// Post-assembly verification of an input spend failed. Indicates a
    /// signing or assembly bug, not bad user input.
    #[error("script verification failed for input {input}: {reason}")]
    ScriptVerification { input: usize, reason: String },
}

impl Error {
    /// Whether the user aborted or timed out a touch confirmation.
    pub fn is_user_abort(&self) -> bool {
        matches!(self.proto_device_error(), Some(e) if e.is_abort())
    }

    /// Whether the micro SD card was missing.
    pub fn is_sd_card_missing(&self) -> bool {
        matches!(self.proto_device_error(), Some(e) if e.is_sd_card_missing())
    }

    fn proto_device_error(&self) -> Option<&proto::DeviceError> {
        match self {
            Error::Proto(e) => e.device_error(),
            _ => None,
        }
    }
}

/// Login failure with the advisory signals parsed from the device error.
///
/// `remaining_attempts` and `needs_long_touch` are best-effort parses of the
/// device's error text and must not drive safety decisions.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct LoginError {
    /// Attempts left before the device factory-resets, if reported.
    pub remaining_attempts: Option<u32>,
    /// Whether the next attempt requires a long-touch confirmation.
    pub needs_long_touch: bool,
    #[source]
    pub source: Error,
}
