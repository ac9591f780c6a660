// Copyright (c) 2023 Shift Crypto AG

//! Typed command/response schema
//!
//! Commands are JSON objects with exactly one top-level key per logical
//! command (`{"xpub": "<path>"}`, `{"sign": {"data": [...]}}`); replies
//! mirror the same shape. An `error` key with `{code, message}` signals
//! failure. Replies decode in a single step; a missing required field is
//! reported by name instead of probed ad hoc.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{DeviceError, Error};

/// Value accepted by the device to confirm a factory reset.
pub const RESET_TOKEN: &str = "__ERASE__";

/// Seed sources accepted by the `seed` command.
pub const SEED_SOURCE_CREATE: &str = "create";
pub const SEED_SOURCE_BACKUP: &str = "backup";

/// A command sent to the device. Serializes to one top-level key.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    /// Probe device readiness and whether a password was ever set.
    Ping(String),
    /// Set the device password (fresh device only).
    Password(String),
    /// Query device information (`{"device": "info"}`).
    Device(String),
    /// Set the device name.
    Name(String),
    /// Create or restore a wallet seed.
    Seed {
        source: String,
        key: String,
        filename: String,
    },
    /// Backup management: list, create or erase.
    Backup(BackupCommand),
    /// Factory reset (`{"reset": "__ERASE__"}`).
    Reset(String),
    /// Export the extended public key at a path.
    Xpub(String),
    /// Fetch random bytes (`"true"` or `"pseudo"`).
    Random(String),
    /// Sign a batch of hashes.
    Sign { data: Vec<SignRequestEntry> },
    /// Lock or unlock the bootloader.
    Bootloader(String),
    /// Flash the LED.
    Led(String),
}

impl Command {
    /// Serialize to the wire representation.
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn ping() -> Self {
        Command::Ping(String::new())
    }

    pub fn device_info() -> Self {
        Command::Device("info".into())
    }
}

/// Shapes carried under the `backup` key.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BackupCommand {
    /// `{"backup": "list"}`
    Action(String),
    /// `{"backup": {"key": ..., "filename": ...}}`
    Create { key: String, filename: String },
    /// `{"backup": {"erase": ...}}`
    Erase { erase: String },
}

/// One (hash, keypath) pair of a signing batch.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SignRequestEntry {
    /// Hex-encoded 32-byte signature hash.
    pub hash: String,
    /// Derivation path of the signing key.
    pub keypath: String,
}

/// A decoded device reply.
///
/// Every reply key the host understands appears as an optional field;
/// [`require`] converts absence into a typed error naming the field.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Response {
    pub error: Option<DeviceError>,
    /// Encrypted reply body, replacing all other fields once decrypted.
    pub ciphertext: Option<String>,
    pub ping: Option<String>,
    pub password: Option<String>,
    pub device: Option<DeviceInfo>,
    pub name: Option<String>,
    pub seed: Option<String>,
    pub backup: Option<BackupResponse>,
    pub reset: Option<String>,
    pub xpub: Option<String>,
    /// 2FA verification echo accompanying xpub replies.
    pub echo: Option<String>,
    pub random: Option<String>,
    pub sign: Option<Vec<SignResponseEntry>>,
    pub bootloader: Option<String>,
}

/// Shapes carried under the `backup` reply key.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum BackupResponse {
    Status(String),
    List(Vec<String>),
}

/// One signature of a signing batch reply.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct SignResponseEntry {
    /// 128 hex characters: 64-byte big-endian R || S.
    pub sig: String,
    /// Recovery id, present on newer firmware.
    pub recid: Option<String>,
}

/// Extract a required reply field, naming it on absence.
pub fn require<T>(field: Option<T>, name: &'static str) -> Result<T, Error> {
    field.ok_or(Error::MissingField(name))
}

/// Device information returned by `{"device": "info"}`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct DeviceInfo {
    pub version: String,
    pub serial: String,
    pub id: String,
    #[serde(rename = "TFA")]
    pub tfa: String,
    pub bootlock: bool,
    pub name: String,
    #[serde(rename = "sdcard")]
    pub sd_card: bool,
    pub lock: bool,
    #[serde(rename = "U2F")]
    pub u2f: bool,
    #[serde(rename = "U2F_hijack")]
    pub u2f_hijack: bool,
    pub seeded: bool,
}

/// Parse a reply, mapping a device-reported `error` payload to [`Error::Device`].
pub fn parse_reply(raw: &[u8]) -> Result<Response, Error> {
    let mut response: Response = serde_json::from_slice(raw)?;
    if let Some(err) = response.error.take() {
        return Err(Error::Device(err));
    }
    Ok(response)
}

/// Replace every leaf value with a fixed mask, preserving structure.
/// Debug logging of command payloads must pass through this.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        _ => Value::String("****".into()),
    }
}
