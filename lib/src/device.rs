// Copyright (c) 2023 Shift Crypto AG

//! Device session handle
//!
//! High-level operations against one connected BitBox. The physical device
//! has no status query of its own, so the session state (initialized,
//! logged in, seeded) is tracked host-side from observed replies and folded
//! into an explicit [`Status`] with fixed precedence.

use std::str::FromStr;
use std::thread;
use std::time::Duration;

use bitcoin::bip32::Xpub;
use bitcoin::secp256k1::ecdsa::Signature;
use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use zeroize::Zeroizing;

use crate::proto::message::{
    require, BackupCommand, BackupResponse, Command, DeviceInfo, Response, SignRequestEntry,
    RESET_TOKEN, SEED_SOURCE_BACKUP, SEED_SOURCE_CREATE,
};
use crate::proto::{crypto, Error as ProtoError, Transport};
use crate::{Channel, Error, LoginError};

/// Supported firmware versions, half-open range.
const FIRMWARE_MIN: semver::Version = semver::Version::new(2, 2, 2);
const FIRMWARE_MAX: semver::Version = semver::Version::new(4, 0, 0);

/// Supported bootloader versions, half-open range.
const BOOTLOADER_MIN: semver::Version = semver::Version::new(1, 0, 2);
const BOOTLOADER_MAX: semver::Version = semver::Version::new(2, 0, 0);

/// Signatures the device can handle with one long-touch confirmation.
const SIGNATURE_BATCH_SIZE: usize = 15;

/// Readiness probes during construction while the device boots.
const INIT_PING_ATTEMPTS: usize = 20;
const INIT_PING_DELAY: Duration = Duration::from_millis(500);

/// Session state, derived rather than stored. Precedence:
/// bootloader > seeded > logged in > initialized > uninitialized.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum Status {
    /// Device is in bootloader mode; only bootloader commands apply.
    Bootloader,
    /// No password was ever set.
    Uninitialized,
    /// A password is set but this session has not authenticated.
    Initialized,
    /// Authenticated, but the device holds no wallet yet.
    LoggedIn,
    /// Authenticated and a wallet seed is present.
    Seeded,
}

/// Session events delivered to the optional callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum Event {
    StatusChanged,
}

/// Handle for one connected device. Owns the encrypted channel and with it
/// the physical transport; dropping or closing the handle is terminal.
pub struct DeviceHandle<T: Transport> {
    device_id: String,
    channel: Channel<T>,
    bootloader: bool,
    initialized: bool,
    password: Option<Zeroizing<String>>,
    seeded: bool,
    closed: bool,
    on_event: Option<Box<dyn Fn(Event) + Send + Sync>>,
}

impl<T: Transport> std::fmt::Debug for DeviceHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device_id", &self.device_id)
            .field("bootloader", &self.bootloader)
            .field("initialized", &self.initialized)
            .field("seeded", &self.seeded)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> DeviceHandle<T> {
    /// Open a session over `transport`.
    ///
    /// `bootloader` must reflect the mode the device enumerated in; it is
    /// fixed for the session lifetime. The reported version must lie in the
    /// supported range. Outside bootloader mode the device is probed with
    /// `ping` until ready, a bounded number of times.
    pub fn new(
        device_id: impl Into<String>,
        bootloader: bool,
        version: &semver::Version,
        transport: T,
    ) -> Result<Self, Error> {
        let device_id = device_id.into();

        let (kind, min, max) = if bootloader {
            ("bootloader", &BOOTLOADER_MIN, &BOOTLOADER_MAX)
        } else {
            ("firmware", &FIRMWARE_MIN, &FIRMWARE_MAX)
        };
        if version < min || version >= max {
            return Err(Error::UnsupportedVersion {
                kind,
                version: version.clone(),
            });
        }

        info!("device {} plugged in, {} version {}", device_id, kind, version);

        let mut device = Self {
            device_id,
            channel: Channel::new(transport),
            bootloader,
            initialized: false,
            password: None,
            seeded: false,
            closed: false,
            on_event: None,
        };

        if !bootloader {
            // Booting can take a couple of seconds; keep pinging while the
            // device reports it is still initializing.
            for attempt in 0..INIT_PING_ATTEMPTS {
                match device.ping() {
                    Ok(initialized) => {
                        device.initialized = initialized;
                        break;
                    }
                    Err(e) if is_initializing(&e) && attempt + 1 < INIT_PING_ATTEMPTS => {
                        debug!("device still initializing (attempt {})", attempt + 1);
                        thread::sleep(INIT_PING_DELAY);
                    }
                    Err(e) if is_initializing(&e) => {}
                    Err(e) => return Err(e),
                }
            }
            debug!(
                "device {} initialized: {}",
                device.device_id, device.initialized
            );
        }

        Ok(device)
    }

    /// The identifier supplied at construction.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Install a callback invoked on session events.
    pub fn set_on_event(&mut self, on_event: impl Fn(Event) + Send + Sync + 'static) {
        self.on_event = Some(Box::new(on_event));
    }

    fn fire_event(&self, event: Event) {
        if let Some(on_event) = &self.on_event {
            on_event(event);
        }
    }

    fn on_status_changed(&self) {
        self.fire_event(Event::StatusChanged);
    }

    /// Current session state, derived from observed replies.
    pub fn status(&self) -> Status {
        if self.bootloader {
            Status::Bootloader
        } else if self.seeded {
            Status::Seeded
        } else if self.password.is_some() {
            Status::LoggedIn
        } else if self.initialized {
            Status::Initialized
        } else {
            Status::Uninitialized
        }
    }

    /// Close the transport. Terminal, safe to call repeatedly.
    pub fn close(&mut self) {
        if !self.closed {
            debug!("closing connection to device {}", self.device_id);
            self.channel.close();
            self.closed = true;
        }
    }

    fn password(&self) -> Result<&str, Error> {
        self.password
            .as_deref()
            .map(String::as_str)
            .ok_or(Error::NotLoggedIn)
    }

    fn send_plain(&self, cmd: &Command) -> Result<Response, Error> {
        self.channel.send_plain(&cmd.to_json()?)
    }

    fn send_encrypt(&self, cmd: &Command, password: &str) -> Result<Response, Error> {
        self.channel.send_encrypt(&cmd.to_json()?, password)
    }

    fn send(&self, cmd: &Command) -> Result<Response, Error> {
        self.send_encrypt(cmd, self.password()?)
    }

    /// Probe the device. Returns whether a password was ever set.
    pub fn ping(&self) -> Result<bool, Error> {
        let reply = self.send_plain(&Command::ping())?;
        Ok(reply.ping.as_deref() == Some("password"))
    }

    fn device_info_with(&self, password: &str) -> Result<DeviceInfo, Error> {
        let reply = self.send_encrypt(&Command::device_info(), password)?;
        Ok(require(reply.device, "device")?)
    }

    /// Query device information. Requires login.
    pub fn device_info(&self) -> Result<DeviceInfo, Error> {
        self.device_info_with(self.password()?)
    }

    /// Set the password on a fresh device. Fails on a configured device
    /// until it is reset.
    pub fn set_password(&mut self, password: &str) -> Result<(), Error> {
        let reply = self.send_plain(&Command::Password(password.into()))?;
        expect_status(reply.password, "password", "success")?;
        debug!("password set");
        self.initialized = true;
        self.password = Some(Zeroizing::new(password.into()));
        self.on_status_changed();
        Ok(())
    }

    /// Authenticate against the device.
    ///
    /// On failure the error carries the remaining-attempt count and whether
    /// the next attempt needs a long touch, both parsed best-effort from the
    /// device's error text. On success the session adopts the password and
    /// seeded flag, and an unlocked bootloader is re-locked immediately.
    pub fn login(&mut self, password: &str) -> Result<(), LoginError> {
        let info = match self.device_info_with(password) {
            Ok(info) => info,
            Err(err) => {
                let (remaining_attempts, needs_long_touch) = match err {
                    Error::Proto(ProtoError::Device(ref e)) => parse_login_failure(&e.message),
                    _ => (None, false),
                };
                debug!(
                    "login failed (remaining attempts: {:?}, long touch: {})",
                    remaining_attempts, needs_long_touch
                );
                return Err(LoginError {
                    remaining_attempts,
                    needs_long_touch,
                    source: err,
                });
            }
        };

        self.password = Some(Zeroizing::new(password.into()));
        self.seeded = info.seeded;
        self.on_status_changed();
        debug!("authentication successful");

        if !info.bootlock {
            // Security policy: a device left with an unlocked bootloader is
            // re-locked on login, unconditionally.
            info!("device bootloader is unlocked; locking now");
            self.lock_bootloader().map_err(|e| LoginError {
                remaining_attempts: None,
                needs_long_touch: false,
                source: e,
            })?;
        }
        Ok(())
    }

    fn seed(
        &self,
        backup_password: &str,
        source: &str,
        filename: &str,
    ) -> Result<(), Error> {
        debug!("seed wallet (source: {}, filename: {})", source, filename);
        let key = crypto::stretch_key(backup_password)?;
        let reply = self.send(&Command::Seed {
            source: source.into(),
            key: key.to_string(),
            filename: filename.into(),
        })?;
        expect_status(reply.seed, "seed", "success")
    }

    /// Create a new wallet, storing a backup named after `wallet_name`.
    /// The backup is keyed with the device password.
    pub fn create_wallet(&mut self, wallet_name: &str) -> Result<(), Error> {
        validate_name(wallet_name)?;
        info!("create wallet '{}'", wallet_name);
        let password = self.password()?.to_owned();
        self.seed(
            &password,
            SEED_SOURCE_CREATE,
            &backup_filename(wallet_name),
        )?;
        self.seeded = true;
        self.on_status_changed();
        Ok(())
    }

    /// Restore a backup from the SD card. Returns `Ok(false)` if the user
    /// aborted, which is an expected outcome rather than a failure.
    pub fn restore_backup(&mut self, backup_password: &str, filename: &str) -> Result<bool, Error> {
        info!("restore backup '{}'", filename);
        match self.seed(backup_password, SEED_SOURCE_BACKUP, filename) {
            Err(e) if e.is_user_abort() => return Ok(false),
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        self.seeded = true;
        self.on_status_changed();
        Ok(true)
    }

    /// Back up the current seed onto the SD card.
    pub fn create_backup(&self, backup_name: &str) -> Result<(), Error> {
        validate_name(backup_name)?;
        info!("create backup '{}'", backup_name);
        let key = crypto::stretch_key(self.password()?)?;
        let reply = self.send(&Command::Backup(BackupCommand::Create {
            key: key.to_string(),
            filename: backup_filename(backup_name),
        }))?;
        match require(reply.backup, "backup")? {
            BackupResponse::Status(s) if s == "success" => Ok(()),
            other => Err(invalid_field("backup", format!("{other:?}"))),
        }
    }

    /// List backup filenames on the SD card.
    pub fn backup_list(&self) -> Result<Vec<String>, Error> {
        let reply = self.send(&Command::Backup(BackupCommand::Action("list".into())))?;
        match require(reply.backup, "backup")? {
            BackupResponse::List(filenames) => Ok(filenames),
            other => Err(invalid_field("backup", format!("{other:?}"))),
        }
    }

    /// Erase one backup from the SD card.
    pub fn erase_backup(&self, filename: &str) -> Result<(), Error> {
        info!("erase backup '{}'", filename);
        let reply = self.send(&Command::Backup(BackupCommand::Erase {
            erase: filename.into(),
        }))?;
        match require(reply.backup, "backup")? {
            BackupResponse::Status(s) if s == "success" => Ok(()),
            other => Err(invalid_field("backup", format!("{other:?}"))),
        }
    }

    /// Factory-reset the device. Returns `Ok(false)` if the user aborted.
    pub fn reset(&mut self) -> Result<bool, Error> {
        info!("reset device {}", self.device_id);
        let reply = match self.send(&Command::Reset(RESET_TOKEN.into())) {
            Err(e) if e.is_user_abort() => return Ok(false),
            Err(e) => return Err(e),
            Ok(reply) => reply,
        };
        expect_status(reply.reset, "reset", "success")?;
        self.password = None;
        self.seeded = false;
        self.initialized = false;
        self.on_status_changed();
        Ok(true)
    }

    /// Set the device name shown in [`DeviceInfo`].
    pub fn set_name(&self, name: &str) -> Result<(), Error> {
        validate_name(name)?;
        let reply = self.send(&Command::Name(name.into()))?;
        let new_name = require(reply.name, "name")?;
        if new_name != name {
            return Err(invalid_field("name", format!("got '{new_name}'")));
        }
        Ok(())
    }

    /// Export the extended public key at `path`.
    ///
    /// The device is read twice and the results compared; a mismatch means a
    /// flaky or compromised device and fails without returning either value.
    /// Deliberately not short-circuited to a single read.
    pub fn xpub(&self, path: &str) -> Result<Xpub, Error> {
        info!("fetch xpub at '{}'", path);
        let fetch = || -> Result<String, Error> {
            let reply = self.send(&Command::Xpub(path.into()))?;
            Ok(require(reply.xpub, "xpub")?)
        };
        let first = fetch()?;
        let second = fetch()?;
        if first != second {
            return Err(Error::InconsistentXpub { path: path.into() });
        }
        Ok(Xpub::from_str(&first)?)
    }

    /// Fetch 16 random bytes, hex encoded. `typ` is `"true"` or `"pseudo"`.
    pub fn random(&self, typ: &str) -> Result<String, Error> {
        if typ != "true" && typ != "pseudo" {
            return Err(Error::InvalidRandomType(typ.into()));
        }
        let reply = self.send(&Command::Random(typ.into()))?;
        let random = require(reply.random, "random")?;
        if random.len() != 32 || hex::decode(&random).is_err() {
            return Err(invalid_field(
                "random",
                format!("expected 32 hex characters, got '{random}'"),
            ));
        }
        Ok(random)
    }

    /// Flash the LED once.
    pub fn blink(&self) -> Result<(), Error> {
        self.send(&Command::Led("abort".into()))?;
        Ok(())
    }

    /// Trigger display of the address at `key_path` on connected 2FA
    /// channels. The device answers with a verification echo.
    pub fn display_address(&self, key_path: &str) -> Result<(), Error> {
        let reply = self.send(&Command::Xpub(key_path.into()))?;
        require(reply.echo, "echo")?;
        Ok(())
    }

    /// Unlock the bootloader for a firmware upgrade.
    pub fn unlock_bootloader(&self) -> Result<(), Error> {
        let reply = self.send(&Command::Bootloader("unlock".into()))?;
        expect_status(reply.bootloader, "bootloader", "unlock")
    }

    /// Lock the bootloader.
    pub fn lock_bootloader(&self) -> Result<(), Error> {
        info!("lock bootloader");
        let reply = self.send(&Command::Bootloader("lock".into()))?;
        expect_status(reply.bootloader, "bootloader", "lock")
    }

    /// Sign `hashes` with the keys at `keypaths`.
    ///
    /// Hashes are sent in batches of 15, each requiring one long-touch on
    /// the device. Per batch the command goes out twice: the first reply is
    /// the device's echo, the second carries the signatures. Results keep
    /// input order. Any batch failure aborts the whole operation.
    pub fn sign(&self, hashes: &[[u8; 32]], keypaths: &[String]) -> Result<Vec<Signature>, Error> {
        if hashes.len() != keypaths.len() {
            return Err(Error::SignRequestMismatch {
                hashes: hashes.len(),
                keypaths: keypaths.len(),
            });
        }
        if hashes.is_empty() {
            return Err(Error::EmptySignRequest);
        }
        info!("sign {} hashes", hashes.len());

        let mut signatures = Vec::with_capacity(hashes.len());
        for (hash_batch, path_batch) in hashes
            .chunks(SIGNATURE_BATCH_SIZE)
            .zip(keypaths.chunks(SIGNATURE_BATCH_SIZE))
        {
            let reply = self.sign_batch(hash_batch, path_batch)?;
            let entries = require(reply.sign, "sign")?;
            for entry in &entries {
                signatures.push(parse_signature(&entry.sig)?);
            }
        }
        if signatures.len() != hashes.len() {
            return Err(Error::SignatureCount {
                expected: hashes.len(),
                actual: signatures.len(),
            });
        }
        Ok(signatures)
    }

    fn sign_batch(&self, hashes: &[[u8; 32]], keypaths: &[String]) -> Result<Response, Error> {
        let cmd = Command::Sign {
            data: hashes
                .iter()
                .zip(keypaths)
                .map(|(hash, keypath)| SignRequestEntry {
                    hash: hex::encode(hash),
                    keypath: keypath.clone(),
                })
                .collect(),
        };
        // First call returns the echo, proof of a full round trip.
        self.send(&cmd)?;
        // Second call returns the signatures.
        self.send(&cmd)
    }
}

impl<T: Transport> Drop for DeviceHandle<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: Transport> crate::signer::SigningKeystore for DeviceHandle<T> {
    fn sign(&self, hashes: &[[u8; 32]], keypaths: &[String]) -> Result<Vec<Signature>, Error> {
        DeviceHandle::sign(self, hashes, keypaths)
    }
}

fn is_initializing(err: &Error) -> bool {
    matches!(err, Error::Proto(ProtoError::Device(e)) if e.is_initializing())
}

fn invalid_field(field: &'static str, reason: String) -> Error {
    Error::Proto(ProtoError::InvalidField { field, reason })
}

fn expect_status(
    field: Option<String>,
    name: &'static str,
    expected: &str,
) -> Result<(), Error> {
    let value = require(field, name)?;
    if value != expected {
        return Err(invalid_field(name, format!("got '{value}'")));
    }
    Ok(())
}

/// Device and wallet names accepted by the firmware.
static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-zA-Z-_ ]{1,31}$").unwrap());

fn validate_name(name: &str) -> Result<(), Error> {
    if !NAME_RE.is_match(name) {
        return Err(Error::InvalidName(name.into()));
    }
    Ok(())
}

fn backup_filename(backup_name: &str) -> String {
    format!(
        "{}-{}.pdf",
        backup_name,
        chrono::Local::now().format("%Y-%m-%d-%H-%M-%S")
    )
}

static ATTEMPTS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+) attempts remain before").unwrap());

/// Best-effort parse of a failed login's error text for the remaining
/// attempt count and whether the next attempt requires a long touch. The
/// transport only exposes free text here; treat the output as advisory.
fn parse_login_failure(message: &str) -> (Option<u32>, bool) {
    let remaining = ATTEMPTS_RE
        .captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    let needs_long_touch = message.contains("next");
    (remaining, needs_long_touch)
}

/// Parse one 128-hex-character R || S signature field.
fn parse_signature(sig: &str) -> Result<Signature, Error> {
    if sig.len() != 128 {
        return Err(invalid_field(
            "sig",
            format!("expected 128 hex characters, got {}", sig.len()),
        ));
    }
    let mut compact = [0u8; 64];
    hex::decode_to_slice(sig, &mut compact)
        .map_err(|e| invalid_field("sig", e.to_string()))?;
    Signature::from_compact(&compact).map_err(|e| invalid_field("sig", e.to_string()))
}
