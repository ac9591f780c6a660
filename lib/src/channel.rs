// Copyright (c) 2023 Shift Crypto AG

//! Encrypted command channel
//!
//! Wraps a [`Transport`] with the framing and channel cipher from
//! [`bitbox_proto`]. A single mutex serializes the full send/receive round
//! trip, so at most one request is in flight per underlying transport;
//! concurrent callers block and are served in turn.

use std::sync::Mutex;

use log::{debug, log_enabled, Level};

use crate::proto::{
    crypto, frame,
    message::{parse_reply, redact, Response},
    Transport,
};
use crate::Error;

/// Encrypted channel to one device. Owns the transport exclusively.
pub struct Channel<T: Transport> {
    transport: Mutex<T>,
}

impl<T: Transport> Channel<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Mutex::new(transport),
        }
    }

    /// Send an unencrypted JSON command and parse the reply. A reply with
    /// an `error` payload fails as a device error.
    pub fn send_plain(&self, msg: &str) -> Result<Response, Error> {
        log_redacted(msg.as_bytes(), false);

        let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        frame::write_message(&mut *transport, msg.as_bytes())?;
        let mut reply = frame::read_message(&mut *transport)?;
        drop(transport);

        // The device pads replies with trailing NUL/whitespace.
        while let Some(&last) = reply.last() {
            if last == 0 || (last as char).is_ascii_whitespace() {
                reply.pop();
            } else {
                break;
            }
        }

        log_redacted(&reply, true);
        Ok(parse_reply(&reply)?)
    }

    /// Send an encrypted JSON command and parse the decrypted reply.
    ///
    /// The key is derived from the password by double-SHA256. If the reply
    /// carries a `ciphertext` field it is decrypted with the same key and
    /// re-decoded; a plain reply (e.g. a plaintext error) is final.
    pub fn send_encrypt(&self, msg: &str, password: &str) -> Result<Response, Error> {
        let key = crypto::encryption_key(password);
        let ciphertext = crypto::encrypt(&key, msg.as_bytes());

        let reply = self.send_plain(&ciphertext)?;
        let Some(reply_ciphertext) = reply.ciphertext else {
            return Ok(reply);
        };

        let plaintext = crypto::decrypt(&key, &reply_ciphertext)?;
        log_redacted(&plaintext, true);
        Ok(parse_reply(&plaintext)?)
    }

    /// Exchange one message in the raw bootloader format.
    pub fn send_boot(&self, msg: &[u8]) -> Result<Vec<u8>, Error> {
        let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        Ok(frame::exchange_boot(&mut *transport, msg)?)
    }

    /// Close the underlying transport. Safe to call from cleanup paths.
    pub fn close(&self) {
        let mut transport = self.transport.lock().unwrap_or_else(|e| e.into_inner());
        transport.close();
    }
}

/// Log a payload with every leaf value masked. Ciphertexts and non-JSON
/// payloads are not logged at all.
fn log_redacted(msg: &[u8], receiving: bool) {
    if !log_enabled!(Level::Debug) {
        return;
    }
    let direction = if receiving { "receiving" } else { "sending" };
    match serde_json::from_slice::<serde_json::Value>(msg) {
        Ok(value) => debug!("{} message: {}", direction, redact(&value)),
        Err(_) => debug!("{} non-JSON payload ({} bytes)", direction, msg.len()),
    }
}
