// Copyright (c) 2023 Shift Crypto AG

//! BitBox host library
//!
//! The trust boundary between a host application and a BitBox hardware
//! wallet. The device holds the private keys; this library frames and
//! encrypts commands to it, tracks the session state it reports, derives
//! watch-only address chains from exported extended public keys, and
//! assembles fully-signed transactions from per-input device signatures.
//!
//! Layering, outermost first: [`signer`] resolves key paths through
//! [`chain`], signs through [`device::DeviceHandle`], which talks through
//! [`channel::Channel`] and the frame layer of [`bitbox_proto`] to the
//! physical transport supplied by the application.

/// Re-export the wire protocol crate for consumers
pub use bitbox_proto::{self as proto, Transport};

pub mod channel;
pub use channel::Channel;

pub mod device;
pub use device::{DeviceHandle, Event, Status};

mod error;
pub use error::{Error, LoginError};

pub mod address;
pub use address::{Address, ScriptType};

pub mod chain;
pub use chain::AddressChain;

pub mod signer;
pub use signer::{sign_transaction, verify_transaction, PreviousOutput, SigningKeystore};
