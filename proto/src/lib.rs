// Copyright (c) 2023 Shift Crypto AG

//! Wire protocol for BitBox hardware wallet communication
//!
//! This crate implements the host side of the device protocol: framing of
//! arbitrary-length messages into fixed-size USB reports (ISO 7816-4 style,
//! carried over the U2F HID framing), the AES-256-CBC channel cipher keyed
//! from the device password, and the typed JSON command/response schema.
//!
//! The crate holds no session state; [`frame`] is a pure packet
//! (de)multiplexer and [`message`] a pure codec. Session logic lives in the
//! host library built on top of this crate.

pub mod crypto;
pub mod frame;
pub mod message;

mod error;
pub use error::{DeviceError, Error};

pub use frame::Transport;

/// Fixed USB HID report size used by the device.
pub const REPORT_SIZE: usize = 64;

/// Channel identifier carried in every frame.
pub const HWW_CID: u32 = 0xff00_0000;

/// Initial frame identifier of the U2F HID framing.
const U2FHID_TYPE_INIT: u8 = 0x80;

/// First vendor defined U2F HID command.
const U2FHID_VENDOR_FIRST: u8 = U2FHID_TYPE_INIT | 0x40;

/// Command byte for wallet frames (first vendor command + 1).
pub const HWW_CMD: u8 = U2FHID_VENDOR_FIRST | 0x01;

/// Padding byte for short reports. Not zero, so valid trailing zero bytes
/// in a payload stay distinguishable from padding.
pub const FRAME_FILLER: u8 = 0xee;
