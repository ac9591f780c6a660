// Copyright (c) 2023 Shift Crypto AG

//! Message framing over fixed-size USB reports
//!
//! Messages are split into one init report (channel id, command byte, 16-bit
//! big-endian length) followed by sequence-numbered continuation reports,
//! each padded to [`REPORT_SIZE`] with [`FRAME_FILLER`]. The framer knows
//! nothing about message content.

use std::io;

use crate::{Error, FRAME_FILLER, HWW_CID, HWW_CMD, REPORT_SIZE};

/// Minimum useful init report: channel id (4) + command (1) + length (2).
const INIT_HEADER_LEN: usize = 7;
/// Minimum useful continuation report: channel id (4) + sequence (1).
const CONT_HEADER_LEN: usize = 5;

/// Largest message the 16-bit length field can describe.
pub const MAX_MESSAGE_LEN: usize = 0xffff;

/// Maximum bootloader command length (one raw report).
pub const BOOT_CMD_LEN: usize = 4098;
/// Fixed bootloader response size.
pub const BOOT_REPLY_LEN: usize = 256;

/// Byte-level duplex channel to a plugged-in device.
///
/// Supplied by the surrounding application; this crate never enumerates or
/// opens devices itself. `close` is terminal (no reconnect) and must be safe
/// to call more than once from cleanup paths.
pub trait Transport: Send {
    /// Read up to `buf.len()` bytes, blocking until at least one report is
    /// available. May block indefinitely pending user interaction.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write a single report, returning the number of bytes written.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Close the underlying device.
    fn close(&mut self);
}

fn write_report<T: Transport + ?Sized>(
    transport: &mut T,
    header: &[u8],
    payload: &mut &[u8],
) -> Result<(), Error> {
    let mut report = Vec::with_capacity(REPORT_SIZE);
    report.extend_from_slice(header);
    let take = (REPORT_SIZE - report.len()).min(payload.len());
    report.extend_from_slice(&payload[..take]);
    *payload = &payload[take..];
    report.resize(REPORT_SIZE, FRAME_FILLER);

    let written = transport.write(&report)?;
    if written != REPORT_SIZE {
        return Err(Error::ShortWrite(written, REPORT_SIZE));
    }
    Ok(())
}

/// Send one message, split into init and continuation reports.
pub fn write_message<T: Transport + ?Sized>(transport: &mut T, msg: &[u8]) -> Result<(), Error> {
    if msg.is_empty() {
        return Ok(());
    }
    if msg.len() > MAX_MESSAGE_LEN {
        return Err(Error::MessageTooLong {
            len: msg.len(),
            max: MAX_MESSAGE_LEN,
        });
    }

    let mut remaining = msg;

    let mut header = Vec::with_capacity(INIT_HEADER_LEN);
    header.extend_from_slice(&HWW_CID.to_be_bytes());
    header.push(HWW_CMD);
    header.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    write_report(transport, &header, &mut remaining)?;

    let mut seq = 0u8;
    while !remaining.is_empty() {
        let mut header = Vec::with_capacity(CONT_HEADER_LEN);
        header.extend_from_slice(&HWW_CID.to_be_bytes());
        header.push(seq);
        write_report(transport, &header, &mut remaining)?;
        seq = seq.wrapping_add(1);
    }
    Ok(())
}

/// Read one message, reassembled from init and continuation reports.
pub fn read_message<T: Transport + ?Sized>(transport: &mut T) -> Result<Vec<u8>, Error> {
    let mut report = [0u8; REPORT_SIZE];
    let read = transport.read(&mut report)?;
    if read < INIT_HEADER_LEN {
        return Err(Error::ShortFrame {
            expected: INIT_HEADER_LEN,
            actual: read,
        });
    }
    if report[..4] != HWW_CID.to_be_bytes() {
        return Err(Error::ChannelIdMismatch);
    }
    if report[4] != HWW_CMD {
        return Err(Error::CommandMismatch {
            actual: report[4],
            expected: HWW_CMD,
        });
    }

    let len = u16::from_be_bytes([report[5], report[6]]) as usize;
    let mut data = Vec::with_capacity(len);
    data.extend_from_slice(&report[INIT_HEADER_LEN..read]);

    while data.len() < len {
        let read = transport.read(&mut report)?;
        if read < CONT_HEADER_LEN {
            return Err(Error::ShortFrame {
                expected: CONT_HEADER_LEN,
                actual: read,
            });
        }
        data.extend_from_slice(&report[CONT_HEADER_LEN..read]);
    }

    // Trailing bytes of the last report are filler.
    data.truncate(len);
    Ok(data)
}

/// Exchange one message in the raw bootloader format: a single zero-padded
/// command buffer with a leading sentinel byte, answered by a fixed-size
/// response with trailing NUL/whitespace trimmed.
pub fn exchange_boot<T: Transport + ?Sized>(
    transport: &mut T,
    msg: &[u8],
) -> Result<Vec<u8>, Error> {
    if msg.len() > BOOT_CMD_LEN {
        return Err(Error::MessageTooLong {
            len: msg.len(),
            max: BOOT_CMD_LEN,
        });
    }

    let mut buf = Vec::with_capacity(1 + BOOT_CMD_LEN);
    buf.push(0u8);
    buf.extend_from_slice(msg);
    buf.resize(1 + BOOT_CMD_LEN, 0u8);
    transport.write(&buf)?;

    let mut reply = Vec::with_capacity(BOOT_REPLY_LEN);
    let mut chunk = [0u8; BOOT_REPLY_LEN];
    while reply.len() < BOOT_REPLY_LEN {
        let read = transport.read(&mut chunk)?;
        if read == 0 {
            return Err(Error::ShortFrame {
                expected: BOOT_REPLY_LEN,
                actual: reply.len(),
            });
        }
        reply.extend_from_slice(&chunk[..read]);
    }

    while let Some(&last) = reply.last() {
        if last == 0 || (last as char).is_ascii_whitespace() {
            reply.pop();
        } else {
            break;
        }
    }
    Ok(reply)
}
