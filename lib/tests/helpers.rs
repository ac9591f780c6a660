//! Shared test fixtures: an in-memory fake device speaking the framed,
//! encrypted wire protocol, driven by a per-test reply handler.

use std::collections::VecDeque;
use std::io;
use std::str::FromStr;

use log::LevelFilter;
use serde_json::{json, Value};
use simplelog::SimpleLogger;

use bitbox_host::proto::{crypto, frame, Transport};
use bitbox_host::DeviceHandle;

/// Password the fake device accepts; anything else fails decryption.
pub const PASSWORD: &str = "correct horse battery staple";

/// Error text the firmware produces on a wrong password.
pub const WRONG_PASSWORD_MESSAGE: &str =
    "Could not decrypt. 2 attempts remain before the device is reset.";

pub fn init_logging() {
    let log_level = match std::env::var("LOG_LEVEL").map(|v| LevelFilter::from_str(&v)) {
        Ok(Ok(l)) => l,
        _ => LevelFilter::Debug,
    };
    let _ = SimpleLogger::init(log_level, simplelog::Config::default());
}

/// In-memory device: reassembles written reports into commands, decrypts
/// them with the known password, and frames the handler's reply back.
pub struct FakeDevice {
    handler: Box<dyn FnMut(&Value) -> Value + Send>,
    /// Reports written by the host, pending reassembly.
    pending: VecDeque<Vec<u8>>,
    /// Reports queued for the host to read.
    rx: VecDeque<Vec<u8>>,
    pub closed: bool,
}

impl FakeDevice {
    pub fn new(handler: impl FnMut(&Value) -> Value + Send + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            pending: VecDeque::new(),
            rx: VecDeque::new(),
            closed: false,
        }
    }

    /// Try to reassemble a full message from the pending reports; leaves
    /// them queued while the message is still incomplete.
    fn try_dispatch(&mut self) {
        let mut reader = ReportReader {
            reports: self.pending.clone(),
        };
        let msg = match frame::read_message(&mut reader) {
            Ok(msg) => msg,
            Err(_) => return,
        };
        self.pending.clear();
        self.handle(&msg);
    }

    fn handle(&mut self, msg: &[u8]) {
        // Plaintext commands (ping, password) come through as direct JSON.
        if let Ok(cmd) = serde_json::from_slice::<Value>(msg) {
            let reply = (self.handler)(&cmd);
            self.queue_reply(&reply);
            return;
        }

        // Everything else is base64 ciphertext under the channel key.
        let key = crypto::encryption_key(PASSWORD);
        let cmd = String::from_utf8(msg.to_vec())
            .ok()
            .and_then(|text| crypto::decrypt(&key, &text).ok())
            .and_then(|plain| serde_json::from_slice::<Value>(&plain).ok());
        match cmd {
            Some(cmd) => {
                let reply = (self.handler)(&cmd);
                let ciphertext = crypto::encrypt(&key, reply.to_string().as_bytes());
                self.queue_reply(&json!({ "ciphertext": ciphertext }));
            }
            // The firmware answers undecryptable commands in plaintext.
            None => self.queue_reply(&json!({
                "error": { "message": WRONG_PASSWORD_MESSAGE, "code": 109 }
            })),
        }
    }

    fn queue_reply(&mut self, reply: &Value) {
        let mut sink = ReportSink {
            reports: VecDeque::new(),
        };
        frame::write_message(&mut sink, reply.to_string().as_bytes()).unwrap();
        self.rx.append(&mut sink.reports);
    }
}

impl Transport for FakeDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let report = self
            .rx
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no reply queued"))?;
        let n = report.len().min(buf.len());
        buf[..n].copy_from_slice(&report[..n]);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.push_back(buf.to_vec());
        self.try_dispatch();
        Ok(buf.len())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Read adapter over queued reports for [`frame::read_message`].
struct ReportReader {
    reports: VecDeque<Vec<u8>>,
}

impl Transport for ReportReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let report = self
            .reports
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "incomplete"))?;
        let n = report.len().min(buf.len());
        buf[..n].copy_from_slice(&report[..n]);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn close(&mut self) {}
}

/// Write adapter collecting framed reports for [`frame::write_message`].
struct ReportSink {
    reports: VecDeque<Vec<u8>>,
}

impl Transport for ReportSink {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.reports.push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn close(&mut self) {}
}

/// Firmware version accepted by the session.
pub fn firmware_version() -> semver::Version {
    semver::Version::new(2, 2, 3)
}

/// Open a firmware-mode session against a fake device.
pub fn connect(
    handler: impl FnMut(&Value) -> Value + Send + 'static,
) -> DeviceHandle<FakeDevice> {
    init_logging();
    DeviceHandle::new("fake", false, &firmware_version(), FakeDevice::new(handler))
        .expect("session construction failed")
}

/// A `{"device": "info"}` reply body.
pub fn device_info_json(seeded: bool, bootlock: bool) -> Value {
    json!({
        "version": "2.2.3",
        "serial": "fake-serial",
        "id": "fake-id",
        "TFA": "",
        "bootlock": bootlock,
        "name": "fake",
        "sdcard": true,
        "lock": false,
        "U2F": false,
        "U2F_hijack": false,
        "seeded": seeded,
    })
}
