use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::channel::ReassemblyError;
use crate::hal::{HidEndpoint, StatusLed};
use crate::wire;

/// CTAP-HID command bytes (without the 0x80 initialization bit).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum HidCommand {
    Ping = 0x01,
    Init = 0x06,
    Wink = 0x08,
    Cbor = 0x10,
    Cancel = 0x11,
    Keepalive = 0x3B,
    Error = 0x3F,
}

/// CTAP-HID error codes carried in ERROR frames.
#[repr(u8)]
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
pub enum HidError {
    #[error("invalid command")]
    InvalidCmd = 0x01,

    #[error("invalid continuation sequence")]
    InvalidSeq = 0x04,

    #[error("transaction timed out")]
    MsgTimeout = 0x05,

    #[error("channel busy")]
    ChannelBusy = 0x06,

    #[error("unspecified error")]
    Other = 0x7F,
}

impl From<ReassemblyError> for HidError {
    fn from(err: ReassemblyError) -> Self {
        match err {
            ReassemblyError::InvalidSeq { .. } => HidError::InvalidSeq,
            ReassemblyError::Unexpected(_) => HidError::Other,
        }
    }
}

/// CTAPHID protocol version reported by INIT.
pub const PROTOCOL_VERSION: u8 = 2;
pub const DEVICE_VERSION_MAJOR: u8 = 1;
pub const DEVICE_VERSION_MINOR: u8 = 0;
pub const DEVICE_VERSION_BUILD: u8 = 1;

/// WINK | CBOR | NMSG capability flags.
pub const CAPABILITIES: u8 = 0x0D;

/// KEEPALIVE status: command is being processed.
pub const STATUS_PROCESSING: u8 = 1;

/// KEEPALIVE status: waiting for a touch.
pub const STATUS_UP_NEEDED: u8 = 2;

/// Cadence of KEEPALIVE frames while a command is in flight.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(100);

/// INIT response payload: echoed nonce, allocated channel, version and
/// capability trailer.
pub fn init_response_payload(nonce: &[u8], channel: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(nonce.len() + 9);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&channel.to_be_bytes());
    payload.push(PROTOCOL_VERSION);
    payload.push(DEVICE_VERSION_MAJOR);
    payload.push(DEVICE_VERSION_MINOR);
    payload.push(DEVICE_VERSION_BUILD);
    payload.push(CAPABILITIES);
    payload
}

/// The single writer over the HID endpoint.
///
/// Every outbound message, keep-alive frames included, goes through the
/// write gate, so a multi-frame response burst is never interleaved with
/// anything else. The activity LED is held on for the duration of a burst.
pub struct FrameSink {
    endpoint: Arc<dyn HidEndpoint>,
    led: Arc<dyn StatusLed>,
    write_gate: Mutex<()>,
}

impl FrameSink {
    pub fn new(endpoint: Arc<dyn HidEndpoint>, led: Arc<dyn StatusLed>) -> Self {
        Self {
            endpoint,
            led,
            write_gate: Mutex::new(()),
        }
    }

    /// Frame `payload` and write the burst contiguously.
    pub fn send_message(&self, channel: u32, cmd: HidCommand, payload: &[u8]) -> Result<()> {
        let frames = wire::encode_message(channel, cmd.into(), payload)?;
        let _gate = self.write_gate.lock().unwrap();
        self.led.set(true);
        let result = frames
            .iter()
            .try_for_each(|frame| self.endpoint.write_report(frame));
        self.led.set(false);
        log::debug!(
            "sent {:?} on channel 0x{:08X}: {} byte(s), {} frame(s)",
            cmd,
            channel,
            payload.len(),
            frames.len()
        );
        result
    }

    /// Best-effort ERROR frame.
    pub fn send_error(&self, channel: u32, error: HidError) {
        log::warn!("channel 0x{:08X}: {}", channel, error);
        if let Err(e) = self.send_message(channel, HidCommand::Error, &[error.into()]) {
            log::error!("failed to send error frame: {:#}", e);
        }
    }

    /// Best-effort KEEPALIVE frame.
    fn send_keepalive(&self, channel: u32, status: u8) {
        if let Err(e) = self.send_message(channel, HidCommand::Keepalive, &[status]) {
            log::error!("failed to send keepalive frame: {:#}", e);
        }
    }

    /// WINK side effect.
    pub fn wink(&self) {
        self.led.pulse();
    }
}

/// Keep-alive scheduler for one in-flight command.
///
/// A single background thread bound to the command's channel; at most one
/// exists process-wide because only one command is ever in flight. Stops on
/// drop, before the owner emits the response burst.
pub struct KeepAlive {
    stop: Arc<AtomicBool>,
    status: Arc<AtomicU8>,
    handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    pub fn start(sink: Arc<FrameSink>, channel: u32) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let status = Arc::new(AtomicU8::new(STATUS_PROCESSING));
        let handle = {
            let stop = stop.clone();
            let status = status.clone();
            std::thread::spawn(move || {
                let mut last_sent = Instant::now();
                while !stop.load(Ordering::SeqCst) {
                    if last_sent.elapsed() >= KEEPALIVE_INTERVAL {
                        sink.send_keepalive(channel, status.load(Ordering::SeqCst));
                        last_sent = Instant::now();
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            })
        };
        KeepAlive {
            stop,
            status,
            handle: Some(handle),
        }
    }

    /// Shared status byte, flipped to [`STATUS_UP_NEEDED`] by the presence
    /// gate while it waits.
    pub fn status_handle(&self) -> Arc<AtomicU8> {
        self.status.clone()
    }

    /// Stop the scheduler and wait for the thread to exit, guaranteeing no
    /// keep-alive frame can follow.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
