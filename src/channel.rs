use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;

use crate::wire::{self, Frame, CID_BROADCAST};

/// A transaction with no progress for this long is abandoned and the client
/// told to start over.
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_millis(500);

/// Reassembly failures that map onto CTAP-HID error frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("out-of-order continuation: got seq {got}, expected {expected}")]
    InvalidSeq { got: u8, expected: u8 },

    #[error("continuation frame on channel 0x{0:08X} with no transaction pending")]
    Unexpected(u32),
}

/// A fully reassembled request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub channel: u32,
    pub cmd: u8,
    pub payload: Vec<u8>,
}

struct Reassembly {
    cmd: u8,
    bcnt: u16,
    frames_left: usize,
    next_seq: u8,
    buf: Vec<u8>,
    last_activity: Instant,
}

impl Reassembly {
    fn finish(self) -> Transaction {
        let Reassembly {
            cmd, bcnt, mut buf, ..
        } = self;
        buf.truncate(bcnt as usize);
        Transaction {
            channel: 0, // filled in by the caller
            cmd,
            payload: buf,
        }
    }
}

/// Channel allocation plus per-channel reassembly state.
///
/// Channels come into existence either through INIT on the broadcast channel
/// (fresh random ID) or implicitly when a client starts a transaction on an
/// ID it already holds.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<u32, Option<Reassembly>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh channel ID in `[1, 0xFFFFFFFE]`, distinct from every
    /// live channel.
    pub fn allocate(&mut self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let id: u32 = rng.gen_range(1..CID_BROADCAST);
            if !self.channels.contains_key(&id) {
                self.channels.insert(id, None);
                log::debug!("allocated channel 0x{:08X}", id);
                return id;
            }
        }
    }

    /// Drop any partially assembled transaction on `channel`.
    pub fn reset(&mut self, channel: u32) {
        if let Some(state) = self.channels.get_mut(&channel) {
            *state = None;
        }
    }

    /// Feed one decoded frame in arrival order. Returns a completed
    /// transaction once every expected fragment is present.
    pub fn ingest(&mut self, frame: Frame) -> Result<Option<Transaction>, ReassemblyError> {
        match frame {
            Frame::Init {
                channel,
                cmd,
                bcnt,
                payload,
            } => {
                // An initialization frame always supersedes whatever was
                // pending on the channel.
                let frames_left = wire::frame_count(bcnt as usize) - 1;
                let mut buf = Vec::with_capacity(bcnt as usize);
                buf.extend_from_slice(&payload);
                let reassembly = Reassembly {
                    cmd,
                    bcnt,
                    frames_left,
                    next_seq: 0,
                    buf,
                    last_activity: Instant::now(),
                };
                if frames_left == 0 {
                    self.channels.insert(channel, None);
                    let mut txn = reassembly.finish();
                    txn.channel = channel;
                    Ok(Some(txn))
                } else {
                    self.channels.insert(channel, Some(reassembly));
                    Ok(None)
                }
            }
            Frame::Cont {
                channel,
                seq,
                payload,
            } => {
                let slot = self
                    .channels
                    .get_mut(&channel)
                    .and_then(Option::as_mut)
                    .ok_or(ReassemblyError::Unexpected(channel))?;

                if seq != slot.next_seq {
                    let expected = slot.next_seq;
                    self.reset(channel);
                    return Err(ReassemblyError::InvalidSeq { got: seq, expected });
                }

                slot.buf.extend_from_slice(&payload);
                slot.next_seq += 1;
                slot.frames_left -= 1;
                slot.last_activity = Instant::now();

                if slot.frames_left == 0 {
                    let reassembly = self.channels.get_mut(&channel).unwrap().take().unwrap();
                    let mut txn = reassembly.finish();
                    txn.channel = channel;
                    Ok(Some(txn))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Abandon transactions that have seen no progress for
    /// [`TRANSACTION_TIMEOUT`]. Returns the affected channels so the caller
    /// can emit timeout error frames.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<u32> {
        let mut expired = Vec::new();
        for (&channel, state) in &mut self.channels {
            if let Some(reassembly) = state {
                if now.duration_since(reassembly.last_activity) > TRANSACTION_TIMEOUT {
                    *state = None;
                    expired.push(channel);
                }
            }
        }
        for channel in &expired {
            log::warn!("transaction on channel 0x{:08X} timed out", channel);
        }
        expired
    }
}
