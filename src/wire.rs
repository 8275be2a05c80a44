use anyhow::{anyhow, Result};

/// Fixed CTAP-HID report size in bytes.
pub const REPORT_SIZE: usize = 64;

/// Payload capacity of an initialization frame (64 - 4 CID - 1 CMD - 2 BCNT).
pub const INIT_PAYLOAD: usize = REPORT_SIZE - 7;

/// Payload capacity of a continuation frame (64 - 4 CID - 1 SEQ).
pub const CONT_PAYLOAD: usize = REPORT_SIZE - 5;

/// Largest message a transaction can carry: one initialization frame plus
/// 128 continuation frames (sequence numbers 0x00..=0x7F).
pub const MAX_MESSAGE: usize = INIT_PAYLOAD + 128 * CONT_PAYLOAD;

/// Broadcast channel ID used by clients to request a channel via INIT.
pub const CID_BROADCAST: u32 = 0xFFFF_FFFF;

/// A single decoded 64-byte report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Initialization frame: starts a new transaction on the channel.
    Init {
        channel: u32,
        cmd: u8,
        bcnt: u16,
        payload: [u8; INIT_PAYLOAD],
    },
    /// Continuation frame: carries the next `seq`-indexed chunk.
    Cont {
        channel: u32,
        seq: u8,
        payload: [u8; CONT_PAYLOAD],
    },
}

impl Frame {
    pub fn channel(&self) -> u32 {
        match self {
            Frame::Init { channel, .. } | Frame::Cont { channel, .. } => *channel,
        }
    }
}

/// Decode one raw report. Byte 4 with the high bit set marks an
/// initialization frame; otherwise the byte is a continuation sequence
/// number.
pub fn parse_report(report: &[u8; REPORT_SIZE]) -> Frame {
    let channel = u32::from_be_bytes([report[0], report[1], report[2], report[3]]);
    if report[4] & 0x80 != 0 {
        let mut payload = [0u8; INIT_PAYLOAD];
        payload.copy_from_slice(&report[7..]);
        Frame::Init {
            channel,
            cmd: report[4] & 0x7F,
            bcnt: u16::from_be_bytes([report[5], report[6]]),
            payload,
        }
    } else {
        let mut payload = [0u8; CONT_PAYLOAD];
        payload.copy_from_slice(&report[5..]);
        Frame::Cont {
            channel,
            seq: report[4],
            payload,
        }
    }
}

/// Re-align a report whose leading channel bytes were stripped by the
/// transport: drop leading zero bytes and pad the tail with zeros back to 64
/// bytes. Some HID gadget stacks swallow leading zeros, so a report that
/// appears to start on the reserved zero channel is reprocessed this way
/// once before being dropped.
pub fn realign_report(report: &[u8; REPORT_SIZE]) -> [u8; REPORT_SIZE] {
    let start = report.iter().position(|&b| b != 0).unwrap_or(REPORT_SIZE);
    let mut fixed = [0u8; REPORT_SIZE];
    let len = REPORT_SIZE - start;
    fixed[..len].copy_from_slice(&report[start..]);
    log::trace!("re-aligned zero-channel report, stripped {} bytes", start);
    fixed
}

/// Number of 64-byte frames needed to carry a `bcnt`-byte message.
pub fn frame_count(bcnt: usize) -> usize {
    if bcnt <= INIT_PAYLOAD {
        1
    } else {
        1 + (bcnt - INIT_PAYLOAD).div_ceil(CONT_PAYLOAD)
    }
}

/// Split a message into an initialization frame followed by zero-padded
/// continuation frames.
///
/// # Arguments
/// * `channel` - Channel the transaction belongs to
/// * `cmd` - CTAP-HID command byte (without the 0x80 initialization bit)
/// * `payload` - Complete message payload, at most [`MAX_MESSAGE`] bytes
pub fn encode_message(channel: u32, cmd: u8, payload: &[u8]) -> Result<Vec<[u8; REPORT_SIZE]>> {
    if payload.len() > MAX_MESSAGE {
        return Err(anyhow!(
            "message too large: {} bytes (max {})",
            payload.len(),
            MAX_MESSAGE
        ));
    }

    let mut frames = Vec::with_capacity(frame_count(payload.len()));

    let mut first = [0u8; REPORT_SIZE];
    first[0..4].copy_from_slice(&channel.to_be_bytes());
    first[4] = cmd | 0x80;
    first[5..7].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    let head = payload.len().min(INIT_PAYLOAD);
    first[7..7 + head].copy_from_slice(&payload[..head]);
    frames.push(first);

    let mut sent = head;
    let mut seq = 0u8;
    while sent < payload.len() {
        let chunk = (payload.len() - sent).min(CONT_PAYLOAD);
        let mut cont = [0u8; REPORT_SIZE];
        cont[0..4].copy_from_slice(&channel.to_be_bytes());
        cont[4] = seq;
        cont[5..5 + chunk].copy_from_slice(&payload[sent..sent + chunk]);
        frames.push(cont);
        sent += chunk;
        seq += 1;
    }

    log::trace!(
        "encoded message cmd=0x{:02X} bcnt={} into {} frame(s)",
        cmd,
        payload.len(),
        frames.len()
    );
    Ok(frames)
}

/// Reassemble a frame burst back into `(channel, cmd, payload)`.
/// Test-side inverse of [`encode_message`].
#[cfg(test)]
pub(crate) fn decode_message(frames: &[[u8; REPORT_SIZE]]) -> (u32, u8, Vec<u8>) {
    let (channel, cmd, bcnt, head) = match parse_report(&frames[0]) {
        Frame::Init {
            channel,
            cmd,
            bcnt,
            payload,
        } => (channel, cmd, bcnt as usize, payload),
        Frame::Cont { .. } => panic!("burst does not start with an initialization frame"),
    };

    let mut payload = head.to_vec();
    for frame in &frames[1..] {
        match parse_report(frame) {
            Frame::Cont { payload: chunk, .. } => payload.extend_from_slice(&chunk),
            Frame::Init { .. } => panic!("unexpected initialization frame inside burst"),
        }
    }
    payload.truncate(bcnt);
    (channel, cmd, payload)
}
