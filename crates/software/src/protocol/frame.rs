//! Building and parsing protocol frames: `header, device id, payload..., 0xF7`.

use crate::{
    configuration::{HEADER_LEN, Identity},
    package::SYSEX_END,
};
use core::fmt;
use tinyvec::ArrayVec;

/// Largest frame this crate sends, terminator included.
pub const MAX_FRAME: usize = 128;

/// Most packages a single frame takes on a package transport. Size outgoing queues in multiples of this.
pub const MAX_FRAME_PACKAGES: usize = MAX_FRAME.div_ceil(3);

/// Accumulates one outgoing frame in a fixed buffer.
///
/// Every payload byte is masked to 7 bits. Payload that does not fit is dropped (and the frame marked truncated),
/// but the `0xF7` terminator always fits.
#[derive(Clone, Debug)]
pub struct FrameWriter {
    buf: ArrayVec<[u8; MAX_FRAME]>,
    truncated: bool,
}

impl FrameWriter {
    /// Starts a frame addressed as `identity`.
    pub fn new(identity: &Identity) -> Self {
        let mut buf = ArrayVec::new();
        buf.extend_from_slice(identity.header());
        buf.push(identity.device_id());
        Self {
            buf,
            truncated: false,
        }
    }

    /// Appends one payload byte, masked to 7 bits.
    pub fn push(&mut self, byte: u8) {
        if self.remaining() == 0 {
            self.truncated = true;
        } else {
            self.buf.push(byte & 0x7f);
        }
    }

    /// Appends payload bytes, masked to 7 bits.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        bytes.iter().for_each(|&b| self.push(b));
    }

    /// Payload bytes that still fit.
    pub fn remaining(&self) -> usize {
        // keep one byte for the terminator
        MAX_FRAME - 1 - self.buf.len()
    }

    /// Returns `true` if payload was dropped.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Terminates the frame and returns its bytes.
    pub fn finish(mut self) -> ArrayVec<[u8; MAX_FRAME]> {
        self.buf.push(SYSEX_END);
        self.buf
    }
}

impl fmt::Write for FrameWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.extend_from_slice(s.as_bytes());
        if self.truncated {
            Err(fmt::Error)
        } else {
            Ok(())
        }
    }
}

/// Splits a complete frame addressed to `identity` into its command (or ack code) byte and the body between it and
/// the terminator. Returns `None` for anything else.
pub fn parse_frame<'b>(identity: &Identity, frame: &'b [u8]) -> Option<(u8, &'b [u8])> {
    let (prefix, rest) = frame.split_at_checked(HEADER_LEN + 1)?;
    if prefix[..HEADER_LEN] != identity.header()[..] || prefix[HEADER_LEN] != identity.device_id() {
        return None;
    }
    let (&command, rest) = rest.split_first()?;
    let (&terminator, body) = rest.split_last()?;
    (terminator == SYSEX_END && command < 0x80 && body.iter().all(|&b| b < 0x80))
        .then_some((command, body))
}
