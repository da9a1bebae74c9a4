//! Provides [`Package`], the fixed 4-byte, transport-agnostic MIDI unit exchanged with every transport, along with
//! [`SysexPackages`] for chunking a byte stream into packages.
//!
//! The layout follows the USB-MIDI Event Packet: the first byte holds the cable (high nibble) and the code index
//! (low nibble), which classifies the remaining three bytes.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use wmidi::MidiMessage;

/// First byte of every SysEx stream.
pub const SYSEX_START: u8 = 0xf0;
/// Last byte of every SysEx stream.
pub const SYSEX_END: u8 = 0xf7;

/// Classification of a [`Package`]'s payload (the "type nibble").
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CodeIndex {
    /// Reserved for future extensions.
    Miscellaneous = 0x0,
    /// Reserved for cable events.
    CableEvent = 0x1,
    /// Two-byte System Common message (e.g. MTC quarter frame, song select).
    SystemCommon2 = 0x2,
    /// Three-byte System Common message (song position pointer).
    SystemCommon3 = 0x3,
    /// SysEx starts or continues with the following three bytes.
    SysexContinue = 0x4,
    /// Single-byte System Common message, or SysEx ending with the following byte.
    SysexEnd1 = 0x5,
    /// SysEx ends with the following two bytes.
    SysexEnd2 = 0x6,
    /// SysEx ends with the following three bytes.
    SysexEnd3 = 0x7,
    /// Note Off.
    NoteOff = 0x8,
    /// Note On.
    NoteOn = 0x9,
    /// Polyphonic key pressure.
    PolyPressure = 0xa,
    /// Control Change.
    ControlChange = 0xb,
    /// Program Change.
    ProgramChange = 0xc,
    /// Channel pressure.
    ChannelPressure = 0xd,
    /// Pitch bend.
    PitchBend = 0xe,
    /// A single byte: realtime status, or one byte of a stream from a byte-oriented transport.
    SingleByte = 0xf,
}

impl CodeIndex {
    /// Number of meaningful bytes carried by a package of this kind.
    pub fn payload_len(self) -> usize {
        match self {
            Self::Miscellaneous | Self::CableEvent => 0,
            Self::SysexEnd1 | Self::SingleByte => 1,
            Self::SystemCommon2
            | Self::SysexEnd2
            | Self::ProgramChange
            | Self::ChannelPressure => 2,
            Self::SystemCommon3
            | Self::SysexContinue
            | Self::SysexEnd3
            | Self::NoteOff
            | Self::NoteOn
            | Self::PolyPressure
            | Self::ControlChange
            | Self::PitchBend => 3,
        }
    }

    /// Returns `true` for the channel voice kinds (type nibble 0x8 to 0xE).
    pub fn is_channel_voice(self) -> bool {
        (self as u8) >= 0x8 && (self as u8) <= 0xe
    }
}

/// A fixed-size MIDI unit: cable, code index and up to three data bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Package {
    header: u8,
    data: [u8; 3],
}

impl Package {
    /// Constructs a package on cable 0. Bytes beyond the code index's payload length should be zero.
    pub const fn new(code_index: CodeIndex, data: [u8; 3]) -> Self {
        Self {
            header: code_index as u8,
            data,
        }
    }

    /// Interprets four raw bytes (e.g. one USB-MIDI Event Packet).
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self {
            header: bytes[0],
            data: [bytes[1], bytes[2], bytes[3]],
        }
    }

    /// The four raw bytes.
    pub const fn to_bytes(self) -> [u8; 4] {
        [self.header, self.data[0], self.data[1], self.data[2]]
    }

    /// The cable (sub-port) the package travels on.
    pub const fn cable(self) -> u8 {
        self.header >> 4
    }

    /// Returns a copy stamped with `cable` (truncated to 4 bits).
    pub const fn with_cable(self, cable: u8) -> Self {
        Self {
            header: (cable << 4) | (self.header & 0x0f),
            data: self.data,
        }
    }

    /// The raw type nibble.
    pub const fn type_nibble(self) -> u8 {
        self.header & 0x0f
    }

    /// The type nibble as a [`CodeIndex`].
    pub fn code_index(self) -> CodeIndex {
        // every nibble maps onto a variant
        CodeIndex::from_u8(self.type_nibble()).unwrap_or(CodeIndex::Miscellaneous)
    }

    /// All three data bytes, meaningful or not.
    pub const fn data(&self) -> &[u8; 3] {
        &self.data
    }

    /// The meaningful data bytes, per the code index.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.code_index().payload_len()]
    }

    /// Returns `true` for a single realtime status byte (0xF8 to 0xFF).
    pub fn is_realtime(self) -> bool {
        self.code_index() == CodeIndex::SingleByte && self.data[0] >= 0xf8
    }

    /// Builds a package for any message except SysEx, which must be chunked with [`SysexPackages`].
    pub fn from_message(message: &MidiMessage) -> Option<Self> {
        if matches!(message, MidiMessage::SysEx(_)) {
            return None;
        }
        let len = message.bytes_size();
        let mut data = [0_u8; 3];
        if len == 0 || len > data.len() {
            return None;
        }
        message.copy_to_slice(&mut data[..len]).ok()?;

        let code_index = match data[0] {
            status @ 0x80..=0xef => CodeIndex::from_u8(status >> 4)?,
            0xf1 | 0xf3 => CodeIndex::SystemCommon2,
            0xf2 => CodeIndex::SystemCommon3,
            0xf6 => CodeIndex::SysexEnd1,
            0xf8..=0xff => CodeIndex::SingleByte,
            _ => return None,
        };
        Some(Self::new(code_index, data))
    }

    /// Decodes the payload, if it forms a complete MIDI message on its own.
    ///
    /// SysEx chunks other than a whole `F0 .. F7` stream held in a single package do not decode.
    pub fn message(&self) -> Option<MidiMessage<'_>> {
        let payload = self.payload();
        if payload.is_empty() {
            return None;
        }
        MidiMessage::from_bytes(payload).ok()
    }
}

/// Splits a SysEx byte stream into packages.
///
/// Each chunk of up to three bytes becomes one package: chunks containing the `0xF7` terminator become SysEx-end
/// packages (and anything after the terminator is left for the next chunk), full chunks without it become
/// SysEx-continue packages, and a short tail without terminator is emitted one byte per package.
pub struct SysexPackages<I> {
    bytes: I,
    tail: [u8; 3],
    tail_len: usize,
    tail_pos: usize,
}

impl<I: Iterator<Item = u8>> SysexPackages<I> {
    /// Constructs a [`SysexPackages`] over the given stream.
    pub fn new(bytes: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            bytes: bytes.into_iter(),
            tail: [0; 3],
            tail_len: 0,
            tail_pos: 0,
        }
    }
}

impl<I: Iterator<Item = u8>> Iterator for SysexPackages<I> {
    type Item = Package;

    fn next(&mut self) -> Option<Package> {
        if self.tail_pos < self.tail_len {
            let byte = self.tail[self.tail_pos];
            self.tail_pos += 1;
            return Some(Package::new(CodeIndex::SingleByte, [byte, 0, 0]));
        }

        let mut chunk = [0_u8; 3];
        let mut len = 0;
        while len < chunk.len() {
            match self.bytes.next() {
                Some(byte) => {
                    chunk[len] = byte;
                    len += 1;
                    if byte == SYSEX_END {
                        let code_index = match len {
                            1 => CodeIndex::SysexEnd1,
                            2 => CodeIndex::SysexEnd2,
                            _ => CodeIndex::SysexEnd3,
                        };
                        return Some(Package::new(code_index, chunk));
                    }
                }
                None => break,
            }
        }

        match len {
            0 => None,
            3 => Some(Package::new(CodeIndex::SysexContinue, chunk)),
            _ => {
                self.tail = chunk;
                self.tail_len = len;
                self.tail_pos = 1;
                Some(Package::new(CodeIndex::SingleByte, [chunk[0], 0, 0]))
            }
        }
    }
}
