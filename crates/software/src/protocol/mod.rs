//! The SysEx command protocol: once a stream has matched this device's header and id, its first byte selects a
//! command and the rest is fed to that command until `0xF7`. Commands answer with acknowledge (ACK) or disacknowledge
//! (DISACK) frames.
//!
//! Three commands are built in: Query, Debug and Ping. Applications add their own through the [`Command`] trait,
//! using the same header, id and acknowledge framing; see [`patch`] for a complete example.

mod frame;
pub use frame::*;

pub mod patch;

use crate::{
    configuration::DeviceInfo,
    dispatcher::{Dispatcher, RegisterError},
    engine::Hooks,
    port::Port,
};
use core::fmt::{self, Write};
use num_derive::{FromPrimitive, ToPrimitive};

/// Command id of Query.
pub const QUERY: u8 = 0x00;
/// Command id of Debug.
pub const DEBUG: u8 = 0x0d;
/// Command id of Ping.
pub const PING: u8 = 0x0f;

/// Acknowledge code.
pub const ACK: u8 = 0x0f;
/// Disacknowledge code.
pub const DISACK: u8 = 0x0e;

/// Debug sub-mode: the remaining bytes are text typed into the device's terminal.
pub const DEBUG_INPUT: u8 = 0x00;
/// Debug sub-mode: the remaining bytes are text printed by a device.
pub const DEBUG_OUTPUT: u8 = 0x40;

/// Query selector requesting a reset (e.g. into the bootloader).
pub const QUERY_RESET: u8 = 0x7f;

/// Maximum number of application commands.
pub const MAX_COMMANDS: usize = 8;

/// Argument of a DISACK frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisackReason {
    /// The command body was shorter than expected.
    LessBytesThanExpected = 0x01,
    /// The command body was longer than expected.
    MoreBytesThanExpected = 0x02,
    /// The checksum did not match the body.
    WrongChecksum = 0x03,
    /// The requested storage (bank, patch slot) is not available.
    StorageUnavailable = 0x0a,
    /// No command with this id exists.
    InvalidCommand = 0x0c,
    /// Query selector not known.
    UnknownQuery = 0x0d,
    /// Debug sub-mode not supported on the receiving side.
    UnsupportedDebugMode = 0x0f,
}

/// Additive 7-bit checksum: the two's complement of the sum, so that `(sum(data) + checksum) & 0x7F == 0`.
pub fn checksum<'d>(data: impl IntoIterator<Item = &'d u8>) -> u8 {
    data.into_iter()
        .fold(0_u8, |sum, &b| sum.wrapping_add(b))
        .wrapping_neg()
        & 0x7f
}

/// The channel a command answers through: the dispatcher plus the port the command arrived on.
pub struct Reply<'r, 'a> {
    dispatcher: &'r mut Dispatcher<'a>,
    port: Port,
}

impl<'r, 'a> Reply<'r, 'a> {
    /// Constructs a [`Reply`] to `port`.
    pub fn new(dispatcher: &'r mut Dispatcher<'a>, port: Port) -> Self {
        Self { dispatcher, port }
    }

    /// The port the command arrived on.
    pub fn port(&self) -> Port {
        self.port
    }

    /// Direct access to the dispatcher, e.g. to send somewhere other than [`Self::port`].
    pub fn dispatcher(&mut self) -> &mut Dispatcher<'a> {
        self.dispatcher
    }

    /// Starts a frame addressed as this device.
    pub fn frame(&self) -> FrameWriter {
        FrameWriter::new(&self.dispatcher.identity())
    }

    /// Sends a frame built with [`Self::frame`].
    ///
    /// Replies are best effort: a failed send is logged and the frame dropped. Use [`Self::dispatcher`] directly to
    /// handle send errors.
    pub fn send(&mut self, frame: FrameWriter) {
        let bytes = frame.finish();
        if let Err(e) = self.dispatcher.send_sysex(self.port, &bytes) {
            warn!("Reply to {} failed: {}", self.port, e);
        }
    }

    /// Sends `header id ACK argument F7`.
    pub fn ack(&mut self, argument: u8) {
        let mut frame = self.frame();
        frame.extend_from_slice(&[ACK, argument]);
        self.send(frame);
    }

    /// Sends `header id DISACK reason F7`.
    pub fn disack(&mut self, reason: DisackReason) {
        debug!("DISACK {} to {}", reason, self.port);
        let mut frame = self.frame();
        frame.extend_from_slice(&[DISACK, reason as u8]);
        self.send(frame);
    }

    /// Sends `header id ACK text F7`.
    pub fn ack_text(&mut self, text: fmt::Arguments) {
        let mut frame = self.frame();
        frame.push(ACK);
        if frame.write_fmt(text).is_err() {
            warn!("Acknowledge text truncated");
        }
        self.send(frame);
    }
}

/// An application-defined command.
///
/// `receive` is fed every body byte; `end` runs once, on `0xF7` or when the stream is aborted (another status byte,
/// a restart, a timeout), so a command can always flush partial work. Validate everything before committing any side
/// effect in `end`, and do not commit aborted streams.
pub trait Command {
    /// Returns `true` for each command id this command implements.
    fn handles(&self, command: u8) -> bool;

    /// A stream addressed to `command` has started.
    fn begin(&mut self, command: u8, reply: &mut Reply<'_, '_>);

    /// One body byte (always below `0x80`).
    fn receive(&mut self, byte: u8, reply: &mut Reply<'_, '_>);

    /// The stream ended, by `0xF7` unless `aborted`.
    fn end(&mut self, aborted: bool, reply: &mut Reply<'_, '_>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Active {
    Query { selector: Option<u8> },
    Debug { mode: Option<u8> },
    Ping { extra_bytes: bool },
    Extension(usize),
}

/// Dispatches stream events to the built-in commands and the registered [`Command`]s.
pub struct Protocol<'a> {
    active: Option<Active>,
    commands: [Option<&'a mut dyn Command>; MAX_COMMANDS],
}

impl Default for Protocol<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Protocol<'a> {
    /// Constructs a [`Protocol`] knowing only the built-in commands.
    pub fn new() -> Self {
        Self {
            active: None,
            commands: [const { None }; MAX_COMMANDS],
        }
    }

    /// Adds an application command. Commands claiming a built-in id are refused.
    pub fn register(&mut self, command: &'a mut dyn Command) -> Result<(), RegisterError> {
        if [QUERY, DEBUG, PING].iter().any(|&id| command.handles(id)) {
            return Err(RegisterError::Reserved);
        }
        let slot = self
            .commands
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(RegisterError::Full)?;
        *slot = Some(command);
        Ok(())
    }

    /// Returns `true` if a command is executing.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Starts `command`. Returns `false` if the id is unknown, in which case a DISACK has been sent and the caller
    /// should discard the rest of the stream.
    pub fn begin(&mut self, command: u8, reply: &mut Reply<'_, 'a>) -> bool {
        debug!("Command {:#x} from {}", command, reply.port());
        self.active = match command {
            QUERY => Some(Active::Query { selector: None }),
            DEBUG => Some(Active::Debug { mode: None }),
            PING => Some(Active::Ping { extra_bytes: false }),
            id => self
                .commands
                .iter()
                .position(|slot| slot.as_ref().is_some_and(|c| c.handles(id)))
                .map(Active::Extension),
        };

        match self.active {
            Some(Active::Extension(i)) => {
                if let Some(extension) = self.commands[i].as_mut() {
                    extension.begin(command, reply);
                }
                true
            }
            Some(_) => true,
            None => {
                info!("Invalid command {:#x} from {}", command, reply.port());
                reply.disack(DisackReason::InvalidCommand);
                false
            }
        }
    }

    /// Feeds one body byte to the active command.
    pub fn receive<H: Hooks>(&mut self, byte: u8, reply: &mut Reply<'_, 'a>, hooks: &mut H) {
        match self.active.as_mut() {
            Some(Active::Query { selector }) => *selector = Some(byte),
            Some(Active::Debug { mode }) => match *mode {
                None => *mode = Some(byte),
                Some(DEBUG_INPUT) => {
                    let port = reply.port();
                    hooks.debug_input(port, byte, reply.dispatcher());
                }
                Some(_) => {}
            },
            Some(Active::Ping { extra_bytes }) => *extra_bytes = true,
            Some(&mut Active::Extension(i)) => {
                if let Some(extension) = self.commands[i].as_mut() {
                    extension.receive(byte, reply);
                }
            }
            None => {}
        }
    }

    /// Ends the active command. Built-in commands answer only streams terminated by `0xF7`.
    pub fn end<H: Hooks>(&mut self, aborted: bool, reply: &mut Reply<'_, 'a>, info: &DeviceInfo, hooks: &mut H) {
        let Some(active) = self.active.take() else {
            return;
        };
        if aborted {
            debug!("Command aborted on {}", reply.port());
        }
        match active {
            Active::Extension(i) => {
                if let Some(extension) = self.commands[i].as_mut() {
                    extension.end(aborted, reply);
                }
            }
            _ if aborted => {}
            Active::Query { selector } => query(selector, reply, info, hooks),
            Active::Debug {
                mode: Some(DEBUG_INPUT),
            } => reply.ack(0x00),
            Active::Debug { .. } => reply.disack(DisackReason::UnsupportedDebugMode),
            // a ping carrying data is never answered
            Active::Ping { extra_bytes: false } => reply.ack(0x00),
            Active::Ping { extra_bytes: true } => {}
        }
    }
}

fn query<H: Hooks>(selector: Option<u8>, reply: &mut Reply<'_, '_>, info: &DeviceInfo, hooks: &mut H) {
    match selector {
        Some(0x01) => reply.ack_text(format_args!("{}", info.operating_system)),
        Some(0x02) => reply.ack_text(format_args!("{}", info.board)),
        Some(0x03) => reply.ack_text(format_args!("{}", info.core_family)),
        Some(0x04) => reply.ack_text(format_args!("{:08X}", info.chip_id)),
        Some(0x05) => reply.ack_text(format_args!("{}", info.serial_number)),
        Some(0x06) => reply.ack_text(format_args!("{}", info.flash_size)),
        Some(0x07) => reply.ack_text(format_args!("{}", info.ram_size)),
        Some(0x08) => reply.ack_text(format_args!("{}", info.boot_line1)),
        Some(0x09) => reply.ack_text(format_args!("{}", info.boot_line2)),
        Some(QUERY_RESET) => {
            info!("Reset requested by {}", reply.port());
            hooks.reset_request(reply.port());
        }
        _ => reply.disack(DisackReason::UnknownQuery),
    }
}
