//! Test doubles: a scripted transport and hooks that record what the engine delivers.

use crate::{
    dispatcher::Dispatcher,
    engine::Hooks,
    package::{CodeIndex, Package, SYSEX_START, SysexPackages},
    port::Port,
    protocol::MAX_FRAME,
    transport::{ReceiveError, Transport, TransportError},
};
use core::cell::RefCell;
use tinyvec::ArrayVec;

/// What a mock transport has received (its inbox) and sent, shared with the test through a [`RefCell`].
#[derive(Default)]
pub struct Wire {
    pub sub_ports: u8,
    /// Queued input; `None` makes the transport report [`ReceiveError::Timeout`].
    pub inbox: ArrayVec<[(u8, Option<Package>); 256]>,
    pub sent: ArrayVec<[(u8, Package); 256]>,
    /// Number of sends to refuse with [`TransportError::WouldBlock`] before accepting.
    pub busy_for: usize,
}

impl Wire {
    pub fn new(sub_ports: u8) -> Self {
        Self {
            sub_ports,
            ..Default::default()
        }
    }

    pub fn push(&mut self, sub_index: u8, package: Package) {
        self.inbox.push((sub_index, Some(package)));
    }

    pub fn push_timeout(&mut self, sub_index: u8) {
        self.inbox.push((sub_index, None));
    }

    /// Queues a SysEx stream, chunked the way a USB host would.
    pub fn push_sysex(&mut self, sub_index: u8, stream: &[u8]) {
        for package in SysexPackages::new(stream.iter().copied()) {
            self.push(sub_index, package);
        }
    }

    /// Payload bytes of every SysEx package sent, in order.
    pub fn sysex_bytes(&self) -> ArrayVec<[u8; 1024]> {
        self.sent
            .iter()
            .filter(|(_, package)| {
                matches!(
                    package.code_index(),
                    CodeIndex::SysexContinue
                        | CodeIndex::SysexEnd1
                        | CodeIndex::SysexEnd2
                        | CodeIndex::SysexEnd3
                        | CodeIndex::SingleByte
                ) && !package.is_realtime()
            })
            .flat_map(|(_, package)| package.payload().iter().copied())
            .collect()
    }

    /// Sent SysEx, split into frames at each `0xF0`.
    pub fn frames(&self) -> ArrayVec<[ArrayVec<[u8; MAX_FRAME]>; 16]> {
        let mut frames: ArrayVec<[ArrayVec<[u8; MAX_FRAME]>; 16]> = ArrayVec::new();
        for byte in self.sysex_bytes() {
            if byte == SYSEX_START {
                frames.push(ArrayVec::new());
            }
            if let Some(frame) = frames.last_mut() {
                frame.push(byte);
            }
        }
        frames
    }
}

/// A [`Transport`] backed by a shared [`Wire`].
pub struct MockTransport<'w> {
    wire: &'w RefCell<Wire>,
}

impl<'w> MockTransport<'w> {
    pub fn new(wire: &'w RefCell<Wire>) -> Self {
        Self { wire }
    }
}

impl Transport for MockTransport<'_> {
    fn sub_ports(&self) -> u8 {
        self.wire.borrow().sub_ports
    }

    fn try_send(&mut self, sub_index: u8, package: Package) -> Result<(), TransportError> {
        let mut wire = self.wire.borrow_mut();
        if sub_index >= wire.sub_ports {
            return Err(TransportError::Unavailable);
        }
        if wire.busy_for > 0 {
            wire.busy_for -= 1;
            return Err(TransportError::WouldBlock);
        }
        wire.sent.push((sub_index, package));
        Ok(())
    }

    fn try_receive(&mut self, sub_index: u8) -> Result<Option<Package>, ReceiveError> {
        let mut wire = self.wire.borrow_mut();
        let Some(i) = wire.inbox.iter().position(|(sub, _)| *sub == sub_index) else {
            return Ok(None);
        };
        match wire.inbox.remove(i) {
            (_, Some(package)) => Ok(Some(package)),
            (_, None) => Err(ReceiveError::Timeout),
        }
    }
}

/// [`Hooks`] remembering everything the engine handed to the application.
#[derive(Default)]
pub struct Recorder {
    pub packages: ArrayVec<[(Port, Package); 64]>,
    pub sysex: ArrayVec<[(Port, u8); 256]>,
    pub debug_input: ArrayVec<[u8; 64]>,
    pub timeouts: ArrayVec<[Port; 8]>,
    pub resets: usize,
    /// When set, the SysEx callback filters every SysEx package out of package delivery.
    pub filter_sysex: bool,
    /// When set, every debug input byte is echoed to the debug port.
    pub echo: bool,
}

impl Hooks for Recorder {
    fn package(&mut self, port: Port, package: Package, _dispatcher: &mut Dispatcher<'_>) {
        self.packages.push((port, package));
    }

    fn sysex_byte(&mut self, port: Port, byte: u8) -> bool {
        self.sysex.push((port, byte));
        self.filter_sysex
    }

    fn debug_input(&mut self, _port: Port, byte: u8, dispatcher: &mut Dispatcher<'_>) {
        self.debug_input.push(byte);
        if self.echo {
            let _ = dispatcher.debug_message(format_args!("{}", char::from(byte)));
        }
    }

    fn sysex_timeout(&mut self, port: Port) {
        self.timeouts.push(port);
    }

    fn reset_request(&mut self, _port: Port) {
        self.resets += 1;
    }
}
