//! Provides the [`Engine`], which polls the registered transports, routes every received [`Package`] either straight
//! to the application or through SysEx reassembly into the command [`Protocol`], and recovers stalled streams.
//!
//! The application plugs in through [`Hooks`]. A typical firmware runs [`Engine::pump`] from one periodic task and
//! [`TimeoutGuard::tick`] every millisecond from another (or from a timer interrupt):
//!
//! ```ignore
//! static GUARD: TimeoutGuard = TimeoutGuard::new(StreamStrategy::SingleStream, SYSEX_TIMEOUT);
//!
//! let mut engine = Engine::new(config, &GUARD, MyHooks)?;
//! engine.register_transport(PortClass::Usb, &mut usb)?;
//! loop {
//!     engine.pump();
//!     Timer::after_millis(1).await;
//! }
//! ```

use crate::{
    configuration::{DeviceInfo, EngineConfig, Identity},
    dispatcher::{Dispatcher, RegisterError, SendError, TxFilter},
    package::{CodeIndex, Package, SYSEX_START},
    port::{Port, PortClass, PortError, PortMap},
    protocol::{Command, Protocol, Reply},
    sysex::{PortEvent, Reassembler, StreamEvent, TimeoutGuard},
    transport::{ReceiveError, Transport},
};
use core::fmt;

/// Most packages a single [`Engine::pump`] call forwards, so one call cannot starve other work.
pub const MAX_PACKAGES_PER_PUMP: usize = 10;

/// Application callbacks. Every method has a do-nothing default.
pub trait Hooks {
    /// A package for the application: channel voice, system common, realtime, and SysEx packages not filtered by
    /// [`Hooks::sysex_byte`]. The dispatcher is passed along so the application can answer or forward.
    fn package(&mut self, _port: Port, _package: Package, _dispatcher: &mut Dispatcher<'_>) {}

    /// Every SysEx byte received, whether or not it belongs to this device's protocol. Returning `true` filters the
    /// package carrying the byte out of [`Hooks::package`].
    fn sysex_byte(&mut self, _port: Port, _byte: u8) -> bool {
        false
    }

    /// One byte of text typed into this device's debug terminal (Debug command, input mode).
    fn debug_input(&mut self, _port: Port, _byte: u8, _dispatcher: &mut Dispatcher<'_>) {}

    /// The SysEx stream from `port` stalled or was abandoned by its transport, and has been reset.
    fn sysex_timeout(&mut self, _port: Port) {}

    /// A Query asked the device to reset (e.g. into its bootloader).
    fn reset_request(&mut self, _port: Port) {}
}

impl Hooks for () {}

/// The package transport and SysEx protocol engine.
pub struct Engine<'a, H> {
    dispatcher: Dispatcher<'a>,
    reassembler: Reassembler,
    protocol: Protocol<'a>,
    guard: &'a TimeoutGuard,
    info: DeviceInfo,
    hooks: H,
}

impl<'a, H: Hooks> Engine<'a, H> {
    /// Constructs an [`Engine`]. The stream strategy is the one `guard` was built with.
    pub fn new(config: EngineConfig, guard: &'a TimeoutGuard, hooks: H) -> Result<Self, PortError> {
        let ports = PortMap::new(config.default_port, config.debug_port)?;
        Ok(Self {
            dispatcher: Dispatcher::new(config.identity, ports),
            reassembler: Reassembler::new(guard.strategy()),
            protocol: Protocol::new(),
            guard,
            info: config.info,
            hooks,
        })
    }

    /// Registers the transport serving `class`.
    pub fn register_transport(
        &mut self,
        class: PortClass,
        transport: &'a mut dyn Transport,
    ) -> Result<(), RegisterError> {
        self.dispatcher.register_transport(class, transport)
    }

    /// Adds an application command to the protocol.
    pub fn register_command(&mut self, command: &'a mut dyn Command) -> Result<(), RegisterError> {
        self.protocol.register(command)
    }

    /// Installs (or with `None`, removes) the Tx filter.
    pub fn set_tx_filter(&mut self, filter: Option<&'a mut dyn TxFilter>) {
        self.dispatcher.set_tx_filter(filter);
    }

    /// Sets this device's id, masked to 7 bits.
    pub fn set_device_id(&mut self, device_id: u8) {
        self.dispatcher.set_device_id(device_id);
    }

    /// Redirects [`Port::DEFAULT`]; fails if `port` is an alias.
    pub fn set_default_port(&mut self, port: Port) -> Result<(), PortError> {
        self.dispatcher.set_default_port(port)
    }

    /// Redirects [`Port::DEBUG`]; fails if `port` is an alias.
    pub fn set_debug_port(&mut self, port: Port) -> Result<(), PortError> {
        self.dispatcher.set_debug_port(port)
    }

    /// Getter.
    pub fn identity(&self) -> Identity {
        self.dispatcher.identity()
    }

    /// Getter.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// The dispatcher, for sending.
    pub fn dispatcher(&mut self) -> &mut Dispatcher<'a> {
        &mut self.dispatcher
    }

    /// Getter.
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Mutable getter.
    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    /// Prints formatted text on the debug port.
    pub fn debug_message(&mut self, text: fmt::Arguments) -> Result<(), SendError> {
        self.dispatcher.debug_message(text)
    }

    /// Prints a hex dump on the debug port.
    pub fn debug_hex_dump(&mut self, data: &[u8]) -> Result<(), SendError> {
        self.dispatcher.debug_hex_dump(data)
    }

    /// Advances the timeout guard by one millisecond. Firmware sharing the guard usually ticks it from its own task.
    pub fn tick(&self) {
        self.guard.tick();
    }

    /// Polls the transports and processes what they delivered. Returns the number of packages processed.
    ///
    /// Endpoints (transport, sub-index) are visited round-robin, at most one package each per pass, until a pass
    /// yields nothing or [`MAX_PACKAGES_PER_PUMP`] packages have been processed. A transport reporting an abandoned
    /// stream triggers the timeout path and ends the call. Expired timeout guards are handled before returning.
    pub fn pump(&mut self) -> usize {
        let mut processed = 0;
        'pump: loop {
            let mut progress = false;
            for n in 0..self.dispatcher.transport_count() {
                for sub_index in 0..self.dispatcher.sub_ports(n) {
                    match self.dispatcher.receive(n, sub_index) {
                        Ok(Some((port, package))) => {
                            self.process(port, package);
                            processed += 1;
                            progress = true;
                            if processed >= MAX_PACKAGES_PER_PUMP {
                                trace!("Pump ceiling reached");
                                break 'pump;
                            }
                        }
                        Ok(None) => {}
                        Err((port, ReceiveError::Timeout)) => {
                            self.transport_timeout(port);
                            break 'pump;
                        }
                    }
                }
            }
            if !progress {
                break;
            }
        }
        self.check_timeout();
        processed
    }

    /// Processes `package` exactly as if it had been received on `port` (virtual ports, loopback).
    pub fn inject(&mut self, port: Port, package: Package) {
        self.process(port, package.with_cable(0));
    }

    /// Force-aborts streams whose guard expired.
    pub fn check_timeout(&mut self) {
        while let Some(port) = self.guard.take_expired() {
            warn!("SysEx stream from {} timed out", port);
            let event = self.reassembler.expire(port);
            self.abort_stream(port, event);
        }
    }

    fn process(&mut self, port: Port, package: Package) {
        match package.code_index() {
            CodeIndex::Miscellaneous | CodeIndex::CableEvent => {
                trace!("Ignoring reserved package {} from {}", package, port);
            }
            CodeIndex::SystemCommon2 | CodeIndex::SystemCommon3 => self.deliver(port, package),
            code_index if code_index.is_channel_voice() => self.deliver(port, package),
            CodeIndex::SingleByte if package.is_realtime() => self.deliver(port, package),
            _ => {
                let mut filtered = false;
                for &byte in package.payload() {
                    filtered |= self.sysex_byte(port, byte);
                }
                if !filtered {
                    self.deliver(port, package);
                }
            }
        }
    }

    fn deliver(&mut self, port: Port, package: Package) {
        self.hooks.package(port, package, &mut self.dispatcher);
    }

    /// Runs one byte through the guard, the application and the reassembler. Returns `true` if the application
    /// filtered it.
    fn sysex_byte(&mut self, port: Port, byte: u8) -> bool {
        match byte {
            SYSEX_START => self.guard.arm(port),
            0x00..=0x7f => self.guard.touch(port),
            0xf8..=0xff => {}
            _ => self.guard.release(port),
        }

        let filtered = self.hooks.sysex_byte(port, byte);
        let identity = self.dispatcher.identity();
        for event in self.reassembler.feed(port, byte, &identity).into_iter().flatten() {
            self.dispatch(event);
        }
        self.guard_open_streams();
        filtered
    }

    /// Arms a guard for every open stream no guard covers, e.g. a single stream restarted by another class whose
    /// previous owner has since released or lost the guard.
    fn guard_open_streams(&self) {
        for port in self.reassembler.open_streams() {
            if self.guard.owner(port).is_none() {
                trace!("Guarding stream from {}", port);
                self.guard.arm(port);
            }
        }
    }

    fn dispatch(&mut self, PortEvent { port, event }: PortEvent) {
        let mut reply = Reply::new(&mut self.dispatcher, port);
        match event {
            StreamEvent::Begin(command) => {
                if !self.protocol.begin(command, &mut reply) {
                    self.reassembler.discard(port);
                }
            }
            StreamEvent::Data(byte) => self.protocol.receive(byte, &mut reply, &mut self.hooks),
            StreamEvent::End { aborted } => {
                self.protocol
                    .end(aborted, &mut reply, &self.info, &mut self.hooks)
            }
        }
    }

    fn transport_timeout(&mut self, port: Port) {
        if self.guard.force(port) {
            info!("{} abandoned its SysEx stream", port);
            let event = self.reassembler.abort(port);
            self.abort_stream(port, event);
        } else {
            debug!("Ignoring timeout from {}: guard held by another port", port);
        }
    }

    /// Ends an aborted command, if any, and reports the reset for the port whose stream was lost.
    fn abort_stream(&mut self, port: Port, event: Option<PortEvent>) {
        let reset = event.map_or(port, |event| event.port);
        if let Some(event) = event {
            self.dispatch(event);
        }
        self.hooks.sysex_timeout(reset);
        self.guard_open_streams();
    }
}
