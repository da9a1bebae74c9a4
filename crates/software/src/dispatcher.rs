//! Provides the [`Dispatcher`], which owns the registered transports and moves [`Package`]s between them and the
//! rest of the engine.
//!
//! Sending resolves aliases, stamps the cable from the port's sub-index, consults the optional [`TxFilter`] and
//! forwards to the transport registered for the port's class. Receiving polls one (transport, sub-index) endpoint at
//! a time; the [engine](`crate::engine::Engine`) decides the polling order and fairness.

use crate::{
    configuration::Identity,
    package::{Package, SYSEX_END, SYSEX_START, SysexPackages},
    port::{Port, PortClass, PortError, PortMap},
    transport::{ReceiveError, Transport, TransportError},
};
use core::fmt;
use wmidi::MidiMessage;

/// Maximum number of transports a dispatcher can hold.
pub const MAX_TRANSPORTS: usize = 6;

/// Verdict of a [`TxFilter`] on an outgoing package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FilterResult {
    /// Hand the package to the transport.
    Forward,
    /// The filter consumed the package (monitored, rerouted or dropped); report success without sending.
    Filtered,
    /// The filter cannot take the package right now; the caller should retry.
    Retry,
    /// The filter rejected the package.
    Error,
}

/// Interception hook for every outgoing package.
///
/// Lets an application duplicate, monitor, reroute (e.g. to a [virtual](`PortClass::Virtual`) protocol adapter) or
/// drop packages without the dispatcher knowing about those policies. Any `FnMut(Port, Package) -> FilterResult`
/// closure is a `TxFilter`.
pub trait TxFilter {
    /// Inspects a package after alias resolution and cable stamping.
    fn filter(&mut self, port: Port, package: Package) -> FilterResult;
}

impl<F: FnMut(Port, Package) -> FilterResult> TxFilter for F {
    fn filter(&mut self, port: Port, package: Package) -> FilterResult {
        self(port, package)
    }
}

/// Why a package could not be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendError {
    /// No transport is registered for the port's class, the class is unknown, or the driver reports the
    /// sub-index unavailable.
    Unavailable,
    /// The transport or the Tx filter asked for a retry.
    WouldBlock,
    /// The Tx filter reported an error.
    Rejected,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => f.write_str("port unavailable"),
            Self::WouldBlock => f.write_str("port busy, retry"),
            Self::Rejected => f.write_str("package rejected by Tx filter"),
        }
    }
}

impl core::error::Error for SendError {}

impl From<TransportError> for SendError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::WouldBlock => Self::WouldBlock,
            TransportError::Unavailable => Self::Unavailable,
        }
    }
}

/// Why a transport or command could not be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegisterError {
    /// The registration table is full.
    Full,
    /// Something is already registered under the same key.
    Duplicate,
    /// The key is reserved (the alias class, or a built-in command id).
    Reserved,
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("registration table full"),
            Self::Duplicate => f.write_str("already registered"),
            Self::Reserved => f.write_str("reserved"),
        }
    }
}

impl core::error::Error for RegisterError {}

struct Endpoint<'a> {
    class: PortClass,
    transport: &'a mut dyn Transport,
}

/// Sends and receives packages over the registered transports.
pub struct Dispatcher<'a> {
    identity: Identity,
    ports: PortMap,
    transports: [Option<Endpoint<'a>>; MAX_TRANSPORTS],
    tx_filter: Option<&'a mut dyn TxFilter>,
}

impl<'a> Dispatcher<'a> {
    /// Constructs a [`Dispatcher`] with no transports.
    pub fn new(identity: Identity, ports: PortMap) -> Self {
        Self {
            identity,
            ports,
            transports: [const { None }; MAX_TRANSPORTS],
            tx_filter: None,
        }
    }

    /// Registers the transport serving `class`. Transports are polled in registration order.
    pub fn register_transport(
        &mut self,
        class: PortClass,
        transport: &'a mut dyn Transport,
    ) -> Result<(), RegisterError> {
        if class == PortClass::Alias {
            return Err(RegisterError::Reserved);
        }
        if self.endpoint_index(class).is_some() {
            return Err(RegisterError::Duplicate);
        }
        let slot = self
            .transports
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(RegisterError::Full)?;
        info!("Registered {} transport", class);
        *slot = Some(Endpoint { class, transport });
        Ok(())
    }

    /// Installs (or with `None`, removes) the Tx filter.
    pub fn set_tx_filter(&mut self, filter: Option<&'a mut dyn TxFilter>) {
        self.tx_filter = filter;
    }

    /// Getter.
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Sets this device's id, masked to 7 bits.
    pub fn set_device_id(&mut self, device_id: u8) {
        self.identity.set_device_id(device_id);
    }

    /// Getter.
    pub fn ports(&self) -> &PortMap {
        &self.ports
    }

    /// Redirects [`Port::DEFAULT`]; fails if `port` is an alias.
    pub fn set_default_port(&mut self, port: Port) -> Result<(), PortError> {
        self.ports.set_default_port(port)
    }

    /// Redirects [`Port::DEBUG`]; fails if `port` is an alias.
    pub fn set_debug_port(&mut self, port: Port) -> Result<(), PortError> {
        self.ports.set_debug_port(port)
    }

    /// Returns `true` if a transport serves the (resolved) port and reports it available.
    pub fn is_available(&self, port: Port) -> bool {
        let port = self.ports.resolve(port);
        port.class()
            .and_then(|class| self.endpoint_index(class))
            .and_then(|i| self.transports[i].as_ref())
            .is_some_and(|endpoint| endpoint.transport.is_available(port.index()))
    }

    /// Sends a package without waiting; [`SendError::WouldBlock`] means "try again".
    pub fn send_nonblocking(&mut self, port: Port, package: Package) -> Result<(), SendError> {
        let port = self.ports.resolve(port);
        let package = package.with_cable(port.index());

        if let Some(filter) = self.tx_filter.as_mut() {
            match filter.filter(port, package) {
                FilterResult::Forward => {}
                FilterResult::Filtered => return Ok(()),
                FilterResult::Retry => return Err(SendError::WouldBlock),
                FilterResult::Error => return Err(SendError::Rejected),
            }
        }

        let class = port.class().ok_or(SendError::Unavailable)?;
        let endpoint = self
            .endpoint_index(class)
            .and_then(|i| self.transports[i].as_mut())
            .ok_or(SendError::Unavailable)?;
        endpoint
            .transport
            .try_send(port.index(), package)
            .map_err(SendError::from)
    }

    /// Sends a package, retrying for as long as the transport (or the Tx filter) asks to.
    ///
    /// The retry spins in the caller. A transport whose queue is drained by a task on the caller's executor must not
    /// answer [`TransportError::WouldBlock`].
    pub fn send(&mut self, port: Port, package: Package) -> Result<(), SendError> {
        loop {
            match self.send_nonblocking(port, package) {
                Err(SendError::WouldBlock) => core::hint::spin_loop(),
                result => return result,
            }
        }
    }

    /// Sends a complete SysEx stream (including `0xF0` and `0xF7`), chunked into packages.
    pub fn send_sysex(&mut self, port: Port, stream: &[u8]) -> Result<(), SendError> {
        for package in SysexPackages::new(stream.iter().copied()) {
            self.send(port, package).inspect_err(|e| {
                warn!("SysEx to {} aborted: {}", port, e);
            })?;
        }
        Ok(())
    }

    /// Sends any MIDI message; SysEx messages are framed with `0xF0`/`0xF7` and chunked.
    pub fn send_message(&mut self, port: Port, message: &MidiMessage) -> Result<(), SendError> {
        match message {
            MidiMessage::SysEx(data) => {
                let stream = core::iter::once(SYSEX_START)
                    .chain(data.iter().map(|&byte| u8::from(byte)))
                    .chain(core::iter::once(SYSEX_END));
                for package in SysexPackages::new(stream) {
                    self.send(port, package)?;
                }
                Ok(())
            }
            _ => match Package::from_message(message) {
                Some(package) => self.send(port, package),
                None => Err(SendError::Rejected),
            },
        }
    }

    /// Number of registered transports.
    pub(crate) fn transport_count(&self) -> usize {
        self.transports.iter().filter(|slot| slot.is_some()).count()
    }

    /// Number of sub-indices to poll on the `n`th transport.
    pub(crate) fn sub_ports(&self, n: usize) -> u8 {
        self.transports[n]
            .as_ref()
            .map_or(0, |endpoint| endpoint.transport.sub_ports().min(Port::SUB_INDICES))
    }

    /// Pulls at most one package from the `n`th transport's `sub_index`. The cable is cleared; the returned
    /// [`Port`] carries the sub-index instead.
    pub(crate) fn receive(
        &mut self,
        n: usize,
        sub_index: u8,
    ) -> Result<Option<(Port, Package)>, (Port, ReceiveError)> {
        let Some(endpoint) = self.transports[n].as_mut() else {
            return Ok(None);
        };
        let port = Port::new(endpoint.class, sub_index);
        match endpoint.transport.try_receive(sub_index) {
            Ok(Some(package)) => Ok(Some((port, package.with_cable(0)))),
            Ok(None) => Ok(None),
            Err(e) => Err((port, e)),
        }
    }

    fn endpoint_index(&self, class: PortClass) -> Option<usize> {
        self.transports
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|endpoint| endpoint.class == class))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        package::CodeIndex,
        testing::{MockTransport, Wire},
    };
    use core::cell::RefCell;
    use wmidi::{Channel, Note, U7};

    const NOTE_ON: Package = Package::new(CodeIndex::NoteOn, [0x90, 60, 100]);

    fn dispatcher<'a>() -> Dispatcher<'a> {
        Dispatcher::new(Identity::default(), PortMap::default())
    }

    #[test]
    fn cable_is_stamped_from_sub_index() {
        let wire = RefCell::new(Wire::new(4));
        let mut usb = MockTransport::new(&wire);
        let mut dispatcher = dispatcher();
        dispatcher
            .register_transport(PortClass::Usb, &mut usb)
            .expect("first registration should succeed");

        assert_eq!(Ok(()), dispatcher.send(Port::usb(2), NOTE_ON));
        let wire = wire.borrow();
        assert_eq!(
            (2, NOTE_ON.with_cable(2)),
            wire.sent[0],
            "Expected left but got right"
        );
    }

    #[test]
    fn aliases_resolve_before_sending() {
        let wire = RefCell::new(Wire::new(1));
        let mut uart = MockTransport::new(&wire);
        let mut dispatcher = Dispatcher::new(
            Identity::default(),
            PortMap::new(Port::uart(0), Port::usb(0)).expect("valid aliases"),
        );
        dispatcher
            .register_transport(PortClass::Uart, &mut uart)
            .expect("first registration should succeed");

        assert_eq!(Ok(()), dispatcher.send(Port::DEFAULT, NOTE_ON));
        assert_eq!(
            Err(SendError::Unavailable),
            dispatcher.send(Port::DEBUG, NOTE_ON),
            "No USB transport is registered"
        );
        assert_eq!(1, wire.borrow().sent.len(), "Expected left but got right");
    }

    #[test]
    fn unknown_class_fails_immediately() {
        let mut dispatcher = dispatcher();
        assert_eq!(
            Err(SendError::Unavailable),
            dispatcher.send_nonblocking(Port::from_raw(0x70), NOTE_ON)
        );
    }

    #[test]
    fn registration_rules() {
        let wire = RefCell::new(Wire::new(1));
        let mut a = MockTransport::new(&wire);
        let mut b = MockTransport::new(&wire);
        let mut c = MockTransport::new(&wire);
        let mut dispatcher = dispatcher();
        assert_eq!(
            Err(RegisterError::Reserved),
            dispatcher.register_transport(PortClass::Alias, &mut a)
        );
        assert_eq!(Ok(()), dispatcher.register_transport(PortClass::Usb, &mut b));
        assert_eq!(
            Err(RegisterError::Duplicate),
            dispatcher.register_transport(PortClass::Usb, &mut c)
        );
        assert_eq!(1, dispatcher.transport_count(), "Expected left but got right");
    }

    #[test]
    fn tx_filter_verdicts() {
        let wire = RefCell::new(Wire::new(1));
        let mut usb = MockTransport::new(&wire);
        let mut seen = 0;
        let mut filter = |port: Port, package: Package| {
            seen += 1;
            match (port.class(), package.code_index()) {
                (Some(PortClass::Virtual), _) => FilterResult::Filtered,
                (_, CodeIndex::ProgramChange) => FilterResult::Error,
                _ => FilterResult::Forward,
            }
        };
        {
            let mut dispatcher = dispatcher();
            dispatcher
                .register_transport(PortClass::Usb, &mut usb)
                .expect("first registration should succeed");
            dispatcher.set_tx_filter(Some(&mut filter));

            assert_eq!(
                Ok(()),
                dispatcher.send(Port::virtual_port(0), NOTE_ON),
                "Filtered packages count as sent"
            );
            assert_eq!(
                Err(SendError::Rejected),
                dispatcher.send(
                    Port::usb(0),
                    Package::new(CodeIndex::ProgramChange, [0xc0, 1, 0])
                )
            );
            assert_eq!(Ok(()), dispatcher.send(Port::usb(0), NOTE_ON));
        }
        assert_eq!(3, seen, "Expected left but got right");
        assert_eq!(1, wire.borrow().sent.len(), "Only the forwarded package reaches the wire");
    }

    #[test]
    fn tx_filter_retry_surfaces_as_would_block() {
        let wire = RefCell::new(Wire::new(1));
        let mut usb = MockTransport::new(&wire);
        let mut filter = |_: Port, _: Package| FilterResult::Retry;
        let mut dispatcher = dispatcher();
        dispatcher
            .register_transport(PortClass::Usb, &mut usb)
            .expect("first registration should succeed");
        dispatcher.set_tx_filter(Some(&mut filter));
        assert_eq!(
            Err(SendError::WouldBlock),
            dispatcher.send_nonblocking(Port::usb(0), NOTE_ON)
        );
    }

    #[test]
    fn blocking_send_retries() {
        let wire = RefCell::new(Wire::new(1));
        wire.borrow_mut().busy_for = 3;
        let mut usb = MockTransport::new(&wire);
        let mut dispatcher = dispatcher();
        dispatcher
            .register_transport(PortClass::Usb, &mut usb)
            .expect("first registration should succeed");

        assert_eq!(
            Err(SendError::WouldBlock),
            dispatcher.send_nonblocking(Port::usb(0), NOTE_ON)
        );
        assert_eq!(Ok(()), dispatcher.send(Port::usb(0), NOTE_ON));
        assert_eq!(1, wire.borrow().sent.len(), "Expected left but got right");
    }

    #[test]
    fn availability() {
        let wire = RefCell::new(Wire::new(2));
        let mut usb = MockTransport::new(&wire);
        let mut dispatcher = dispatcher();
        dispatcher
            .register_transport(PortClass::Usb, &mut usb)
            .expect("first registration should succeed");
        assert!(dispatcher.is_available(Port::usb(1)));
        assert!(dispatcher.is_available(Port::DEFAULT));
        assert!(!dispatcher.is_available(Port::usb(2)));
        assert!(!dispatcher.is_available(Port::uart(0)));
    }

    #[test]
    fn send_message_chunks_sysex() {
        let wire = RefCell::new(Wire::new(1));
        let mut usb = MockTransport::new(&wire);
        let mut dispatcher = dispatcher();
        dispatcher
            .register_transport(PortClass::Usb, &mut usb)
            .expect("first registration should succeed");

        let data = [U7::from_u8_lossy(0x11), U7::from_u8_lossy(0x22)];
        assert_eq!(Ok(()), dispatcher.send_message(Port::usb(0), &MidiMessage::SysEx(&data)));
        assert_eq!(
            Ok(()),
            dispatcher.send_message(
                Port::usb(0),
                &MidiMessage::NoteOn(Channel::Ch1, Note::C4, U7::from_u8_lossy(100))
            )
        );

        let wire = wire.borrow();
        assert_eq!(
            &[0xf0, 0x11, 0x22, 0xf7][..],
            &wire.sysex_bytes()[..],
            "Expected left but got right"
        );
        assert_eq!((0, NOTE_ON), wire.sent[2], "Expected left but got right");
    }

    #[test]
    fn receive_clears_cable() {
        let wire = RefCell::new(Wire::new(2));
        wire.borrow_mut().push(1, NOTE_ON.with_cable(1));
        let mut usb = MockTransport::new(&wire);
        let mut dispatcher = dispatcher();
        dispatcher
            .register_transport(PortClass::Usb, &mut usb)
            .expect("first registration should succeed");

        assert_eq!(Ok(None), dispatcher.receive(0, 0));
        assert_eq!(Ok(Some((Port::usb(1), NOTE_ON))), dispatcher.receive(0, 1));
    }
}
