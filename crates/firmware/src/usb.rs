//! The USB-MIDI transport.
//!
//! Two tasks move raw 4-byte event packets between the USB endpoints and a pair of channels; [`UsbTransport`] is the
//! engine's non-blocking view of those channels.

use core::sync::atomic::{AtomicBool, Ordering};
use courier_lib::{
    package::Package,
    protocol::MAX_FRAME_PACKAGES,
    transport::{ReceiveError, Transport, TransportError},
};
use defmt::*;
use embassy_stm32::{peripherals, usb};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use embassy_usb::{
    class::midi::{Receiver, Sender},
    driver::EndpointError,
};

pub type UsbDriver = usb::Driver<'static, peripherals::USB_OTG_FS>;

/// Virtual cables (jacks) offered to the host.
pub const CABLES: u8 = 1;

const INBOUND_DEPTH: usize = 32;
/// Room for a burst of full frames sent within one pump.
const OUTBOUND_DEPTH: usize = 4 * MAX_FRAME_PACKAGES;
const MAX_PACKET_SIZE: usize = 64;

enum Inbound {
    Package(Package),
    /// The host went away, possibly in the middle of a stream.
    Abandoned,
}

static INBOUND: Channel<CriticalSectionRawMutex, Inbound, INBOUND_DEPTH> = Channel::new();
static OUTBOUND: Channel<CriticalSectionRawMutex, Package, OUTBOUND_DEPTH> = Channel::new();
static CONNECTED: AtomicBool = AtomicBool::new(false);

/// The engine side of the USB-MIDI interface.
pub struct UsbTransport;

impl Transport for UsbTransport {
    fn sub_ports(&self) -> u8 {
        CABLES
    }

    fn is_available(&self, sub_index: u8) -> bool {
        sub_index < CABLES && CONNECTED.load(Ordering::Relaxed)
    }

    /// Never answers [`TransportError::WouldBlock`]; the draining task shares the engine's executor. A full queue
    /// drops the package.
    fn try_send(&mut self, sub_index: u8, package: Package) -> Result<(), TransportError> {
        if !self.is_available(sub_index) {
            return Err(TransportError::Unavailable);
        }
        OUTBOUND.try_send(package).map_err(|_| {
            warn!("USB outbound queue full, dropping output");
            TransportError::Unavailable
        })
    }

    fn try_receive(&mut self, sub_index: u8) -> Result<Option<Package>, ReceiveError> {
        // every cable shares the one queue, and the rx task drops cables beyond `CABLES`
        if sub_index != 0 {
            return Ok(None);
        }
        match INBOUND.try_receive() {
            Ok(Inbound::Package(package)) => Ok(Some(package)),
            Ok(Inbound::Abandoned) => Err(ReceiveError::Timeout),
            Err(_) => Ok(None),
        }
    }
}

#[doc(hidden)]
pub struct Disconnected {}

impl From<EndpointError> for Disconnected {
    fn from(val: EndpointError) -> Self {
        if let EndpointError::BufferOverflow = val {
            error!("USB buffer overflow");
        }
        Disconnected {}
    }
}

pub fn connected() {
    CONNECTED.store(true, Ordering::Relaxed);
}

/// Drops queued output and tells the engine any open stream is gone.
pub fn disconnected() {
    CONNECTED.store(false, Ordering::Relaxed);
    OUTBOUND.clear();
    if INBOUND.try_send(Inbound::Abandoned).is_err() {
        warn!("Inbound queue full, engine not told about the disconnect");
    }
}

/// Forwards packets from the host until it disconnects.
pub async fn receive(receiver: &mut Receiver<'static, UsbDriver>) -> Result<(), Disconnected> {
    let mut buf = [0; MAX_PACKET_SIZE];
    loop {
        let n = receiver.read_packet(&mut buf).await?;
        for chunk in buf[..n].chunks_exact(4) {
            let &[header, b0, b1, b2] = chunk else {
                continue;
            };
            let package = Package::from_bytes([header, b0, b1, b2]);
            if package.cable() >= CABLES {
                trace!("Dropping package for cable {}", package.cable());
                continue;
            }
            INBOUND.send(Inbound::Package(package)).await;
        }
    }
}

/// Sends queued packages to the host, batching whatever is waiting into one packet.
pub async fn transmit(sender: &mut Sender<'static, UsbDriver>) -> Result<(), Disconnected> {
    let mut buf = [0; MAX_PACKET_SIZE];
    loop {
        let package = OUTBOUND.receive().await;
        buf[..4].copy_from_slice(&package.to_bytes());
        let mut n = 4;
        while n < buf.len() {
            let Ok(package) = OUTBOUND.try_receive() else {
                break;
            };
            buf[n..n + 4].copy_from_slice(&package.to_bytes());
            n += 4;
        }
        sender.write_packet(&buf[..n]).await?;
    }
}
