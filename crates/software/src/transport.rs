//! The contract between the [dispatcher](`crate::dispatcher::Dispatcher`) and transport drivers.
//!
//! Drivers do the byte-level I/O (USB endpoints, UART framing and running status, IIC polling) and are registered
//! with the dispatcher per [`PortClass`](`crate::port::PortClass`). Neither direction may block: a driver that cannot
//! accept a package right now answers [`TransportError::WouldBlock`].

use crate::package::Package;
use core::fmt;

/// Why a driver refused to send a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// The outgoing buffer is full; try again later.
    WouldBlock,
    /// The sub-index does not exist or is not connected.
    Unavailable,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => f.write_str("transport buffer full"),
            Self::Unavailable => f.write_str("transport unavailable"),
        }
    }
}

impl core::error::Error for TransportError {}

/// Receive failures, as distinct from "no data".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReceiveError {
    /// The driver abandoned an incomplete package or stream (e.g. a stalled UART or a disconnected host).
    Timeout,
}

impl fmt::Display for ReceiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("incomplete package abandoned"),
        }
    }
}

impl core::error::Error for ReceiveError {}

/// Send/receive primitives of one transport class.
pub trait Transport {
    /// Number of sub-indices the dispatcher should poll, starting at 0.
    fn sub_ports(&self) -> u8 {
        1
    }

    /// Returns `true` if `sub_index` can currently send and receive.
    fn is_available(&self, sub_index: u8) -> bool {
        sub_index < self.sub_ports()
    }

    /// Hands a package to the driver without waiting. The cable has already been stamped with `sub_index`.
    fn try_send(&mut self, sub_index: u8, package: Package) -> Result<(), TransportError>;

    /// Takes one package for `sub_index` if any is pending.
    fn try_receive(&mut self, sub_index: u8) -> Result<Option<Package>, ReceiveError>;
}
