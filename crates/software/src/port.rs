//! Provides [`Port`], a flat numbering scheme unifying every transport into one logical value, and [`PortMap`],
//! which resolves the `default` and `debug` aliases to concrete ports at call time.
//!
//! The top nibble of a port selects the [`PortClass`]; the bottom nibble selects one of 16 sub-indices within
//! that class. Ports are plain values, not owned resources.

use core::fmt;
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

/// The kind of transport a [`Port`] addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortClass {
    /// Not a transport; the class of the `default` and `debug` aliases.
    Alias = 0x0,
    /// USB-MIDI; sub-indices correspond to cables.
    Usb = 0x1,
    /// Serial (DIN) MIDI.
    Uart = 0x2,
    /// MIDI over IIC.
    Iic = 0x3,
    /// Ports with no physical transport behind them, e.g. protocol adapters reached through the Tx filter.
    Virtual = 0xf,
}

/// A logical MIDI port. Defaults to [`Port::DEFAULT`].
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Port(u8);

impl Port {
    /// Redirects to whichever port is configured as the default.
    pub const DEFAULT: Port = Port(0x00);
    /// Redirects to whichever port is configured for debug output.
    pub const DEBUG: Port = Port(0x01);

    /// Number of sub-indices available within each [`PortClass`].
    pub const SUB_INDICES: u8 = 16;

    /// Constructs a port from its raw encoding.
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// Constructs a port from a class and a sub-index. The sub-index is truncated to 4 bits.
    pub const fn new(class: PortClass, index: u8) -> Self {
        Self(((class as u8) << 4) | (index & 0x0f))
    }

    /// USB-MIDI cable `index`.
    pub const fn usb(index: u8) -> Self {
        Self::new(PortClass::Usb, index)
    }

    /// Serial MIDI interface `index`.
    pub const fn uart(index: u8) -> Self {
        Self::new(PortClass::Uart, index)
    }

    /// IIC MIDI interface `index`.
    pub const fn iic(index: u8) -> Self {
        Self::new(PortClass::Iic, index)
    }

    /// Virtual port `index`.
    pub const fn virtual_port(index: u8) -> Self {
        Self::new(PortClass::Virtual, index)
    }

    /// The raw encoding.
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Returns the transport class, or `None` when the top nibble names a class this crate does not know.
    pub fn class(self) -> Option<PortClass> {
        PortClass::from_u8(self.0 >> 4)
    }

    /// Returns the sub-index within the class.
    pub const fn index(self) -> u8 {
        self.0 & 0x0f
    }

    /// Returns `true` for [`Port::DEFAULT`] and [`Port::DEBUG`].
    pub const fn is_alias(self) -> bool {
        self.0 == Self::DEFAULT.0 || self.0 == Self::DEBUG.0
    }

    /// Returns `true` if both ports belong to the same transport class.
    pub const fn same_class(self, other: Port) -> bool {
        self.0 >> 4 == other.0 >> 4
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.class(), *self) {
            (_, Port::DEFAULT) => f.write_str("Port(DEFAULT)"),
            (_, Port::DEBUG) => f.write_str("Port(DEBUG)"),
            (Some(class), port) => write!(f, "Port({:?}{})", class, port.index()),
            (None, port) => write!(f, "Port({:#04x})", port.0),
        }
    }
}

/// Pure bit-masking accessor; see [`Port::class`].
pub fn class_of(port: Port) -> Option<PortClass> {
    port.class()
}

/// Pure bit-masking accessor; see [`Port::index`].
pub fn index_of(port: Port) -> u8 {
    port.index()
}

/// Returned when an alias would be redirected to an alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortError {
    /// The `default` and `debug` aliases may only point at concrete ports.
    AliasRecursion,
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AliasRecursion => f.write_str("an alias cannot point at another alias"),
        }
    }
}

impl core::error::Error for PortError {}

/// Holds the concrete targets of the two aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PortMap {
    default_port: Port,
    debug_port: Port,
}

impl Default for PortMap {
    fn default() -> Self {
        Self {
            default_port: Port::usb(0),
            debug_port: Port::usb(0),
        }
    }
}

impl PortMap {
    /// Constructs a [`PortMap`]; fails if either target is itself an alias.
    pub fn new(default_port: Port, debug_port: Port) -> Result<Self, PortError> {
        let mut map = Self::default();
        map.set_default_port(default_port)?;
        map.set_debug_port(debug_port)?;
        Ok(map)
    }

    /// Rewrites the alias values to their configured concrete ports. Any other port is returned unchanged.
    pub fn resolve(&self, port: Port) -> Port {
        match port {
            Port::DEFAULT => self.default_port,
            Port::DEBUG => self.debug_port,
            concrete => concrete,
        }
    }

    /// Getter.
    pub fn default_port(&self) -> Port {
        self.default_port
    }

    /// Getter.
    pub fn debug_port(&self) -> Port {
        self.debug_port
    }

    /// Redirects [`Port::DEFAULT`].
    pub fn set_default_port(&mut self, port: Port) -> Result<(), PortError> {
        if port.is_alias() {
            return Err(PortError::AliasRecursion);
        }
        self.default_port = port;
        Ok(())
    }

    /// Redirects [`Port::DEBUG`].
    pub fn set_debug_port(&mut self, port: Port) -> Result<(), PortError> {
        if port.is_alias() {
            return Err(PortError::AliasRecursion);
        }
        self.debug_port = port;
        Ok(())
    }
}
