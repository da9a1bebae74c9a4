//! This module contains the process-wide settings of the engine: device identity, alias targets, the SysEx stream
//! strategy and the data answered by the Query command.

use crate::port::Port;
use embassy_time::Duration;
use num_derive::{FromPrimitive, ToPrimitive};

/// Number of bytes in the protocol header, including the leading `0xF0`.
pub const HEADER_LEN: usize = 5;

/// The header every frame of this protocol starts with.
pub const DEFAULT_HEADER: [u8; HEADER_LEN] = [0xf0, 0x00, 0x00, 0x7e, 0x48];

/// How long a SysEx stream may stall before it is force-aborted.
pub const SYSEX_TIMEOUT: Duration = Duration::from_millis(1000);

/// Determines how many SysEx streams are tracked at once.
///
/// Tracking a single stream keeps memory and CPU cost minimal, at the price that a second, concurrent stream cannot be
/// guarded while the first one is open. Routers and other devices that receive SysEx on several ports at once may opt
/// into [`StreamStrategy::PerPortStream`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ToPrimitive, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StreamStrategy {
    /// One stream process-wide. The first port to start a stream owns the timeout guard until its stream ends or
    /// expires; the header matcher follows whichever port most recently sent `0xF0`.
    #[default]
    SingleStream,
    /// Header matching and timeouts are tracked per port, for up to [`MAX_STREAMS`] ports at a time. Only one
    /// stream may drive a command at a time.
    PerPortStream,
}

/// Capacity of the per-port stream tables.
pub const MAX_STREAMS: usize = 4;

/// Who this device is on the wire: the protocol header plus the 7-bit device id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Identity {
    header: [u8; HEADER_LEN],
    device_id: u8,
}

impl Default for Identity {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER, 0)
    }
}

impl Identity {
    /// Constructs an [`Identity`]. The device id is masked to 7 bits.
    pub const fn new(header: [u8; HEADER_LEN], device_id: u8) -> Self {
        Self {
            header,
            device_id: device_id & 0x7f,
        }
    }

    /// Getter.
    pub fn header(&self) -> &[u8; HEADER_LEN] {
        &self.header
    }

    /// Getter.
    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    /// Sets the device id, masked to 7 bits.
    pub fn set_device_id(&mut self, device_id: u8) {
        self.device_id = device_id & 0x7f;
    }
}

/// Identification answered by the Query command, one entry per sub-query selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceInfo {
    /// Selector `0x01`.
    pub operating_system: &'static str,
    /// Selector `0x02`.
    pub board: &'static str,
    /// Selector `0x03`.
    pub core_family: &'static str,
    /// Selector `0x04`; answered as eight hex digits.
    pub chip_id: u32,
    /// Selector `0x05`.
    pub serial_number: &'static str,
    /// Selector `0x06`, in bytes; answered in decimal.
    pub flash_size: u32,
    /// Selector `0x07`, in bytes; answered in decimal.
    pub ram_size: u32,
    /// Selector `0x08`: first boot message line (application name).
    pub boot_line1: &'static str,
    /// Selector `0x09`: second boot message line.
    pub boot_line2: &'static str,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            operating_system: "Courier",
            board: "unknown",
            core_family: "unknown",
            chip_id: 0,
            serial_number: "000000000000",
            flash_size: 0,
            ram_size: 0,
            boot_line1: "Courier",
            boot_line2: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Everything needed to construct an [`Engine`](`crate::engine::Engine`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EngineConfig {
    /// Header and device id.
    pub identity: Identity,
    /// Target of [`Port::DEFAULT`]. Must not be an alias.
    pub default_port: Port,
    /// Target of [`Port::DEBUG`]. Must not be an alias.
    pub debug_port: Port,
    /// Query answers.
    pub info: DeviceInfo,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            identity: Identity::default(),
            default_port: Port::usb(0),
            debug_port: Port::usb(0),
            info: DeviceInfo::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_masked() {
        let mut identity = Identity::new(DEFAULT_HEADER, 0x85);
        assert_eq!(0x05, identity.device_id(), "Expected left but got right");
        identity.set_device_id(0xff);
        assert_eq!(0x7f, identity.device_id(), "Expected left but got right");
    }

    #[test]
    fn default_strategy_tracks_one_stream() {
        assert_eq!(StreamStrategy::SingleStream, StreamStrategy::default());
    }

    #[test]
    fn strategy_from_stored_value() {
        use num_traits::FromPrimitive;
        assert_eq!(Some(StreamStrategy::PerPortStream), StreamStrategy::from_u8(1));
        assert_eq!(None, StreamStrategy::from_u8(2), "Expected left but got right");
    }

    #[test]
    fn default_config_points_aliases_at_usb() {
        let config = EngineConfig::default();
        assert_eq!(Port::usb(0), config.default_port, "Expected left but got right");
        assert_eq!(Port::usb(0), config.debug_port, "Expected left but got right");
        assert_eq!(0, config.identity.device_id(), "Expected left but got right");
    }
}
