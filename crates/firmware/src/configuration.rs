//! Board-specific settings: what the device reports about itself and the size of its patch bank.

use courier_lib::configuration::{DeviceInfo, EngineConfig};
use embassy_stm32::{flash::FLASH_SIZE, uid};

/// Number of patches kept in RAM.
pub const PATCHES: usize = 8;

/// Bytes per patch.
pub const PATCH_LEN: usize = 32;

/// SRAM of the STM32F767ZI.
const RAM_SIZE: u32 = 512 * 1024;

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        info: device_info(),
        ..EngineConfig::default()
    }
}

fn device_info() -> DeviceInfo {
    let id = uid::uid();
    DeviceInfo {
        operating_system: "Courier/Embassy",
        board: "NUCLEO-F767ZI",
        core_family: "STM32F7",
        chip_id: u32::from_le_bytes([id[0], id[1], id[2], id[3]]),
        serial_number: uid::uid_hex(),
        flash_size: u32::try_from(FLASH_SIZE).unwrap_or(u32::MAX),
        ram_size: RAM_SIZE,
        boot_line1: "Courier MIDI controller",
        boot_line2: concat!("v", env!("CARGO_PKG_VERSION")),
    }
}
