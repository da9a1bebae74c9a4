//! Courier is [Embassy](https://embassy.dev)-based firmware exposing the Courier MIDI engine over USB on the
//! [Nucleo-F767ZI development board](https://www.st.com/en/evaluation-tools/nucleo-f767zi.html).
//!
//! The board enumerates as a USB-MIDI device and answers the Courier SysEx protocol: device queries, pings, a debug
//! terminal, and patch reads and writes against a RAM bank. Everything else it receives is logged.
//!
//! Tasks:
//! - `usb_task` runs the USB device; `usb_rx_task` and `usb_tx_task` move packets between the endpoints and the
//!   [`UsbTransport`] queues.
//! - `engine_task` owns the [`Engine`] and pumps it.
//! - `tick_task` advances the SysEx timeout guard every millisecond.

#![no_std]
#![no_main]

mod configuration;
mod hooks;
mod usb;

use crate::{
    configuration::{PATCH_LEN, PATCHES},
    hooks::FirmwareHooks,
    usb::{UsbDriver, UsbTransport},
};
use courier_lib::{
    configuration::{SYSEX_TIMEOUT, StreamStrategy},
    engine::{Engine, MAX_PACKAGES_PER_PUMP},
    port::PortClass,
    protocol::patch::PatchTransfer,
    sysex::TimeoutGuard,
};
use defmt::*;
use embassy_executor::Spawner;
use embassy_stm32::{Config, bind_interrupts, peripherals, time::Hertz};
use embassy_time::{Duration, Ticker, Timer};
use embassy_usb::{
    Builder, UsbDevice,
    class::midi::{MidiClass, Receiver, Sender},
};
use static_cell::StaticCell;

#[cfg(feature = "defmt-rtt")]
use defmt_rtt as _;
#[cfg(not(feature = "panic-probe"))]
use panic_halt as _;
#[cfg(feature = "panic-probe")]
use panic_probe as _;

bind_interrupts!(
    #[doc(hidden)]
    struct Irqs {
        OTG_FS => embassy_stm32::usb::InterruptHandler<peripherals::USB_OTG_FS>;
    }
);

/// Shared by the engine (which arms and checks it) and the tick task (which only counts).
static GUARD: TimeoutGuard = TimeoutGuard::new(StreamStrategy::SingleStream, SYSEX_TIMEOUT);

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("Initializing Courier");

    let mut config = Config::default();
    {
        use embassy_stm32::rcc::*;
        // hse: high-speed external clock
        config.rcc.hse = Some(Hse {
            freq: Hertz(8_000_000),
            mode: HseMode::Bypass,
        });

        config.rcc.pll_src = PllSource::HSE;
        config.rcc.pll = Some(Pll {
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL216,
            divp: Some(PllPDiv::DIV2), // 8mhz / 4 * 216 / 2 = 216Mhz
            // USB OTG FS needs 48MHz from the main PLL's Q output (RM0410, section 5.2)
            divq: Some(PllQDiv::DIV9), // 8mhz / 4 * 216 / 9 = 48Mhz
            divr: None,
        });
        config.rcc.ahb_pre = AHBPrescaler::DIV1;
        config.rcc.apb1_pre = APBPrescaler::DIV4;
        config.rcc.apb2_pre = APBPrescaler::DIV2;
        config.rcc.sys = Sysclk::PLL1_P;
        config.rcc.mux.clk48sel = mux::Clk48sel::PLL1_Q;
    }
    let p = embassy_stm32::init(config);

    static ENDPOINT_OUT_BUFFER: StaticCell<[u8; 256]> = StaticCell::new();
    let mut config = embassy_stm32::usb::Config::default();

    // the board is self-powered (CN13 cannot power it, see UM1974 section 6.10), so VBUS must be sensed
    config.vbus_detection = true;

    let driver = embassy_stm32::usb::Driver::new_fs(
        p.USB_OTG_FS,
        Irqs,
        p.PA12,
        p.PA11,
        ENDPOINT_OUT_BUFFER.init([0; 256]),
        config,
    );

    // pid.codes test VID/PID
    let mut config = embassy_usb::Config::new(0x1209, 0x0001);
    config.manufacturer = Some("Pawpaw Works");
    config.product = Some("Courier");
    config.serial_number = Some(embassy_stm32::uid::uid_hex());
    config.self_powered = true;
    config.max_power = 0;

    static CONFIG_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
    static BOS_DESCRIPTOR: StaticCell<[u8; 256]> = StaticCell::new();
    static CONTROL_BUFFER: StaticCell<[u8; 64]> = StaticCell::new();

    let mut builder = Builder::new(
        driver,
        config,
        CONFIG_DESCRIPTOR.init([0; 256]),
        BOS_DESCRIPTOR.init([0; 256]),
        &mut [], // no msos descriptors
        CONTROL_BUFFER.init([0; 64]),
    );

    let class = MidiClass::new(&mut builder, usb::CABLES, usb::CABLES, 64);
    let usb = builder.build();
    let (sender, receiver) = class.split();

    unwrap!(spawner.spawn(usb_task(usb)));
    unwrap!(spawner.spawn(usb_rx_task(receiver)));
    unwrap!(spawner.spawn(usb_tx_task(sender)));
    unwrap!(spawner.spawn(tick_task()));
    unwrap!(spawner.spawn(engine_task()));
}

#[embassy_executor::task]
async fn usb_task(mut usb: UsbDevice<'static, UsbDriver>) -> ! {
    usb.run().await
}

#[embassy_executor::task]
async fn usb_rx_task(mut receiver: Receiver<'static, UsbDriver>) -> ! {
    loop {
        receiver.wait_connection().await;
        info!("USB connected");
        usb::connected();
        let _ = usb::receive(&mut receiver).await;
        info!("USB disconnected");
        usb::disconnected();
    }
}

#[embassy_executor::task]
async fn usb_tx_task(mut sender: Sender<'static, UsbDriver>) -> ! {
    loop {
        sender.wait_connection().await;
        let _ = usb::transmit(&mut sender).await;
    }
}

#[embassy_executor::task]
async fn tick_task() -> ! {
    let mut ticker = Ticker::every(Duration::from_millis(1));
    loop {
        ticker.next().await;
        GUARD.tick();
    }
}

/// Owns the engine and everything registered with it.
#[embassy_executor::task]
async fn engine_task() -> ! {
    let mut usb = UsbTransport;
    let mut patches = PatchTransfer::<_, PATCH_LEN>::new([[0_u8; PATCH_LEN]; PATCHES]);

    let mut engine = unwrap!(Engine::new(
        configuration::engine_config(),
        &GUARD,
        FirmwareHooks::default()
    ));
    unwrap!(engine.register_transport(PortClass::Usb, &mut usb));
    unwrap!(engine.register_command(&mut patches));

    let info = engine.info();
    info!("{} {}", info.boot_line1, info.boot_line2);

    loop {
        // a full pump means more is probably waiting; let other tasks run, then come straight back
        if engine.pump() == MAX_PACKAGES_PER_PUMP {
            embassy_futures::yield_now().await;
        } else {
            Timer::after_millis(1).await;
        }
    }
}
