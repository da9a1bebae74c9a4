//! What this firmware does with the traffic the engine hands it: activity logging, a small line-oriented terminal
//! reached through the Debug command, and resets on request.

use courier_lib::{dispatcher::Dispatcher, engine::Hooks, package::Package, port::Port};
use defmt::*;
use embassy_time::Instant;
use tinyvec::ArrayVec;
use wmidi::MidiMessage;

const LINE_LEN: usize = 64;

#[derive(Default)]
pub struct FirmwareHooks {
    line: ArrayVec<[u8; LINE_LEN]>,
}

impl FirmwareHooks {
    fn execute(&mut self, dispatcher: &mut Dispatcher<'_>) {
        let Ok(line) = core::str::from_utf8(&self.line) else {
            reply(dispatcher, format_args!("input is not UTF-8"));
            return;
        };
        match line.trim() {
            "help" => reply(dispatcher, format_args!("commands: help, id, ports, uptime, version")),
            "id" => {
                let id = dispatcher.identity().device_id();
                reply(dispatcher, format_args!("device id {:#04x}", id))
            }
            "ports" => {
                let ports = *dispatcher.ports();
                reply(
                    dispatcher,
                    format_args!("default {:?}, debug {:?}", ports.default_port(), ports.debug_port()),
                )
            }
            "uptime" => reply(dispatcher, format_args!("{} ms", Instant::now().as_millis())),
            "version" => reply(dispatcher, format_args!("{}", env!("CARGO_PKG_VERSION"))),
            "" => {}
            other => reply(dispatcher, format_args!("unknown command: {}", other)),
        }
    }
}

fn reply(dispatcher: &mut Dispatcher<'_>, text: core::fmt::Arguments) {
    if let Err(e) = dispatcher.debug_message(text) {
        warn!("Terminal reply failed: {}", e);
    }
}

impl Hooks for FirmwareHooks {
    fn package(&mut self, port: Port, package: Package, _dispatcher: &mut Dispatcher<'_>) {
        match package.message() {
            Some(MidiMessage::NoteOn(_, note, velocity)) => {
                info!("{}: note on {}, velocity {}", port, u8::from(note), u8::from(velocity))
            }
            Some(MidiMessage::NoteOff(_, note, _)) => info!("{}: note off {}", port, u8::from(note)),
            Some(message) => debug!("{}: {}", port, Debug2Format(&message)),
            None => trace!("{}: {}", port, package),
        }
    }

    fn debug_input(&mut self, _port: Port, byte: u8, dispatcher: &mut Dispatcher<'_>) {
        match byte {
            b'\r' | b'\n' => {
                self.execute(dispatcher);
                self.line.clear();
            }
            byte => {
                if self.line.try_push(byte).is_some() {
                    warn!("Terminal line longer than {} bytes, discarding", LINE_LEN);
                    self.line.clear();
                }
            }
        }
    }

    fn sysex_timeout(&mut self, port: Port) {
        warn!("SysEx stream from {} was reset", port);
    }

    fn reset_request(&mut self, port: Port) {
        info!("Reset requested by {}", port);
        cortex_m::peripheral::SCB::sys_reset();
    }
}
