//! The debug channel: text printed by the device travels as Debug-output frames (`header id 0D 40 text F7`) to the
//! [debug port](`crate::port::Port::DEBUG`), so a host tool can show a device console over plain MIDI.

use crate::{
    configuration::Identity,
    dispatcher::{Dispatcher, SendError},
    port::Port,
    protocol::{DEBUG, DEBUG_OUTPUT, FrameWriter},
};
use core::fmt::{self, Write};

/// Bytes per row of [`Dispatcher::debug_hex_dump`].
pub const HEX_DUMP_ROW: usize = 16;

/// Streams formatted text into as many Debug-output frames as it takes.
struct DebugWriter<'r, 'a> {
    dispatcher: &'r mut Dispatcher<'a>,
    frame: FrameWriter,
    pending: bool,
    result: Result<(), SendError>,
}

impl<'r, 'a> DebugWriter<'r, 'a> {
    fn new(dispatcher: &'r mut Dispatcher<'a>) -> Self {
        let frame = output_frame(&dispatcher.identity());
        Self {
            dispatcher,
            frame,
            pending: false,
            result: Ok(()),
        }
    }

    fn flush(&mut self) {
        let frame = core::mem::replace(&mut self.frame, output_frame(&self.dispatcher.identity()));
        self.pending = false;
        if self.result.is_ok() {
            self.result = self.dispatcher.send_sysex(Port::DEBUG, &frame.finish());
        }
    }

    fn finish(mut self) -> Result<(), SendError> {
        if self.pending {
            self.flush();
        }
        self.result
    }
}

impl Write for DebugWriter<'_, '_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if self.frame.remaining() == 0 {
                self.flush();
            }
            self.frame.push(byte);
            self.pending = true;
        }
        self.result.map_err(|_| fmt::Error)
    }
}

fn output_frame(identity: &Identity) -> FrameWriter {
    let mut frame = FrameWriter::new(identity);
    frame.extend_from_slice(&[DEBUG, DEBUG_OUTPUT]);
    frame
}

impl Dispatcher<'_> {
    /// Prints formatted text on the debug port. Text longer than one frame is split across frames; bytes are
    /// masked to 7 bits. Nothing is sent for empty text.
    ///
    /// ```ignore
    /// dispatcher.debug_message(format_args!("patch {} loaded", patch))?;
    /// ```
    pub fn debug_message(&mut self, text: fmt::Arguments) -> Result<(), SendError> {
        let mut writer = DebugWriter::new(self);
        // a formatting error here can only mean a failed send, which `finish` reports
        let _ = writer.write_fmt(text);
        writer.finish()
    }

    /// Prints `data` on the debug port as rows of `AAAA: xx xx .. |ascii|`, one frame per row.
    pub fn debug_hex_dump(&mut self, data: &[u8]) -> Result<(), SendError> {
        for (row, chunk) in data.chunks(HEX_DUMP_ROW).enumerate() {
            let mut writer = DebugWriter::new(self);
            let _ = write_row(&mut writer, row * HEX_DUMP_ROW, chunk);
            writer.finish()?;
        }
        Ok(())
    }
}

fn write_row(w: &mut impl Write, offset: usize, chunk: &[u8]) -> fmt::Result {
    write!(w, "{:04X}:", offset)?;
    for byte in chunk {
        write!(w, " {:02X}", byte)?;
    }
    for _ in chunk.len()..HEX_DUMP_ROW {
        w.write_str("   ")?;
    }
    w.write_str(" |")?;
    for &byte in chunk {
        let c = if (0x20..0x7f).contains(&byte) {
            char::from(byte)
        } else {
            '.'
        };
        w.write_char(c)?;
    }
    w.write_char('|')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        port::{PortClass, PortMap},
        protocol::{MAX_FRAME, MAX_FRAME_PACKAGES, parse_frame},
        testing::{MockTransport, Wire},
    };
    use core::cell::RefCell;
    use tinyvec::ArrayVec;

    fn dispatcher<'a>(usb: &'a mut MockTransport<'_>) -> Dispatcher<'a> {
        let mut dispatcher = Dispatcher::new(
            Identity::default(),
            PortMap::new(Port::usb(0), Port::usb(1)).expect("valid aliases"),
        );
        dispatcher
            .register_transport(PortClass::Usb, usb)
            .expect("first registration should succeed");
        dispatcher
    }

    /// The text carried by each Debug-output frame sent.
    fn lines(wire: &Wire) -> ArrayVec<[ArrayVec<[u8; MAX_FRAME]>; 16]> {
        wire.frames()
            .iter()
            .map(|frame| {
                let (command, body) = parse_frame(&Identity::default(), frame).expect("valid frame");
                assert_eq!(DEBUG, command, "Expected left but got right");
                assert_eq!(Some(&DEBUG_OUTPUT), body.first(), "Expected left but got right");
                body[1..].iter().copied().collect()
            })
            .collect()
    }

    #[test]
    fn message_goes_to_debug_port() {
        let wire = RefCell::new(Wire::new(2));
        let mut usb = MockTransport::new(&wire);
        let mut dispatcher = dispatcher(&mut usb);
        assert_eq!(Ok(()), dispatcher.debug_message(format_args!("hello {}", 42)));

        let wire = wire.borrow();
        assert!(wire.sent.iter().all(|(sub, _)| *sub == 1), "Expected everything on the debug port");
        let lines = lines(&wire);
        assert_eq!(1, lines.len(), "Expected left but got right");
        assert_eq!(b"hello 42", &lines[0][..], "Expected left but got right");
    }

    #[test]
    fn long_message_is_split() {
        let wire = RefCell::new(Wire::new(2));
        let mut usb = MockTransport::new(&wire);
        let mut dispatcher = dispatcher(&mut usb);
        let text = [b'x'; 200];
        let text = core::str::from_utf8(&text).expect("ASCII");
        assert_eq!(Ok(()), dispatcher.debug_message(format_args!("{}", text)));

        let lines = lines(&wire.borrow());
        assert_eq!(2, lines.len(), "Expected left but got right");
        assert_eq!(200, lines[0].len() + lines[1].len(), "No text may be lost");
        assert!(
            wire.borrow().frames().iter().all(|f| f.len() <= MAX_FRAME),
            "Expected every frame to fit"
        );
    }

    #[test]
    fn full_frame_fits_package_budget() {
        let wire = RefCell::new(Wire::new(2));
        let mut usb = MockTransport::new(&wire);
        let mut dispatcher = dispatcher(&mut usb);
        let text = [b'x'; 300];
        let text = core::str::from_utf8(&text).expect("ASCII");
        assert_eq!(Ok(()), dispatcher.debug_message(format_args!("{}", text)));

        let wire = wire.borrow();
        let frames = wire.frames();
        assert_eq!(MAX_FRAME, frames[0].len(), "Expected the first frame to be full");
        let first = wire
            .sent
            .iter()
            .position(|(_, package)| package.payload().contains(&0xf7))
            .map(|i| i + 1);
        assert_eq!(Some(MAX_FRAME_PACKAGES), first, "Expected left but got right");
        assert!(
            wire.sent.len() <= frames.len() * MAX_FRAME_PACKAGES,
            "No frame may exceed the package budget"
        );
    }

    #[test]
    fn empty_message_sends_nothing() {
        let wire = RefCell::new(Wire::new(2));
        let mut usb = MockTransport::new(&wire);
        let mut dispatcher = dispatcher(&mut usb);
        assert_eq!(Ok(()), dispatcher.debug_message(format_args!("")));
        assert!(wire.borrow().sent.is_empty(), "Expected nothing on the wire");
    }

    #[test]
    fn unavailable_debug_port_is_reported() {
        let wire = RefCell::new(Wire::new(1));
        let mut usb = MockTransport::new(&wire);
        let mut dispatcher = dispatcher(&mut usb);
        assert_eq!(
            Err(SendError::Unavailable),
            dispatcher.debug_message(format_args!("lost"))
        );
    }

    #[test]
    fn hex_dump_rows() {
        let wire = RefCell::new(Wire::new(2));
        let mut usb = MockTransport::new(&wire);
        let mut dispatcher = dispatcher(&mut usb);
        assert_eq!(Ok(()), dispatcher.debug_hex_dump(b"0123456789abcdefXYZ"));

        let lines = lines(&wire.borrow());
        assert_eq!(2, lines.len(), "Expected one frame per row");
        assert_eq!(
            &b"0000: 30 31 32 33 34 35 36 37 38 39 61 62 63 64 65 66 |0123456789abcdef|"[..],
            &lines[0][..],
            "Expected left but got right"
        );
        assert!(lines[1].starts_with(b"0010: 58 59 5A    "), "Expected short row padded");
        assert!(lines[1].ends_with(b"    |XYZ|"), "Expected left but got right");
        assert_eq!(lines[0].len() - 13, lines[1].len(), "Columns should line up");
    }
}
