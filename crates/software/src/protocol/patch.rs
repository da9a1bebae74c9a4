//! Patch transfer: reading and writing fixed-size parameter sets over the SysEx protocol.
//!
//! - Read (`0x01`): body `patch`. Answered with the patch in write format.
//! - Write (`0x02`): body `patch data[N] checksum`, the checksum covering `patch` and `data`. Answered with an ACK
//!   whose argument is the patch number.
//!
//! Length, checksum and storage are all checked before anything is written; failures are answered with a DISACK.

use super::{Command, DisackReason, Reply, checksum};
use core::fmt;

/// Command id of a patch read request.
pub const READ: u8 = 0x01;
/// Command id of a patch write (and of the dump answering a read).
pub const WRITE: u8 = 0x02;

/// The addressed patch slot does not exist or cannot be accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StorageUnavailable;

impl fmt::Display for StorageUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("patch storage unavailable")
    }
}

impl core::error::Error for StorageUnavailable {}

/// Backing storage for patches (RAM, flash, EEPROM).
pub trait PatchStore {
    /// Fills `data` with the contents of `patch`.
    fn read(&mut self, patch: u8, data: &mut [u8]) -> Result<(), StorageUnavailable>;

    /// Replaces the contents of `patch` with `data`.
    fn write(&mut self, patch: u8, data: &[u8]) -> Result<(), StorageUnavailable>;
}

/// A RAM bank of `P` patches of `N` bytes each.
impl<const N: usize, const P: usize> PatchStore for [[u8; N]; P] {
    fn read(&mut self, patch: u8, data: &mut [u8]) -> Result<(), StorageUnavailable> {
        let stored = self.get(usize::from(patch)).ok_or(StorageUnavailable)?;
        data.get_mut(..N)
            .ok_or(StorageUnavailable)?
            .copy_from_slice(stored);
        Ok(())
    }

    fn write(&mut self, patch: u8, data: &[u8]) -> Result<(), StorageUnavailable> {
        let stored = self.get_mut(usize::from(patch)).ok_or(StorageUnavailable)?;
        stored.copy_from_slice(data.get(..N).ok_or(StorageUnavailable)?);
        Ok(())
    }
}

/// The patch read/write [`Command`] for patches of `N` bytes.
///
/// A dump answering a read must fit one frame, so `N` should stay below 118.
pub struct PatchTransfer<S, const N: usize> {
    store: S,
    command: Option<u8>,
    patch: u8,
    data: [u8; N],
    checksum: u8,
    received: usize,
}

impl<S: PatchStore, const N: usize> PatchTransfer<S, N> {
    /// Constructs a [`PatchTransfer`] backed by `store`.
    pub fn new(store: S) -> Self {
        Self {
            store,
            command: None,
            patch: 0,
            data: [0; N],
            checksum: 0,
            received: 0,
        }
    }

    /// Getter.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mutable getter.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    fn read(&mut self, reply: &mut Reply<'_, '_>) {
        let mut data = [0; N];
        if self.store.read(self.patch, &mut data).is_err() {
            reply.disack(DisackReason::StorageUnavailable);
            return;
        }
        let mut frame = reply.frame();
        frame.extend_from_slice(&[WRITE, self.patch]);
        frame.extend_from_slice(&data);
        frame.push(checksum(core::iter::once(&self.patch).chain(&data)));
        if frame.is_truncated() {
            warn!("Patch dump of {} bytes does not fit a frame", N);
        }
        reply.send(frame);
    }

    fn write(&mut self, reply: &mut Reply<'_, '_>) {
        if checksum(core::iter::once(&self.patch).chain(&self.data)) != self.checksum {
            reply.disack(DisackReason::WrongChecksum);
            return;
        }
        match self.store.write(self.patch, &self.data) {
            Ok(()) => {
                info!("Patch {} written from {}", self.patch, reply.port());
                reply.ack(self.patch);
            }
            Err(_) => {
                reply.disack(DisackReason::StorageUnavailable);
            }
        }
    }
}

impl<S: PatchStore, const N: usize> Command for PatchTransfer<S, N> {
    fn handles(&self, command: u8) -> bool {
        matches!(command, READ | WRITE)
    }

    fn begin(&mut self, command: u8, _reply: &mut Reply<'_, '_>) {
        self.command = Some(command);
        self.received = 0;
    }

    fn receive(&mut self, byte: u8, _reply: &mut Reply<'_, '_>) {
        match self.received {
            0 => self.patch = byte,
            n if n <= N => self.data[n - 1] = byte,
            n if n == N + 1 => self.checksum = byte,
            _ => {}
        }
        self.received = self.received.saturating_add(1);
    }

    fn end(&mut self, aborted: bool, reply: &mut Reply<'_, '_>) {
        let Some(command) = self.command.take() else {
            return;
        };
        if aborted {
            return;
        }
        let expected = if command == READ { 1 } else { N + 2 };
        if self.received < expected {
            reply.disack(DisackReason::LessBytesThanExpected);
        } else if self.received > expected {
            reply.disack(DisackReason::MoreBytesThanExpected);
        } else if command == READ {
            self.read(reply);
        } else {
            self.write(reply);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configuration::Identity,
        dispatcher::Dispatcher,
        port::{Port, PortClass, PortMap},
        protocol::{ACK, DISACK, parse_frame},
        testing::{MockTransport, Wire},
    };
    use core::cell::RefCell;

    type Bank = [[u8; 4]; 2];

    fn run(
        transfer: &mut PatchTransfer<Bank, 4>,
        command: u8,
        body: &[u8],
        aborted: bool,
    ) -> Option<(u8, [u8; 8], usize)> {
        let wire = RefCell::new(Wire::new(1));
        let mut usb = MockTransport::new(&wire);
        let mut dispatcher = Dispatcher::new(Identity::default(), PortMap::default());
        dispatcher
            .register_transport(PortClass::Usb, &mut usb)
            .expect("first registration should succeed");

        let mut reply = Reply::new(&mut dispatcher, Port::usb(0));
        transfer.begin(command, &mut reply);
        body.iter().for_each(|&b| transfer.receive(b, &mut reply));
        transfer.end(aborted, &mut reply);

        let wire = wire.borrow();
        let frames = wire.frames();
        assert!(frames.len() <= 1, "Expected at most one reply");
        frames.first().map(|frame| {
            let (code, body) = parse_frame(&Identity::default(), frame).expect("reply should be a valid frame");
            let mut copy = [0; 8];
            copy[..body.len()].copy_from_slice(body);
            (code, copy, body.len())
        })
    }

    fn write_body(patch: u8, data: [u8; 4]) -> [u8; 6] {
        let sum = checksum(core::iter::once(&patch).chain(&data));
        [patch, data[0], data[1], data[2], data[3], sum]
    }

    #[test]
    fn write_then_read() {
        let mut transfer = PatchTransfer::<Bank, 4>::new([[0; 4]; 2]);
        let body = write_body(1, [0x10, 0x20, 0x30, 0x7f]);

        let (code, args, len) = run(&mut transfer, WRITE, &body, false).expect("Expected a reply");
        assert_eq!((ACK, 1, 1), (code, args[0], len), "Write ACK carries the patch number");
        assert_eq!([0x10, 0x20, 0x30, 0x7f], transfer.store()[1], "Expected left but got right");

        let (code, dump, len) = run(&mut transfer, READ, &[1], false).expect("Expected a reply");
        assert_eq!(WRITE, code, "A read is answered in write format");
        assert_eq!(&body[..], &dump[..len], "Expected left but got right");
    }

    #[test]
    fn write_validation() {
        let mut transfer = PatchTransfer::<Bank, 4>::new([[0; 4]; 2]);
        let body = write_body(0, [1, 2, 3, 4]);
        let reason = |r: DisackReason| Some((DISACK, r as u8));
        let first = |reply: Option<(u8, [u8; 8], usize)>| reply.map(|(code, args, _)| (code, args[0]));

        assert_eq!(
            reason(DisackReason::LessBytesThanExpected),
            first(run(&mut transfer, WRITE, &body[..5], false))
        );
        assert_eq!(
            reason(DisackReason::MoreBytesThanExpected),
            first(run(&mut transfer, WRITE, &[0, 1, 2, 3, 4, 0x76, 0x00], false))
        );

        let mut corrupt = body;
        corrupt[5] ^= 0x01;
        assert_eq!(
            reason(DisackReason::WrongChecksum),
            first(run(&mut transfer, WRITE, &corrupt, false))
        );
        assert_eq!(
            reason(DisackReason::StorageUnavailable),
            first(run(&mut transfer, WRITE, &write_body(5, [1, 2, 3, 4]), false))
        );
        assert_eq!([[0; 4]; 2], *transfer.store(), "Nothing should have been written");
    }

    #[test]
    fn read_of_missing_patch_is_refused() {
        let mut transfer = PatchTransfer::<Bank, 4>::new([[0; 4]; 2]);
        assert_eq!(
            Some((DISACK, DisackReason::StorageUnavailable as u8)),
            run(&mut transfer, READ, &[2], false).map(|(code, args, _)| (code, args[0]))
        );
    }

    #[test]
    fn aborted_write_is_not_committed() {
        let mut transfer = PatchTransfer::<Bank, 4>::new([[0; 4]; 2]);
        let body = write_body(0, [1, 2, 3, 4]);
        assert_eq!(None, run(&mut transfer, WRITE, &body, true), "Expected no reply");
        assert_eq!([0; 4], transfer.store()[0], "Expected left but got right");
    }
}
