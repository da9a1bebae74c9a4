//! Provides [`TimeoutGuard`], the stall detector shared by the receive path and the millisecond tick.
//!
//! The tick and the receive path usually run in different tasks (or the tick in a timer interrupt). Every
//! read-modify-write of the counters happens inside a short critical section; the lock is never held across a
//! transport call, and the tick does nothing but count. Expired streams are collected by the receive path through
//! [`TimeoutGuard::take_expired`].

use crate::{
    configuration::{MAX_STREAMS, StreamStrategy},
    port::Port,
};
use core::cell::RefCell;
use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};
use embassy_time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    owner: Option<Port>,
    elapsed_ms: u32,
}

impl Slot {
    const IDLE: Slot = Slot {
        owner: None,
        elapsed_ms: 0,
    };
}

/// Detects SysEx streams that stopped arriving before their `0xF7`.
///
/// With [`StreamStrategy::SingleStream`] one guard covers the whole device and the first transport class to start a
/// stream owns it ("first writer wins") until that class ends its stream or the guard expires. With
/// [`StreamStrategy::PerPortStream`] each port gets its own slot, up to [`MAX_STREAMS`].
pub struct TimeoutGuard {
    strategy: StreamStrategy,
    limit_ms: u64,
    slots: Mutex<CriticalSectionRawMutex, RefCell<[Slot; MAX_STREAMS]>>,
}

impl TimeoutGuard {
    /// Constructs a [`TimeoutGuard`]. `const` so it can live in a `static` shared between tasks.
    ///
    /// Elapsed time is counted in milliseconds up to `u32::MAX` (about 49 days); longer timeouts never expire.
    pub const fn new(strategy: StreamStrategy, timeout: Duration) -> Self {
        Self {
            strategy,
            limit_ms: timeout.as_millis(),
            slots: Mutex::new(RefCell::new([Slot::IDLE; MAX_STREAMS])),
        }
    }

    /// Getter.
    pub fn strategy(&self) -> StreamStrategy {
        self.strategy
    }

    /// Advances every armed guard by one millisecond. Counters saturate.
    pub fn tick(&self) {
        self.slots.lock(|slots| {
            for slot in slots.borrow_mut().iter_mut().filter(|s| s.owner.is_some()) {
                slot.elapsed_ms = slot.elapsed_ms.saturating_add(1);
            }
        });
    }

    /// A stream started on `port`. Arms a guard for it unless one is already held by someone else.
    pub fn arm(&self, port: Port) {
        let strategy = self.strategy;
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            if let Some(slot) = find_owned(&mut slots[..], strategy, port) {
                slot.elapsed_ms = 0;
                return;
            }
            let candidates = match strategy {
                StreamStrategy::SingleStream => &mut slots[..1],
                StreamStrategy::PerPortStream => &mut slots[..],
            };
            match candidates.iter_mut().find(|s| s.owner.is_none()) {
                Some(slot) => {
                    *slot = Slot {
                        owner: Some(port),
                        elapsed_ms: 0,
                    }
                }
                None => trace!("Timeout guard busy, {} streams unguarded", port),
            }
        });
    }

    /// A data byte arrived on `port`; restarts its guard's clock if it owns one.
    pub fn touch(&self, port: Port) {
        let strategy = self.strategy;
        self.slots.lock(|slots| {
            if let Some(slot) = find_owned(&mut slots.borrow_mut()[..], strategy, port) {
                slot.elapsed_ms = 0;
            }
        });
    }

    /// The stream on `port` ended; disarms its guard if it owns one.
    pub fn release(&self, port: Port) {
        let strategy = self.strategy;
        self.slots.lock(|slots| {
            if let Some(slot) = find_owned(&mut slots.borrow_mut()[..], strategy, port) {
                *slot = Slot::IDLE;
            }
        });
    }

    /// A transport reported an abandoned stream on `port`.
    ///
    /// Returns `false` (and changes nothing) when the guard is held by another owner; otherwise disarms `port`'s
    /// guard, if any, and returns `true`: the caller should run the timeout path.
    pub fn force(&self, port: Port) -> bool {
        let strategy = self.strategy;
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            if let Some(slot) = find_owned(&mut slots[..], strategy, port) {
                *slot = Slot::IDLE;
                return true;
            }
            match strategy {
                StreamStrategy::SingleStream => slots[0].owner.is_none(),
                StreamStrategy::PerPortStream => true,
            }
        })
    }

    /// Disarms and returns the owner of one expired guard, if any.
    pub fn take_expired(&self) -> Option<Port> {
        let limit = self.limit_ms;
        self.slots.lock(|slots| {
            let mut slots = slots.borrow_mut();
            let slot = slots
                .iter_mut()
                .find(|s| s.owner.is_some() && u64::from(s.elapsed_ms) > limit)?;
            let owner = slot.owner;
            *slot = Slot::IDLE;
            owner
        })
    }

    /// Returns `true` if any guard is armed.
    pub fn is_armed(&self) -> bool {
        self.slots
            .lock(|slots| slots.borrow().iter().any(|s| s.owner.is_some()))
    }

    /// Returns the owner of the guard covering `port`, if armed.
    pub fn owner(&self, port: Port) -> Option<Port> {
        let strategy = self.strategy;
        self.slots.lock(|slots| match strategy {
            StreamStrategy::SingleStream => slots.borrow()[0].owner,
            StreamStrategy::PerPortStream => slots
                .borrow()
                .iter()
                .find_map(|s| s.owner.filter(|&owner| owner == port)),
        })
    }
}

/// Ownership is per transport class for a single stream, per port otherwise.
fn find_owned(slots: &mut [Slot], strategy: StreamStrategy, port: Port) -> Option<&mut Slot> {
    slots.iter_mut().find(|s| match (strategy, s.owner) {
        (StreamStrategy::SingleStream, Some(owner)) => owner.same_class(port),
        (StreamStrategy::PerPortStream, Some(owner)) => owner == port,
        (_, None) => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::SYSEX_TIMEOUT;

    fn tick(guard: &TimeoutGuard, times: usize) {
        for _ in 0..times {
            guard.tick();
        }
    }

    #[test]
    fn expires_only_after_limit() {
        let guard = TimeoutGuard::new(StreamStrategy::SingleStream, SYSEX_TIMEOUT);
        guard.arm(Port::usb(0));
        tick(&guard, 1000);
        assert_eq!(None, guard.take_expired(), "1000 ticks do not exceed the limit");
        guard.tick();
        assert_eq!(Some(Port::usb(0)), guard.take_expired(), "Expected left but got right");
        assert!(!guard.is_armed(), "Expired guard should be disarmed");
    }

    #[test]
    fn long_timeouts_expire() {
        let guard = TimeoutGuard::new(StreamStrategy::SingleStream, Duration::from_secs(70));
        guard.arm(Port::usb(0));
        tick(&guard, 70_000);
        assert_eq!(None, guard.take_expired(), "70 s do not exceed the limit");
        guard.tick();
        assert_eq!(Some(Port::usb(0)), guard.take_expired(), "Expected left but got right");
    }

    #[test]
    fn unarmed_guard_never_expires() {
        let guard = TimeoutGuard::new(StreamStrategy::SingleStream, SYSEX_TIMEOUT);
        tick(&guard, 5000);
        assert_eq!(None, guard.take_expired());
    }

    #[test]
    fn first_writer_wins() {
        let guard = TimeoutGuard::new(StreamStrategy::SingleStream, SYSEX_TIMEOUT);
        guard.arm(Port::usb(0));
        guard.arm(Port::uart(0));
        assert_eq!(Some(Port::usb(0)), guard.owner(Port::uart(0)), "Expected left but got right");

        guard.release(Port::uart(0));
        assert!(guard.is_armed(), "Only the owning class may release the guard");

        assert!(!guard.force(Port::uart(0)), "A foreign timeout must be ignored");
        assert!(guard.is_armed(), "Expected guard to remain armed");

        assert!(guard.force(Port::usb(1)), "Ownership is per class");
        assert!(!guard.is_armed(), "Expected guard to be disarmed");
    }

    #[test]
    fn data_restarts_the_clock() {
        let guard = TimeoutGuard::new(StreamStrategy::SingleStream, SYSEX_TIMEOUT);
        guard.arm(Port::usb(0));
        tick(&guard, 900);
        guard.touch(Port::usb(0));
        tick(&guard, 900);
        assert_eq!(None, guard.take_expired(), "Expected clock to restart");
        guard.touch(Port::uart(0));
        tick(&guard, 200);
        assert_eq!(
            Some(Port::usb(0)),
            guard.take_expired(),
            "Foreign bytes do not keep the owner alive"
        );
    }

    #[test]
    fn per_port_guards_are_independent() {
        let guard = TimeoutGuard::new(StreamStrategy::PerPortStream, SYSEX_TIMEOUT);
        guard.arm(Port::usb(0));
        tick(&guard, 600);
        guard.arm(Port::usb(1));
        tick(&guard, 401);
        assert_eq!(Some(Port::usb(0)), guard.take_expired(), "Expected left but got right");
        assert_eq!(None, guard.take_expired(), "Second stream is still young");
        assert_eq!(Some(Port::usb(1)), guard.owner(Port::usb(1)), "Expected left but got right");
    }

    #[test]
    fn per_port_table_overflow_leaves_stream_unguarded() {
        let guard = TimeoutGuard::new(StreamStrategy::PerPortStream, SYSEX_TIMEOUT);
        for i in 0..=MAX_STREAMS as u8 {
            guard.arm(Port::uart(i));
        }
        assert_eq!(None, guard.owner(Port::uart(MAX_STREAMS as u8)), "Expected left but got right");
    }
}
