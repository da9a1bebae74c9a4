//! Reassembly of System-Exclusive streams.
//!
//! SysEx arrives chunked into packages (or one byte at a time from byte-oriented transports), possibly interleaved
//! from several ports. The [`Reassembler`] consumes those bytes one at a time, matches them against this device's
//! header and id, and emits [`StreamEvent`]s for the command layer. The [`TimeoutGuard`] detects streams that stop
//! before their terminator.

mod guard;
pub use guard::*;

use crate::{
    configuration::{HEADER_LEN, Identity, MAX_STREAMS, StreamStrategy},
    package::{SYSEX_END, SYSEX_START},
    port::Port,
};

/// What the command layer should do in response to a byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StreamEvent {
    /// Header and device id matched; this is the command id.
    Begin(u8),
    /// A body byte of the active command.
    Data(u8),
    /// The command ended: by `0xF7` (`aborted == false`), or by another status byte, a restart or a timeout.
    End {
        /// `true` unless the stream was terminated by `0xF7`.
        aborted: bool,
    },
}

/// A [`StreamEvent`] and the port whose stream produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PortEvent {
    /// Originating port.
    pub port: Port,
    /// The event.
    pub event: StreamEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Number of header bytes matched so far.
    Header(usize),
    DeviceId,
    CommandId,
    Command(u8),
}

#[derive(Debug, Clone, Copy)]
struct Stream {
    phase: Phase,
    port: Port,
}

impl Stream {
    const IDLE: Stream = Stream {
        phase: Phase::Idle,
        port: Port::DEFAULT,
    };

    fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }
}

/// Events produced by a single byte: at most an end of the previous command plus one event for the new byte.
pub type Events = [Option<PortEvent>; 2];

/// Turns SysEx bytes into [`StreamEvent`]s.
pub struct Reassembler {
    strategy: StreamStrategy,
    streams: [Stream; MAX_STREAMS],
    /// The port whose stream currently drives a command, if any.
    command_owner: Option<Port>,
}

impl Reassembler {
    /// Constructs an idle [`Reassembler`].
    pub fn new(strategy: StreamStrategy) -> Self {
        Self {
            strategy,
            streams: [Stream::IDLE; MAX_STREAMS],
            command_owner: None,
        }
    }

    /// Returns `true` if no stream is being matched or executed.
    pub fn is_idle(&self) -> bool {
        self.streams.iter().all(Stream::is_idle)
    }

    /// Returns the id of the command currently driven by a stream, with its port.
    pub fn active_command(&self) -> Option<(Port, u8)> {
        self.streams.iter().find_map(|stream| match stream.phase {
            Phase::Command(id) => Some((stream.port, id)),
            _ => None,
        })
    }

    /// Consumes one byte received on `port`.
    ///
    /// Realtime bytes (`0xF8` and above) never alter stream state and are ignored here.
    pub fn feed(&mut self, port: Port, byte: u8, identity: &Identity) -> Events {
        let mut events: Events = [None, None];
        if byte >= 0xf8 {
            return events;
        }

        let Some(i) = self.stream_index(port, byte) else {
            if !self.is_idle() {
                trace!("Ignoring {:#x} from {}: another port owns the stream", byte, port);
            }
            return events;
        };

        if byte == SYSEX_START {
            events[0] = self.close(i, true);
            self.streams[i] = Stream {
                phase: Phase::Header(0),
                port,
            };
        }

        let stream = &mut self.streams[i];
        let header = identity.header();
        let (phase, event) = match (stream.phase, byte) {
            (Phase::Idle, _) => (Phase::Idle, None),
            (Phase::Header(n), byte) if byte == header[n] => {
                if n + 1 == HEADER_LEN {
                    (Phase::DeviceId, None)
                } else {
                    (Phase::Header(n + 1), None)
                }
            }
            (Phase::Command(_), SYSEX_END) => (Phase::Idle, Some(StreamEvent::End { aborted: false })),
            (Phase::Command(_), 0x80..=0xff) => (Phase::Idle, Some(StreamEvent::End { aborted: true })),
            (Phase::Command(id), data) => (Phase::Command(id), Some(StreamEvent::Data(data))),
            (Phase::DeviceId, id) if id == identity.device_id() => (Phase::CommandId, None),
            (Phase::CommandId, command @ 0x00..=0x7f) => (Phase::Command(command), Some(StreamEvent::Begin(command))),
            // header, device id or command mismatch: the stream belongs to somebody else
            _ => (Phase::Idle, None),
        };

        let port = stream.port;
        stream.phase = phase;

        if let Some(StreamEvent::Begin(_)) = event {
            if self.command_owner.is_some_and(|owner| owner != port) {
                debug!("Dropping stream from {}: a command is already active", port);
                self.streams[i] = Stream::IDLE;
                return events;
            }
            self.command_owner = Some(port);
        }
        if let Some(StreamEvent::End { .. }) = event {
            self.command_owner = None;
        }
        if self.streams[i].is_idle() {
            self.streams[i] = Stream::IDLE;
        }

        events[1] = event.map(|event| PortEvent { port, event });
        events
    }

    /// Returns the stream on `port` to idle without emitting anything (e.g. after an unknown command).
    pub fn discard(&mut self, port: Port) {
        if let Some(i) = self.find(port) {
            if self.command_owner == Some(self.streams[i].port) {
                self.command_owner = None;
            }
            self.streams[i] = Stream::IDLE;
        }
    }

    /// Ports with a stream being matched or executed.
    pub fn open_streams(&self) -> impl Iterator<Item = Port> + '_ {
        self.streams.iter().filter(|s| !s.is_idle()).map(|s| s.port)
    }

    /// Force-aborts the stream covering `port` after its transport abandoned it. Returns the end event when a
    /// command was active.
    ///
    /// A single stream restarted by another transport class in the meantime is left alone.
    pub fn abort(&mut self, port: Port) -> Option<PortEvent> {
        let i = self
            .find(port)
            .filter(|&i| self.streams[i].port.same_class(port))?;
        self.close(i, true)
    }

    /// Resets the stream covered by `port`'s expired guard. Returns the end event when a command was active.
    ///
    /// There is only one single stream, so it is reset whichever port restarted it last.
    pub fn expire(&mut self, port: Port) -> Option<PortEvent> {
        let i = self.find(port)?;
        self.close(i, true)
    }

    /// Ends the `i`th stream, emitting an end event if it was executing a command.
    fn close(&mut self, i: usize, aborted: bool) -> Option<PortEvent> {
        let stream = core::mem::replace(&mut self.streams[i], Stream::IDLE);
        match stream.phase {
            Phase::Command(_) => {
                if self.command_owner == Some(stream.port) {
                    self.command_owner = None;
                }
                Some(PortEvent {
                    port: stream.port,
                    event: StreamEvent::End { aborted },
                })
            }
            _ => None,
        }
    }

    /// The stream slot `port`'s byte should be parsed against, if any.
    fn stream_index(&self, port: Port, byte: u8) -> Option<usize> {
        match self.strategy {
            StreamStrategy::SingleStream => {
                let stream = &self.streams[0];
                // any port may (re)start the single stream; everything else must come from its owner
                (byte == SYSEX_START || stream.is_idle() || stream.port == port).then_some(0)
            }
            StreamStrategy::PerPortStream => self.find(port).or_else(|| {
                (byte == SYSEX_START)
                    .then(|| self.streams.iter().position(Stream::is_idle))
                    .flatten()
            }),
        }
    }

    /// The active stream slot for `port`.
    fn find(&self, port: Port) -> Option<usize> {
        match self.strategy {
            StreamStrategy::SingleStream => (!self.streams[0].is_idle()).then_some(0),
            StreamStrategy::PerPortStream => self
                .streams
                .iter()
                .position(|s| !s.is_idle() && s.port == port),
        }
    }
}
