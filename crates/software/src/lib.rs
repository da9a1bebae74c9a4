//! This crate contains the architecture-agnostic core shared by the Courier family of MIDI controller firmware
//! (keyboards, CV/gate voices, USB-to-network MIDI proxies): a transport-agnostic MIDI [package](`package::Package`)
//! abstraction and a SysEx command protocol layered on top of it.
//!
//! The pieces, leaves first:
//! - [`port`]: one flat numbering scheme for every transport, plus the `default` and `debug` aliases.
//! - [`transport`]: the small, uniform contract transport drivers implement.
//! - [`dispatcher`]: sends packages (through an optional Tx filter) and polls the registered transports.
//! - [`sysex`]: rebuilds SysEx streams out of package- or byte-chunked input and guards them with a timeout.
//! - [`protocol`]: the command/acknowledge state machine (Query, Debug, Ping and application extensions).
//! - [`engine`]: ties the above together behind [`engine::Engine::pump`].

#![deny(missing_docs)]
#![no_std]

#[macro_use]
mod fmt;

pub mod configuration;
pub mod debug;
pub mod dispatcher;
pub mod engine;
pub mod package;
pub mod port;
pub mod protocol;
pub mod sysex;
pub mod transport;

#[cfg(test)]
mod testing;
