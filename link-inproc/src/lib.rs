// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! An in-process transport: peers hosted in the same process address one
//! another as `/inproc/<name>`, and dialing yields a bidirectional,
//! stream-multiplexed connection whose streams behave like real network
//! streams -- deadlines, half-close, reset, EOF, backpressure -- without
//! touching the operating-system socket layer.
//!
//! Intended for deterministic integration tests, simulation of multi-peer
//! topologies, and in-process composition of peer-to-peer services.

#[macro_use]
extern crate lazy_static;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;

pub mod addr;
pub mod connection;
pub mod discovery;
pub mod env;
pub mod error;
pub mod keys;
pub mod listener;
pub mod peer;
pub mod stream;
pub mod transport;

mod sync;

pub use addr::{resolve, Addr, NetAddr, P_INPROC};
pub use connection::Connection;
pub use env::Env;
pub use error::Error;
pub use keys::{PublicKey, SecretKey};
pub use listener::Listener;
pub use peer::PeerId;
pub use stream::Stream;
pub use transport::{Options, Transport};
