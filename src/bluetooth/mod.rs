//! Bluetooth SCO transport layer.
//!
//! This module defines the seam to the SCO protocol stack and provides an
//! in-memory stack for pairing local devices with each other.

pub mod loopback;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;
