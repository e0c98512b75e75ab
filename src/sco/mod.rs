//! SCO audio device implementation.
//!
//! The device bridges a host audio framework, which hands over PCM blocks
//! and asks for recorded ones, to a SCO voice link that moves fixed-size
//! frames. Each submodule covers one part of a device instance; [`device`]
//! ties them together behind the host-facing [`ScoDevice`](device::ScoDevice).

pub mod buffer;
pub mod device;
pub mod link;
pub mod mixer;
pub mod params;
pub mod rx;
pub mod tx;
