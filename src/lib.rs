//! Bluetooth SCO audio bridge.
//!
//! Exposes a Bluetooth headset or handsfree peer as an audio device: host
//! play blocks are cut into SCO-sized fragments and sent over the voice link,
//! and inbound SCO frames are reassembled into host record blocks.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod event;
pub mod sco;

pub use crate::{
   bluetooth::{
      loopback::LoopbackStack,
      transport::{BtStack, ScoTransport, ScoUpper},
   },
   config::Config,
   error::{LinkError, Result, ScoError},
   event::{EventBus, EventSender, ScoEvent},
   sco::{
      buffer::{AudioBuffer, Direction},
      device::{DeviceConfig, DeviceInfo, ScoDevice},
      link::{LinkState, Mode},
   },
};
