//! Event handling for SCO device status updates.
//!
//! Devices report connection changes and mixer updates through an
//! [`EventBus`] so the surrounding profile layer (or an operator log) can
//! follow them without polling.

use std::sync::Arc;

use smol_str::SmolStr;

use crate::{error::LinkError, sco::mixer::MixerPort};

/// Events that can be emitted by a SCO device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScoEvent {
   Connected { mtu: u16 },
   Disconnected(Option<LinkError>),
   GainChanged { port: MixerPort, level: u8 },
   Detached,
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event on behalf of the named device.
   fn emit(&self, device: &SmolStr, event: ScoEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Event bus that drops everything.
pub struct NullEvents;

impl EventBus for NullEvents {
   fn emit(&self, _device: &SmolStr, _event: ScoEvent) {}
}
