//! Mixer controls for the SCO device.
//!
//! A headset link carries two gains: speaker volume on the output side and
//! microphone gain on the input side. The profile layer relays them to the
//! peer; this module only stores them and validates host mixer requests.

use smallvec::SmallVec;

use crate::error::{Result, ScoError};

/// Highest gain level a mixer value can take.
pub const MAX_GAIN: u8 = u8::MAX;

/// Mixer entries exposed by the device, by index.
#[repr(u32)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   strum::FromRepr,
   strum::Display,
   strum::IntoStaticStr,
)]
pub enum MixerPort {
   #[strum(serialize = "speaker")]
   Speaker = 0,
   #[strum(serialize = "mic")]
   Microphone = 1,
   #[strum(serialize = "outputs")]
   OutputClass = 2,
   #[strum(serialize = "inputs")]
   InputClass = 3,
}

impl MixerPort {
   pub const fn class(self) -> Self {
      match self {
         Self::Speaker | Self::OutputClass => Self::OutputClass,
         Self::Microphone | Self::InputClass => Self::InputClass,
      }
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Value carried by a mixer control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MixerValue {
   /// Per-channel levels.
   Level(SmallVec<[u8; 2]>),
   /// Selected member of an enumeration.
   Enum(u32),
   /// Bitmask of selected set members.
   Set(u32),
}

/// A mixer read or write request from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixerControl {
   pub port: u32,
   pub value: MixerValue,
}

impl MixerControl {
   /// Mono level control for `port`.
   pub fn level(port: MixerPort, level: u8) -> Self {
      Self {
         port: port as u32,
         value: MixerValue::Level(SmallVec::from_slice(&[level])),
      }
   }
}

/// Shape of a mixer entry, as reported by [`Mixer::describe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerKind {
   Class,
   Value { channels: u8, unit: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixerDeviceInfo {
   pub port: MixerPort,
   pub label: &'static str,
   pub class: MixerPort,
   pub kind: MixerKind,
}

/// Speaker and microphone gain of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mixer {
   speaker: u8,
   mic: u8,
}

impl Default for Mixer {
   fn default() -> Self {
      Self::new(MAX_GAIN / 2, MAX_GAIN / 2)
   }
}

impl Mixer {
   pub const fn new(speaker: u8, mic: u8) -> Self {
      Self { speaker, mic }
   }

   pub const fn speaker(&self) -> u8 {
      self.speaker
   }

   pub const fn mic(&self) -> u8 {
      self.mic
   }

   fn gain_port(port: u32) -> Result<MixerPort> {
      match MixerPort::from_repr(port) {
         Some(p @ (MixerPort::Speaker | MixerPort::Microphone)) => Ok(p),
         _ => Err(ScoError::InvalidArgument("unknown mixer port")),
      }
   }

   pub fn get(&self, port: u32) -> Result<MixerControl> {
      let level = match Self::gain_port(port)? {
         MixerPort::Speaker => self.speaker,
         _ => self.mic,
      };
      Ok(MixerControl {
         port,
         value: MixerValue::Level(SmallVec::from_slice(&[level])),
      })
   }

   /// Applies `ctl`, returning the port and level that were set.
   pub fn set(&mut self, ctl: &MixerControl) -> Result<(MixerPort, u8)> {
      let port = Self::gain_port(ctl.port)?;
      let MixerValue::Level(levels) = &ctl.value else {
         return Err(ScoError::InvalidArgument("mixer control is not a value"));
      };
      let &[level] = levels.as_slice() else {
         return Err(ScoError::InvalidArgument("mixer value must be mono"));
      };
      match port {
         MixerPort::Speaker => self.speaker = level,
         _ => self.mic = level,
      }
      Ok((port, level))
   }

   /// Describes the mixer entry at `index`.
   pub fn describe(index: u32) -> Result<MixerDeviceInfo> {
      let port =
         MixerPort::from_repr(index).ok_or(ScoError::InvalidArgument("no such mixer entry"))?;
      let kind = match port {
         MixerPort::Speaker | MixerPort::Microphone => MixerKind::Value {
            channels: 1,
            unit: "volume",
         },
         MixerPort::OutputClass | MixerPort::InputClass => MixerKind::Class,
      };
      Ok(MixerDeviceInfo {
         port,
         label: port.to_str(),
         class: port.class(),
         kind,
      })
   }
}
