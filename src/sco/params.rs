//! Audio format negotiation for the SCO device.
//!
//! A SCO voice link carries exactly one PCM format, so every request from
//! the host is normalized to it.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScoError};

/// Sample encodings the host may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum Encoding {
   #[strum(serialize = "slinear_le")]
   SlinearLe,
   #[strum(serialize = "slinear_be")]
   SlinearBe,
   #[strum(serialize = "ulinear_le")]
   UlinearLe,
   #[strum(serialize = "mulaw")]
   Mulaw,
   #[strum(serialize = "alaw")]
   Alaw,
}

/// PCM stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioParams {
   pub sample_rate: u32,
   pub channels: u8,
   pub precision: u8,
   pub encoding: Encoding,
}

impl AudioParams {
   /// The only format a SCO voice link carries: 8 kHz mono 16-bit LE.
   pub const SCO: Self = Self {
      sample_rate: 8000,
      channels: 1,
      precision: 16,
      encoding: Encoding::SlinearLe,
   };

   /// Normalizes a requested format to the link format.
   pub fn normalize(requested: Self) -> Self {
      if requested != Self::SCO {
         debug!("Format {requested:?} not supported, using {:?}", Self::SCO);
      }
      Self::SCO
   }

   /// Bytes per second of the link format.
   pub const fn byte_rate(&self) -> u32 {
      self.sample_rate * self.channels as u32 * (self.precision as u32 / 8)
   }
}

/// Entry of the encoding list returned by [`query_encoding`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodingInfo {
   pub name: &'static str,
   pub encoding: Encoding,
   pub precision: u8,
}

/// Enumerates the supported encodings.
pub fn query_encoding(index: usize) -> Result<EncodingInfo> {
   match index {
      0 => Ok(EncodingInfo {
         name: "slinear_le",
         encoding: AudioParams::SCO.encoding,
         precision: AudioParams::SCO.precision,
      }),
      _ => Err(ScoError::InvalidArgument("no such encoding")),
   }
}

/// Rounds `size` down to a whole number of `mtu` sized fragments.
///
/// Returns the MTU itself when the result would be zero, and `size`
/// unchanged while no MTU is known.
pub const fn round_block_size(size: usize, mtu: usize) -> usize {
   if mtu == 0 {
      return size;
   }
   let rounded = size - size % mtu;
   if rounded == 0 { mtu } else { rounded }
}

/// Capabilities reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Properties {
   pub full_duplex: bool,
}

/// Identification strings reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioDevice {
   pub name: &'static str,
   pub version: &'static str,
   pub config: &'static str,
}

pub const AUDIO_DEVICE: AudioDevice = AudioDevice {
   name: "Bluetooth Audio",
   version: "",
   config: "btsco",
};
