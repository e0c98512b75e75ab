//! Error types for the SCO audio bridge.
//!
//! This module defines every error that can surface from the bridge:
//! connection failures reported by the transport, argument errors from the
//! host audio framework, and resource errors around buffer ownership.

use thiserror::Error;

/// Reason a SCO link went down, as reported by the transport.
///
/// Kept separate from [`ScoError`] because it is stored on the device and
/// replayed to the next `open()` caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum LinkError {
   #[strum(serialize = "connection refused")]
   Refused,
   #[strum(serialize = "host unreachable")]
   HostDown,
   #[strum(serialize = "connection timed out")]
   TimedOut,
   #[strum(serialize = "connection reset")]
   Reset,
   #[strum(serialize = "closed by remote")]
   RemoteClosed,
   #[strum(serialize = "closed locally")]
   LocalClosed,
}

/// Main error type for the SCO audio bridge.
#[derive(Error, Debug)]
pub enum ScoError {
   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Device busy")]
   Busy,

   #[error("Device not connected")]
   NotConnected,

   #[error("Connection timed out")]
   Timeout,

   #[error("Link error: {0}")]
   Link(LinkError),

   #[error("Invalid argument: {0}")]
   InvalidArgument(&'static str),

   #[error("Invalid RFCOMM channel: {0}")]
   InvalidChannel(u8),

   #[error("Invalid address: {0}")]
   InvalidAddress(String),

   #[error("Buffer still in use ({0} fragments outstanding)")]
   BufferInUse(usize),

   #[error("Transport out of buffers")]
   NoBuffers,

   #[error("Unknown link")]
   UnknownLink,

   #[error("Operation cancelled")]
   Cancelled,

   #[error("Device has been shut down")]
   DeviceShutdown,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl From<LinkError> for ScoError {
   fn from(err: LinkError) -> Self {
      Self::Link(err)
   }
}

/// Convenience type alias for Results with `ScoError`.
pub type Result<T> = std::result::Result<T, ScoError>;
