//! Seam between the bridge and the Bluetooth SCO protocol stack.
//!
//! The stack is shared by every device, so all calls into it go through the
//! single lock held by [`BtStack`]. The stack reports link activity back
//! through a [`ScoUpper`] registered per link; implementations of that trait
//! must only post work and return, never call back into the stack.

use std::{fmt, sync::Arc};

use bluer::Address;
use log::debug;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;

use crate::{
   error::{LinkError, Result},
   sco::buffer::Fragment,
};

/// Inbound SCO frame.
pub type Frame = SmallVec<[u8; 64]>;

/// Identifier of a link inside the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "sco#{}", self.0)
   }
}

/// Result of handing a fragment to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
   /// The fragment is queued; a `complete` callback will follow.
   Queued,
   /// The fragment was consumed synchronously; no callback will follow.
   Completed,
}

/// Link mode flags reported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct LinkMode(u8);

impl LinkMode {
   pub const AUTH: u8 = 1 << 0;
   pub const ENCRYPT: u8 = 1 << 1;
   pub const SECURE: u8 = 1 << 2;

   pub const fn new(flags: u8) -> Self {
      Self(flags)
   }

   pub const fn is_authenticated(self) -> bool {
      self.0 & Self::AUTH != 0
   }

   pub const fn is_encrypted(self) -> bool {
      self.0 & Self::ENCRYPT != 0
   }

   pub const fn is_secure(self) -> bool {
      self.0 & Self::SECURE != 0
   }
}

/// Callbacks from the transport into the owner of a link.
pub trait ScoUpper: Send + Sync {
   /// Connection attempt is in progress.
   fn connecting(&self, _link: LinkId) {}

   /// The link is up.
   fn connected(&self, link: LinkId);

   /// The link went down, or a connection attempt failed.
   fn disconnected(&self, link: LinkId, err: LinkError);

   /// A peer is connecting to the listening `link`.
   ///
   /// `new_link` is the link the stack will use for the connection if it is
   /// accepted; its later events are reported to this same upper.
   fn newconn(&self, link: LinkId, local: Address, remote: Address, new_link: LinkId) -> bool;

   /// `count` queued fragments were sent.
   fn complete(&self, link: LinkId, count: usize);

   /// Security mode of the link changed.
   fn linkmode(&self, _link: LinkId, _mode: LinkMode) {}

   /// A frame arrived.
   fn input(&self, link: LinkId, frame: Frame);
}

/// Operations provided by a SCO protocol stack.
pub trait ScoTransport: Send {
   fn attach(&mut self, upper: Arc<dyn ScoUpper>) -> Result<LinkId>;
   fn detach(&mut self, link: LinkId);
   fn bind(&mut self, link: LinkId, local: Address) -> Result<()>;
   fn connect(&mut self, link: LinkId, remote: Address) -> Result<()>;
   fn listen(&mut self, link: LinkId) -> Result<()>;
   fn disconnect(&mut self, link: LinkId) -> Result<()>;
   fn mtu(&self, link: LinkId) -> Result<u16>;
   fn send(&mut self, link: LinkId, fragment: Fragment) -> Result<Submit>;
}

/// Process-wide handle to the shared SCO stack.
///
/// This type is cheaply cloneable. Every call into the stack takes the same
/// lock, whichever device makes it.
#[derive(Clone)]
pub struct BtStack(Arc<Mutex<dyn ScoTransport>>);

impl BtStack {
   pub fn new<T: ScoTransport + 'static>(transport: T) -> Self {
      Self(Arc::new(Mutex::new(transport)))
   }

   /// Wraps a stack the caller keeps its own typed handle to.
   pub fn from_shared<T: ScoTransport + 'static>(transport: Arc<Mutex<T>>) -> Self {
      Self(transport)
   }

   pub fn lock(&self) -> MutexGuard<'_, dyn ScoTransport> {
      self.0.lock()
   }

   /// Attaches a new link reporting to `upper`.
   pub fn attach(&self, upper: Arc<dyn ScoUpper>) -> Result<LinkHandle> {
      let id = self.lock().attach(upper)?;
      debug!("Attached {id}");
      Ok(LinkHandle {
         id,
         stack: self.clone(),
      })
   }

   /// Takes ownership of a link the stack created for an incoming connection.
   pub fn adopt(&self, id: LinkId) -> LinkHandle {
      LinkHandle {
         id,
         stack: self.clone(),
      }
   }
}

/// Exclusive owner of one transport link. Dropping it detaches the link.
pub struct LinkHandle {
   id: LinkId,
   stack: BtStack,
}

impl fmt::Debug for LinkHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_tuple("LinkHandle").field(&self.id).finish()
   }
}

impl LinkHandle {
   pub const fn id(&self) -> LinkId {
      self.id
   }

   pub fn bind(&self, local: Address) -> Result<()> {
      self.stack.lock().bind(self.id, local)
   }

   pub fn connect(&self, remote: Address) -> Result<()> {
      self.stack.lock().connect(self.id, remote)
   }

   pub fn listen(&self) -> Result<()> {
      self.stack.lock().listen(self.id)
   }

   pub fn disconnect(&self) -> Result<()> {
      self.stack.lock().disconnect(self.id)
   }

   pub fn mtu(&self) -> Result<u16> {
      self.stack.lock().mtu(self.id)
   }

   pub fn send(&self, fragment: Fragment) -> Result<Submit> {
      self.stack.lock().send(self.id, fragment)
   }
}

impl Drop for LinkHandle {
   fn drop(&mut self) {
      debug!("Detaching {}", self.id);
      self.stack.lock().detach(self.id);
   }
}
