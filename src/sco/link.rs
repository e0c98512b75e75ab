//! SCO connection state machine.
//!
//! A device moves `Closed → WaitConnect → Open → Closed`. In dial mode it
//! owns one active link from the start; in listen mode it owns a listening
//! link until a peer connects, at which point the stack hands over a fresh
//! active link and the listener is dropped.

use std::sync::{
   Arc,
   atomic::{AtomicBool, Ordering},
};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::{
   bluetooth::transport::{BtStack, LinkHandle, LinkId, ScoUpper},
   error::{LinkError, Result, ScoError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
   #[strum(serialize = "closed")]
   Closed,
   #[strum(serialize = "wait_connect")]
   WaitConnect,
   #[strum(serialize = "open")]
   Open,
}

/// Which side sets up the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
   #[strum(serialize = "dial")]
   Dial,
   #[strum(serialize = "listen")]
   Listen,
}

/// Admission check for incoming connections.
///
/// The stack asks for a verdict synchronously from its own context, so the
/// parts of the connection state it needs are mirrored here in atomics.
pub struct Gate {
   remote: Address,
   state: AtomicCell<LinkState>,
   claimed: AtomicBool,
}

impl Gate {
   pub const fn new(remote: Address) -> Self {
      Self {
         remote,
         state: AtomicCell::new(LinkState::Closed),
         claimed: AtomicBool::new(true),
      }
   }

   /// Accepts `remote` if it is the configured peer, a connection is being
   /// waited for, and no other peer got there first.
   pub fn admit(&self, remote: Address) -> bool {
      if remote != self.remote {
         debug!("Rejecting connection from foreign peer {remote}");
         return false;
      }
      if self.state.load() != LinkState::WaitConnect {
         debug!("Rejecting connection from {remote}, not waiting for one");
         return false;
      }
      self
         .claimed
         .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
         .is_ok()
   }
}

/// What a `disconnected` event did to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
   /// The event concerned a link this connection no longer owns.
   Stale,
   /// A pending `open` failed.
   Failed,
   /// An open link went down.
   Lost,
}

type OpenWaiter = oneshot::Sender<Result<()>>;

/// Connection half of a device instance.
pub struct Connection {
   local: Address,
   remote: Address,
   mode: Mode,
   gate: Arc<Gate>,
   state: LinkState,
   active: Option<LinkHandle>,
   listener: Option<LinkHandle>,
   mtu: u16,
   error: Option<LinkError>,
   waiter: Option<OpenWaiter>,
}

impl Connection {
   pub fn new(local: Address, remote: Address, mode: Mode) -> Self {
      Self {
         local,
         remote,
         mode,
         gate: Arc::new(Gate::new(remote)),
         state: LinkState::Closed,
         active: None,
         listener: None,
         mtu: 0,
         error: None,
         waiter: None,
      }
   }

   pub fn gate(&self) -> Arc<Gate> {
      self.gate.clone()
   }

   pub const fn state(&self) -> LinkState {
      self.state
   }

   pub const fn mode(&self) -> Mode {
      self.mode
   }

   pub const fn is_open(&self) -> bool {
      matches!(self.state, LinkState::Open)
   }

   /// Negotiated MTU, zero until the link has been open once.
   pub const fn mtu(&self) -> u16 {
      self.mtu
   }

   pub const fn last_error(&self) -> Option<LinkError> {
      self.error
   }

   /// The active link, once a connection is under way or up.
   pub const fn active(&self) -> Option<&LinkHandle> {
      self.active.as_ref()
   }

   fn owns(&self, link: LinkId) -> bool {
      self.active.as_ref().is_some_and(|h| h.id() == link)
   }

   fn set_state(&mut self, state: LinkState) {
      if self.state != state {
         debug!("Connection {} -> {state}", self.state);
      }
      self.state = state;
      self.gate.state.store(state);
   }

   /// Starts connecting: attaches a link, binds it and dials or listens.
   pub fn open(&mut self, stack: &BtStack, upper: Arc<dyn ScoUpper>) -> Result<()> {
      if self.active.is_some() || self.listener.is_some() {
         return Err(ScoError::Busy);
      }
      self.error = None;

      let handle = stack.attach(upper)?;
      handle.bind(self.local)?;
      // Incoming pages may be offered from inside the stack call
      self.gate.claimed.store(self.mode == Mode::Dial, Ordering::Release);
      self.set_state(LinkState::WaitConnect);
      let result = match self.mode {
         Mode::Dial => handle.connect(self.remote),
         Mode::Listen => handle.listen(),
      };
      if let Err(e) = result {
         self.gate.claimed.store(true, Ordering::Release);
         self.set_state(LinkState::Closed);
         return Err(e);
      }

      match self.mode {
         Mode::Dial => {
            info!("Dialing {} from {}", self.remote, self.local);
            self.active = Some(handle);
         },
         Mode::Listen => {
            info!("Listening on {} for {}", self.local, self.remote);
            self.listener = Some(handle);
         },
      }
      Ok(())
   }

   /// Registers the caller waiting on the pending `open`.
   pub fn set_waiter(&mut self, waiter: OpenWaiter) {
      if self.state == LinkState::WaitConnect {
         self.waiter = Some(waiter);
      } else {
         let _ = waiter.send(self.error.map_or(Err(ScoError::Cancelled), |e| Err(e.into())));
      }
   }

   /// The stack created `link` for a peer the gate admitted.
   pub fn accepted(&mut self, stack: &BtStack, link: LinkId) {
      let handle = stack.adopt(link);
      if self.state != LinkState::WaitConnect || self.active.is_some() {
         warn!("Dropping accepted {link}, no connection pending");
         return;
      }
      debug!("Accepted {link} from {}", self.remote);
      self.active = Some(handle);
   }

   /// The link came up. Returns the negotiated MTU if this completed an open.
   pub fn connected(&mut self, link: LinkId) -> Option<u16> {
      if !self.owns(link) || self.state != LinkState::WaitConnect {
         debug!("Ignoring connect of {link}");
         return None;
      }
      let mtu = match self.active.as_ref().map(LinkHandle::mtu) {
         Some(Ok(mtu)) => mtu,
         Some(Err(e)) => {
            warn!("Could not query MTU of {link}: {e}");
            self.fail(LinkError::Reset);
            return None;
         },
         None => return None,
      };

      self.mtu = mtu;
      self.listener = None;
      self.set_state(LinkState::Open);
      info!("Connected to {} ({link}, mtu {mtu})", self.remote);
      if let Some(waiter) = self.waiter.take() {
         let _ = waiter.send(Ok(()));
      }
      Some(mtu)
   }

   /// The link went down or the attempt failed.
   pub fn disconnected(&mut self, link: LinkId, err: LinkError) -> Teardown {
      if self.listener.as_ref().is_some_and(|h| h.id() == link) && self.active.is_none() {
         warn!("Listener {link} failed: {err}");
         self.fail(err);
         return Teardown::Failed;
      }
      if !self.owns(link) {
         debug!("Ignoring disconnect of stale {link}: {err}");
         return Teardown::Stale;
      }
      if self.state == LinkState::Open {
         info!("Disconnected from {}: {err}", self.remote);
         self.release(Some(err));
         Teardown::Lost
      } else {
         info!("Connection to {} failed: {err}", self.remote);
         self.fail(err);
         Teardown::Failed
      }
   }

   /// Gives up on a pending `open`. The connection wins if it completed
   /// before the request got here.
   pub fn abort_open(&mut self) -> Result<()> {
      match self.state {
         LinkState::Open => Ok(()),
         LinkState::Closed => Err(self.error.map_or(ScoError::Timeout, ScoError::from)),
         LinkState::WaitConnect => {
            debug!("Giving up on {}", self.remote);
            self.waiter = None;
            self.close();
            self.error = Some(LinkError::TimedOut);
            Err(ScoError::Timeout)
         },
      }
   }

   /// Tears down both links. Returns true if the link was open.
   pub fn close(&mut self) -> bool {
      let was_open = self.is_open();
      if let Some(handle) = self.active.take()
         && let Err(e) = handle.disconnect()
      {
         warn!("Disconnect of {} failed: {e}", handle.id());
      }
      self.listener = None;
      self.gate.claimed.store(true, Ordering::Release);
      self.set_state(LinkState::Closed);
      if let Some(waiter) = self.waiter.take() {
         let _ = waiter.send(Err(ScoError::Cancelled));
      }
      was_open
   }

   fn fail(&mut self, err: LinkError) {
      self.release(Some(err));
      if let Some(waiter) = self.waiter.take() {
         let _ = waiter.send(Err(err.into()));
      }
   }

   fn release(&mut self, err: Option<LinkError>) {
      self.active = None;
      self.listener = None;
      self.error = err;
      self.gate.claimed.store(true, Ordering::Release);
      self.set_state(LinkState::Closed);
   }
}
