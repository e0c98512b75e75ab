//! In-memory SCO stack.
//!
//! Links attached to the same [`LoopbackStack`] can reach each other: a link
//! that connects to an address is paired with the link listening on that
//! address, and every fragment sent on one end arrives as an input frame on
//! the other. A connect to an address nobody listens on stays paging until a
//! listener shows up, which looks like a page timeout to the caller.

use std::{
   collections::{HashMap, VecDeque},
   sync::Arc,
};

use bluer::Address;
use log::{debug, warn};

use crate::{
   bluetooth::transport::{LinkId, ScoTransport, ScoUpper, Submit},
   error::{LinkError, Result, ScoError},
   sco::buffer::Fragment,
};

/// Default SCO payload size for HV3 packets over a 64 kbit/s CVSD link.
pub const DEFAULT_MTU: u16 = 48;
/// Fragments a link may have in flight before sends are refused.
const DEFAULT_QUEUE_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
   Idle,
   Listening,
   Paging(Address),
   Connected { peer: LinkId, remote: Address },
}

struct Link {
   upper: Arc<dyn ScoUpper>,
   local: Option<Address>,
   state: LinkState,
   in_flight: VecDeque<Fragment>,
}

/// In-memory SCO stack pairing local links with each other.
pub struct LoopbackStack {
   mtu: u16,
   queue_limit: usize,
   auto_ack: bool,
   next_id: u32,
   links: HashMap<LinkId, Link>,
}

impl Default for LoopbackStack {
   fn default() -> Self {
      Self::new(DEFAULT_MTU)
   }
}

impl LoopbackStack {
   pub fn new(mtu: u16) -> Self {
      Self {
         mtu,
         queue_limit: DEFAULT_QUEUE_LIMIT,
         auto_ack: true,
         next_id: 1,
         links: HashMap::new(),
      }
   }

   /// Keeps sent fragments in flight until [`ack`](Self::ack) is called.
   pub fn manual_ack(mut self) -> Self {
      self.auto_ack = false;
      self
   }

   pub fn queue_limit(mut self, limit: usize) -> Self {
      self.queue_limit = limit;
      self
   }

   /// Fragments sent on `link` and not yet acknowledged.
   pub fn in_flight(&self, link: LinkId) -> usize {
      self.links.get(&link).map_or(0, |l| l.in_flight.len())
   }

   /// Acknowledges up to `count` of the oldest fragments in flight on `link`.
   pub fn ack(&mut self, link: LinkId, count: usize) -> usize {
      let Some(entry) = self.links.get_mut(&link) else {
         return 0;
      };
      let n = count.min(entry.in_flight.len());
      entry.in_flight.drain(..n);
      if n > 0 {
         entry.upper.complete(link, n);
      }
      n
   }

   /// Links currently connected, in id order.
   pub fn connected_links(&self) -> Vec<LinkId> {
      let mut ids: Vec<_> = self
         .links
         .iter()
         .filter(|(_, l)| matches!(l.state, LinkState::Connected { .. }))
         .map(|(id, _)| *id)
         .collect();
      ids.sort();
      ids
   }

   fn link(&self, link: LinkId) -> Result<&Link> {
      self.links.get(&link).ok_or(ScoError::UnknownLink)
   }

   fn link_mut(&mut self, link: LinkId) -> Result<&mut Link> {
      self.links.get_mut(&link).ok_or(ScoError::UnknownLink)
   }

   fn allocate_id(&mut self) -> LinkId {
      let id = LinkId(self.next_id);
      self.next_id += 1;
      id
   }

   /// Tries to complete a page from `link` to `remote`. Returns false if
   /// nothing listens on `remote`.
   fn page(&mut self, link: LinkId, local: Address, remote: Address) -> bool {
      let Some((listener_id, listener_upper)) = self
         .links
         .iter()
         .find(|(_, l)| l.state == LinkState::Listening && l.local == Some(remote))
         .map(|(id, l)| (*id, l.upper.clone()))
      else {
         return false;
      };

      let new_id = self.allocate_id();
      let Some(dialer) = self.links.get_mut(&link) else {
         return false;
      };
      let dialer_upper = dialer.upper.clone();

      if !listener_upper.newconn(listener_id, remote, local, new_id) {
         debug!("{listener_id} rejected connection from {local}");
         dialer.state = LinkState::Idle;
         dialer_upper.disconnected(link, LinkError::Refused);
         return true;
      }

      dialer.state = LinkState::Connected {
         peer: new_id,
         remote,
      };
      self.links.insert(
         new_id,
         Link {
            upper: listener_upper.clone(),
            local: Some(remote),
            state: LinkState::Connected {
               peer: link,
               remote: local,
            },
            in_flight: VecDeque::new(),
         },
      );
      debug!("{link} ({local}) connected to {new_id} ({remote})");
      dialer_upper.connected(link);
      listener_upper.connected(new_id);
      true
   }

   /// Drops the connection state of `link` and tells its owner why.
   fn hang_up(&mut self, link: LinkId, err: LinkError) {
      if let Some(entry) = self.links.get_mut(&link) {
         entry.state = LinkState::Idle;
         entry.in_flight.clear();
         entry.upper.disconnected(link, err);
      }
   }
}

impl ScoTransport for LoopbackStack {
   fn attach(&mut self, upper: Arc<dyn ScoUpper>) -> Result<LinkId> {
      let id = self.allocate_id();
      self.links.insert(
         id,
         Link {
            upper,
            local: None,
            state: LinkState::Idle,
            in_flight: VecDeque::new(),
         },
      );
      Ok(id)
   }

   fn detach(&mut self, link: LinkId) {
      let Some(entry) = self.links.remove(&link) else {
         return;
      };
      if let LinkState::Connected { peer, .. } = entry.state {
         self.hang_up(peer, LinkError::Reset);
      }
   }

   fn bind(&mut self, link: LinkId, local: Address) -> Result<()> {
      self.link_mut(link)?.local = Some(local);
      Ok(())
   }

   fn connect(&mut self, link: LinkId, remote: Address) -> Result<()> {
      let entry = self.link_mut(link)?;
      let local = entry
         .local
         .ok_or(ScoError::InvalidArgument("connect on unbound link"))?;
      if entry.state != LinkState::Idle {
         return Err(ScoError::Busy);
      }
      entry.state = LinkState::Paging(remote);
      entry.upper.connecting(link);

      if !self.page(link, local, remote) {
         debug!("{link} paging {remote}, nobody listening yet");
      }
      Ok(())
   }

   fn listen(&mut self, link: LinkId) -> Result<()> {
      let entry = self.link_mut(link)?;
      let local = entry
         .local
         .ok_or(ScoError::InvalidArgument("listen on unbound link"))?;
      entry.state = LinkState::Listening;

      // Complete any page that was waiting for this address
      let paging: Vec<_> = self
         .links
         .iter()
         .filter(|(_, l)| l.state == LinkState::Paging(local))
         .filter_map(|(id, l)| l.local.map(|addr| (*id, addr)))
         .collect();
      for (dialer, dialer_addr) in paging {
         self.page(dialer, dialer_addr, local);
      }
      Ok(())
   }

   fn disconnect(&mut self, link: LinkId) -> Result<()> {
      match self.link(link)?.state {
         LinkState::Connected { peer, .. } => {
            self.hang_up(peer, LinkError::RemoteClosed);
            self.hang_up(link, LinkError::LocalClosed);
         },
         LinkState::Paging(_) => self.hang_up(link, LinkError::LocalClosed),
         LinkState::Idle | LinkState::Listening => {},
      }
      Ok(())
   }

   fn mtu(&self, link: LinkId) -> Result<u16> {
      match self.link(link)?.state {
         LinkState::Connected { .. } => Ok(self.mtu),
         _ => Err(ScoError::NotConnected),
      }
   }

   fn send(&mut self, link: LinkId, fragment: Fragment) -> Result<Submit> {
      let entry = self.link(link)?;
      let LinkState::Connected { peer, .. } = entry.state else {
         return Err(ScoError::NotConnected);
      };
      if fragment.len() > usize::from(self.mtu) {
         return Err(ScoError::InvalidArgument("fragment exceeds MTU"));
      }
      if entry.in_flight.len() >= self.queue_limit {
         warn!("{link}: transmit queue full");
         return Err(ScoError::NoBuffers);
      }

      let frame = fragment.to_frame();
      debug!("→ {link}: {}", hex::encode(&frame));
      if let Some(peer_entry) = self.links.get(&peer) {
         peer_entry.upper.input(peer, frame);
      }

      let auto_ack = self.auto_ack;
      let entry = self.link_mut(link)?;
      if auto_ack {
         drop(fragment);
         entry.upper.complete(link, 1);
      } else {
         entry.in_flight.push_back(fragment);
      }
      Ok(Submit::Queued)
   }
}
