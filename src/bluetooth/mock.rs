//! Recording transport for unit tests.
//!
//! Every call into the stack is reported on an operations channel, and
//! fragments are handed to the test instead of being acknowledged, so tests
//! decide when leases come back and when callbacks fire.

use std::{collections::HashMap, sync::Arc};

use bluer::Address;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
   bluetooth::transport::{BtStack, Frame, LinkId, ScoTransport, ScoUpper, Submit},
   error::{LinkError, Result, ScoError},
   sco::buffer::Fragment,
};

#[derive(Debug)]
pub enum Op {
   Attach(LinkId),
   Bind(LinkId, Address),
   Connect(LinkId, Address),
   Listen(LinkId),
   Disconnect(LinkId),
   Detach(LinkId),
   Send(LinkId, Fragment),
}

struct MockTransport {
   next_id: u32,
   mtu: u16,
   refuse_after: Option<usize>,
   sent: usize,
   uppers: HashMap<LinkId, Arc<dyn ScoUpper>>,
   ops: mpsc::UnboundedSender<Op>,
}

impl MockTransport {
   fn record(&self, op: Op) {
      let _ = self.ops.send(op);
   }

   fn known(&self, link: LinkId) -> Result<()> {
      if self.uppers.contains_key(&link) {
         Ok(())
      } else {
         Err(ScoError::UnknownLink)
      }
   }
}

impl ScoTransport for MockTransport {
   fn attach(&mut self, upper: Arc<dyn ScoUpper>) -> Result<LinkId> {
      let id = LinkId(self.next_id);
      self.next_id += 1;
      self.uppers.insert(id, upper);
      self.record(Op::Attach(id));
      Ok(id)
   }

   fn detach(&mut self, link: LinkId) {
      self.uppers.remove(&link);
      self.record(Op::Detach(link));
   }

   fn bind(&mut self, link: LinkId, local: Address) -> Result<()> {
      self.known(link)?;
      self.record(Op::Bind(link, local));
      Ok(())
   }

   fn connect(&mut self, link: LinkId, remote: Address) -> Result<()> {
      self.known(link)?;
      self.record(Op::Connect(link, remote));
      Ok(())
   }

   fn listen(&mut self, link: LinkId) -> Result<()> {
      self.known(link)?;
      self.record(Op::Listen(link));
      Ok(())
   }

   fn disconnect(&mut self, link: LinkId) -> Result<()> {
      self.known(link)?;
      self.record(Op::Disconnect(link));
      Ok(())
   }

   fn mtu(&self, link: LinkId) -> Result<u16> {
      self.known(link)?;
      Ok(self.mtu)
   }

   fn send(&mut self, link: LinkId, fragment: Fragment) -> Result<Submit> {
      self.known(link)?;
      if self.refuse_after.is_some_and(|n| self.sent >= n) {
         return Err(ScoError::NoBuffers);
      }
      self.sent += 1;
      self.record(Op::Send(link, fragment));
      Ok(Submit::Queued)
   }
}

/// Upper that ignores everything and accepts every peer.
struct NullUpper;

impl ScoUpper for NullUpper {
   fn connected(&self, _link: LinkId) {}

   fn disconnected(&self, _link: LinkId, _err: LinkError) {}

   fn newconn(&self, _link: LinkId, _local: Address, _remote: Address, _new: LinkId) -> bool {
      true
   }

   fn complete(&self, _link: LinkId, _count: usize) {}

   fn input(&self, _link: LinkId, _frame: Frame) {}
}

pub struct MockStack {
   pub stack: BtStack,
   shared: Arc<Mutex<MockTransport>>,
   ops: mpsc::UnboundedReceiver<Op>,
}

impl MockStack {
   pub fn new(mtu: u16) -> Self {
      let (tx, rx) = mpsc::unbounded_channel();
      let shared = Arc::new(Mutex::new(MockTransport {
         next_id: 1,
         mtu,
         refuse_after: None,
         sent: 0,
         uppers: HashMap::new(),
         ops: tx,
      }));
      Self {
         stack: BtStack::from_shared(shared.clone()),
         shared,
         ops: rx,
      }
   }

   /// Refuses every send once `n` fragments have been accepted.
   pub fn refuse_after(&self, n: usize) {
      let mut t = self.shared.lock();
      t.refuse_after = Some(t.sent + n);
   }

   pub fn sink(&self) -> Arc<dyn ScoUpper> {
      Arc::new(NullUpper)
   }

   /// Upper registered for `link`.
   pub fn upper(&self, link: LinkId) -> Arc<dyn ScoUpper> {
      self.shared.lock().uppers[&link].clone()
   }

   /// Creates the link the stack would set up for a connection arriving
   /// on `listener`, reporting to the listener's upper.
   pub fn spawn_link(&self, listener: LinkId) -> LinkId {
      let mut t = self.shared.lock();
      let upper = t.uppers[&listener].clone();
      let id = LinkId(t.next_id);
      t.next_id += 1;
      t.uppers.insert(id, upper);
      id
   }

   /// Offers a connection from `remote` to `listener`. Returns the new link
   /// if the upper accepted it.
   pub fn incoming(&self, listener: LinkId, local: Address, remote: Address) -> Option<LinkId> {
      let upper = self.upper(listener);
      let id = {
         let mut t = self.shared.lock();
         let id = LinkId(t.next_id);
         t.next_id += 1;
         id
      };
      if !upper.newconn(listener, local, remote, id) {
         return None;
      }
      self.shared.lock().uppers.insert(id, upper);
      Some(id)
   }

   /// Links attached and not yet detached, in id order.
   pub fn live_links(&self) -> Vec<LinkId> {
      let mut ids: Vec<_> = self.shared.lock().uppers.keys().copied().collect();
      ids.sort();
      ids
   }

   pub async fn next_op(&mut self) -> Op {
      self.ops.recv().await.expect("mock stack dropped")
   }

   /// Waits for the next `n` sent fragments, skipping other operations.
   pub async fn sent(&mut self, n: usize) -> Vec<Fragment> {
      let mut frags = Vec::with_capacity(n);
      while frags.len() < n {
         if let Op::Send(_, frag) = self.next_op().await {
            frags.push(frag);
         }
      }
      frags
   }

   /// Waits until `link` is reported detached, skipping other operations.
   pub async fn detached(&mut self, link: LinkId) {
      loop {
         if let Op::Detach(id) = self.next_op().await
            && id == link
         {
            return;
         }
      }
   }
}
