//! Audio buffer ownership and fragment leases.
//!
//! The host audio framework allocates its play and record rings through the
//! driver. Transmitted fragments reference the play ring without copying; each
//! one holds a [`BufferLease`] that is counted on creation and uncounted when
//! the transport drops the fragment, so the ring can only be released once
//! the transport has let go of every byte.

use std::{
   fmt,
   ops::Range,
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
};

use log::{debug, warn};
use parking_lot::RwLock;

use crate::{
   bluetooth::transport::Frame,
   error::{Result, ScoError},
};

/// Direction of an audio stream, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Direction {
   #[strum(serialize = "play")]
   Play,
   #[strum(serialize = "record")]
   Record,
}

struct BufferInner {
   data: RwLock<Box<[u8]>>,
   leases: AtomicUsize,
}

/// Audio ring shared between the host and the driver.
///
/// This type is cheaply cloneable; clones refer to the same storage.
#[derive(Clone)]
pub struct AudioBuffer(Arc<BufferInner>);

impl fmt::Debug for AudioBuffer {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("AudioBuffer")
         .field("len", &self.len())
         .field("leases", &self.leases())
         .finish()
   }
}

impl AudioBuffer {
   /// Allocates a zeroed buffer of `len` bytes.
   pub fn new(len: usize) -> Self {
      Self(Arc::new(BufferInner {
         data: RwLock::new(vec![0u8; len].into_boxed_slice()),
         leases: AtomicUsize::new(0),
      }))
   }

   pub fn len(&self) -> usize {
      self.0.data.read().len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }

   /// Number of fragments currently referencing this buffer.
   pub fn leases(&self) -> usize {
      self.0.leases.load(Ordering::Acquire)
   }

   pub fn ptr_eq(&self, other: &Self) -> bool {
      Arc::ptr_eq(&self.0, &other.0)
   }

   /// Copies `data` into the buffer at `offset`.
   pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
      let mut buf = self.0.data.write();
      let dst = buf
         .get_mut(offset..offset.saturating_add(data.len()))
         .ok_or(ScoError::InvalidArgument("write outside buffer"))?;
      dst.copy_from_slice(data);
      Ok(())
   }

   /// Copies `len` bytes starting at `offset` out of the buffer.
   pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
      let buf = self.0.data.read();
      buf.get(offset..offset.saturating_add(len))
         .map(<[u8]>::to_vec)
         .ok_or(ScoError::InvalidArgument("read outside buffer"))
   }

   /// Validates that `offset..offset + len` is a non-empty range inside the buffer.
   pub(crate) fn region(&self, offset: usize, len: usize) -> Result<Range<usize>> {
      if len == 0 {
         return Err(ScoError::InvalidArgument("empty block"));
      }
      let end = offset
         .checked_add(len)
         .ok_or(ScoError::InvalidArgument("block outside buffer"))?;
      if end > self.len() {
         return Err(ScoError::InvalidArgument("block outside buffer"));
      }
      Ok(offset..end)
   }

   fn lease(&self) -> BufferLease {
      self.0.leases.fetch_add(1, Ordering::AcqRel);
      BufferLease(self.clone())
   }
}

/// Counted reference held by one in-flight fragment.
struct BufferLease(AudioBuffer);

impl Drop for BufferLease {
   fn drop(&mut self) {
      let old = (self.0).0.leases.fetch_sub(1, Ordering::AcqRel);
      debug_assert!(old > 0, "lease count underflow");
   }
}

/// One MTU-sized slice of the play ring, submitted to the transport as a
/// single frame.
///
/// Dropping the fragment returns its lease.
pub struct Fragment {
   lease: BufferLease,
   range: Range<usize>,
}

impl fmt::Debug for Fragment {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Fragment").field("range", &self.range).finish()
   }
}

impl Fragment {
   pub(crate) fn new(buffer: &AudioBuffer, range: Range<usize>) -> Self {
      Self {
         lease: buffer.lease(),
         range,
      }
   }

   pub fn len(&self) -> usize {
      self.range.len()
   }

   pub fn is_empty(&self) -> bool {
      self.range.is_empty()
   }

   /// Runs `f` over the fragment bytes without copying them.
   pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
      let buf = self.lease.0.0.data.read();
      f(&buf[self.range.clone()])
   }

   /// Copies the fragment into an owned frame.
   pub fn to_frame(&self) -> Frame {
      self.with_bytes(Frame::from_slice)
   }
}

/// Outcome of a release attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
   Freed,
   InUse(usize),
}

/// Tracks the buffers the host allocated through a device.
#[derive(Debug, Default)]
pub struct BufferPool {
   play: Option<AudioBuffer>,
   record: Option<AudioBuffer>,
   /// Replaced play buffers the transport still holds fragments of.
   retired: Vec<AudioBuffer>,
}

impl BufferPool {
   pub const fn new() -> Self {
      Self {
         play: None,
         record: None,
         retired: Vec::new(),
      }
   }

   /// Allocates a buffer for `direction`, replacing any previous one.
   pub fn allocate(&mut self, direction: Direction, size: usize) -> Result<AudioBuffer> {
      if size == 0 {
         return Err(ScoError::InvalidArgument("zero-sized buffer"));
      }
      let buffer = AudioBuffer::new(size);
      let slot = match direction {
         Direction::Play => &mut self.play,
         Direction::Record => &mut self.record,
      };
      if let Some(old) = slot.replace(buffer.clone())
         && old.leases() > 0
      {
         warn!(
            "Replacing {direction} buffer with {} fragments still outstanding",
            old.leases()
         );
         self.retired.push(old);
      }
      self.prune();
      debug!("Allocated {size} byte {direction} buffer");
      Ok(buffer)
   }

   pub fn play(&self) -> Option<&AudioBuffer> {
      self.play.as_ref()
   }

   pub fn record(&self) -> Option<&AudioBuffer> {
      self.record.as_ref()
   }

   /// Fragments still referencing the play buffer or a replaced one.
   pub fn outstanding(&self) -> usize {
      self.play.iter().chain(&self.retired).map(AudioBuffer::leases).sum()
   }

   /// Releases `buffer` unless transmitted fragments still reference it.
   pub fn try_release(&mut self, buffer: &AudioBuffer) -> Release {
      self.prune();
      if let Some(play) = &self.play
         && play.ptr_eq(buffer)
      {
         let leases = play.leases();
         if leases > 0 {
            return Release::InUse(leases);
         }
         self.play = None;
      } else if let Some(i) = self.retired.iter().position(|b| b.ptr_eq(buffer)) {
         let leases = self.retired[i].leases();
         if leases > 0 {
            return Release::InUse(leases);
         }
         self.retired.swap_remove(i);
      } else if self.record.as_ref().is_some_and(|r| r.ptr_eq(buffer)) {
         self.record = None;
      }
      Release::Freed
   }

   fn prune(&mut self) {
      self.retired.retain(|b| b.leases() > 0);
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_fragment_leases_follow_drop() {
      let buffer = AudioBuffer::new(96);
      let a = Fragment::new(&buffer, 0..48);
      let b = Fragment::new(&buffer, 48..96);
      assert_eq!(buffer.leases(), 2);

      drop(a);
      assert_eq!(buffer.leases(), 1);
      drop(b);
      assert_eq!(buffer.leases(), 0);
   }

   #[test]
   fn test_fragment_reads_without_copy() {
      let buffer = AudioBuffer::new(8);
      buffer.write(0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
      let frag = Fragment::new(&buffer, 2..5);

      assert_eq!(frag.len(), 3);
      assert_eq!(frag.to_frame().as_slice(), &[3, 4, 5]);

      // Host writes after the cut are visible to the fragment
      buffer.write(2, &[9]).unwrap();
      assert_eq!(frag.with_bytes(|b| b[0]), 9);
   }

   #[test]
   fn test_region_validation() {
      let buffer = AudioBuffer::new(100);
      assert_eq!(buffer.region(0, 100).unwrap(), 0..100);
      assert!(buffer.region(0, 0).is_err());
      assert!(buffer.region(60, 41).is_err());
      assert!(buffer.region(usize::MAX, 2).is_err());
   }

   #[test]
   fn test_release_refused_while_leased() {
      let mut pool = BufferPool::new();
      let play = pool.allocate(Direction::Play, 144).unwrap();
      let frag = Fragment::new(&play, 0..48);

      assert_eq!(pool.try_release(&play), Release::InUse(1));
      assert!(pool.play().is_some());

      drop(frag);
      assert_eq!(pool.try_release(&play), Release::Freed);
      assert!(pool.play().is_none());
   }

   #[test]
   fn test_record_release_is_immediate() {
      let mut pool = BufferPool::new();
      let record = pool.allocate(Direction::Record, 64).unwrap();
      assert_eq!(pool.try_release(&record), Release::Freed);
      assert!(pool.record().is_none());
      assert!(pool.allocate(Direction::Record, 0).is_err());
   }

   #[test]
   fn test_replaced_play_buffer_still_counted() {
      let mut pool = BufferPool::new();
      let old = pool.allocate(Direction::Play, 96).unwrap();
      let frags = [Fragment::new(&old, 0..48), Fragment::new(&old, 48..96)];

      let new = pool.allocate(Direction::Play, 96).unwrap();
      assert_eq!(pool.outstanding(), 2);
      assert_eq!(pool.try_release(&old), Release::InUse(2));
      assert_eq!(pool.try_release(&new), Release::Freed);
      assert_eq!(pool.outstanding(), 2);

      drop(frags);
      assert_eq!(pool.outstanding(), 0);
      assert_eq!(pool.try_release(&old), Release::Freed);
   }
}
