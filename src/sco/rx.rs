//! Receive pipeline.
//!
//! Frames arrive from the link whenever the peer sends them; the host asks
//! for input one block at a time. Frames are copied into the pending block
//! in arrival order, and the tail of a frame that overruns the block is kept
//! for the next request.

use log::{debug, trace};

use crate::{
   bluetooth::transport::Frame,
   error::{Result, ScoError},
   sco::{buffer::AudioBuffer, tx::TransferStatus},
};

/// Completion report for an input block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputDone {
   /// Start of the block inside the record buffer.
   pub offset: usize,
   /// Bytes written into the block.
   pub len: usize,
   pub status: TransferStatus,
}

pub type InputCallback = Box<dyn FnOnce(InputDone) + Send>;

struct ReceiveJob {
   buffer: AudioBuffer,
   offset: usize,
   cursor: usize,
   wanted: usize,
   callback: InputCallback,
}

impl ReceiveJob {
   fn finish(self, status: TransferStatus) {
      (self.callback)(InputDone {
         offset: self.offset,
         len: self.cursor - self.offset,
         status,
      });
   }
}

/// Reassembling receiver for one device.
#[derive(Default)]
pub struct ReceivePipeline {
   job: Option<ReceiveJob>,
   carry: Option<Frame>,
}

impl ReceivePipeline {
   pub const fn new() -> Self {
      Self {
         job: None,
         carry: None,
      }
   }

   pub const fn is_active(&self) -> bool {
      self.job.is_some()
   }

   /// Bytes the pending request still wants.
   pub fn wanted(&self) -> usize {
      self.job.as_ref().map_or(0, |j| j.wanted)
   }

   /// Bytes held over from the last frame.
   pub fn carried(&self) -> usize {
      self.carry.as_ref().map_or(0, |c| c.len())
   }

   /// Records a new input block, serving it from the carry-over first.
   pub fn start(
      &mut self,
      buffer: &AudioBuffer,
      offset: usize,
      size: usize,
      callback: InputCallback,
   ) -> Result<()> {
      if self.job.is_some() {
         return Err(ScoError::Busy);
      }
      let range = buffer.region(offset, size)?;
      self.job = Some(ReceiveJob {
         buffer: buffer.clone(),
         offset: range.start,
         cursor: range.start,
         wanted: range.len(),
         callback,
      });
      if let Some(carry) = self.carry.take() {
         trace!("Serving {} carried bytes", carry.len());
         self.input(carry);
      }
      Ok(())
   }

   /// A frame arrived from the link.
   pub fn input(&mut self, frame: Frame) {
      let Some(job) = self.job.as_mut() else {
         trace!("No input pending, discarding {} bytes", frame.len());
         return;
      };

      let n = job.wanted.min(frame.len());
      if let Err(e) = job.buffer.write(job.cursor, &frame[..n]) {
         debug!("Record buffer went away under the pipeline: {e}");
      }
      job.cursor += n;
      job.wanted -= n;

      if frame.len() > n
         && self.carry.replace(Frame::from_slice(&frame[n..])).is_some()
      {
         debug!("Dropping previous carry-over");
      }

      if job.wanted == 0
         && let Some(job) = self.job.take()
      {
         job.finish(TransferStatus::Complete);
      }
   }

   /// Stops input without notifying the host.
   pub fn halt(&mut self) {
      self.job = None;
      self.carry = None;
   }

   /// The link is gone: completes the outstanding request short.
   pub fn abort(&mut self) {
      self.carry = None;
      if let Some(job) = self.job.take() {
         debug!("Completing input early, {} bytes missing", job.wanted);
         job.finish(TransferStatus::LinkLost);
      }
   }
}

#[cfg(test)]
mod tests {
   use std::sync::{Arc, Mutex};

   use rand::{Rng, SeedableRng, rngs::StdRng};

   use super::*;

   type Log = Arc<Mutex<Vec<InputDone>>>;

   fn recorder(log: &Log) -> InputCallback {
      let sink = log.clone();
      Box::new(move |done| sink.lock().unwrap().push(done))
   }

   fn frame(fill: u8, len: usize) -> Frame {
      Frame::from_elem(fill, len)
   }

   #[test]
   fn test_frames_split_across_requests() {
      let buffer = AudioBuffer::new(200);
      let log = Log::default();
      let mut rx = ReceivePipeline::new();
      rx.start(&buffer, 0, 100, recorder(&log)).unwrap();

      rx.input(frame(0xAA, 60));
      assert_eq!(rx.wanted(), 40);
      assert!(log.lock().unwrap().is_empty());

      rx.input(frame(0xBB, 60));
      assert_eq!(rx.wanted(), 0);
      assert_eq!(rx.carried(), 20);
      assert_eq!(
         *log.lock().unwrap(),
         [InputDone {
            offset: 0,
            len: 100,
            status: TransferStatus::Complete
         }]
      );
      let data = buffer.read(0, 100).unwrap();
      assert!(data[..60].iter().all(|&b| b == 0xAA));
      assert!(data[60..].iter().all(|&b| b == 0xBB));

      // Next request starts with the 20 carried bytes
      rx.start(&buffer, 100, 100, recorder(&log)).unwrap();
      assert_eq!(rx.wanted(), 80);
      assert_eq!(rx.carried(), 0);
      assert!(buffer.read(100, 20).unwrap().iter().all(|&b| b == 0xBB));
   }

   #[test]
   fn test_frame_without_request_is_discarded() {
      let buffer = AudioBuffer::new(48);
      let log = Log::default();
      let mut rx = ReceivePipeline::new();
      rx.input(frame(1, 48));
      assert_eq!(rx.carried(), 0);

      rx.start(&buffer, 0, 48, recorder(&log)).unwrap();
      assert_eq!(rx.wanted(), 48);
   }

   #[test]
   fn test_carry_fully_serves_small_request() {
      let buffer = AudioBuffer::new(100);
      let log = Log::default();
      let mut rx = ReceivePipeline::new();
      rx.start(&buffer, 0, 10, recorder(&log)).unwrap();
      rx.input(frame(7, 48));
      assert_eq!(rx.carried(), 38);

      rx.start(&buffer, 10, 20, recorder(&log)).unwrap();
      assert_eq!(log.lock().unwrap().len(), 2);
      assert_eq!(rx.carried(), 18);
      assert!(!rx.is_active());
   }

   #[test]
   fn test_halt_discards_carry() {
      let buffer = AudioBuffer::new(100);
      let log = Log::default();
      let mut rx = ReceivePipeline::new();
      rx.start(&buffer, 0, 10, recorder(&log)).unwrap();
      rx.input(frame(7, 48));
      rx.halt();
      assert_eq!(rx.carried(), 0);

      rx.start(&buffer, 0, 50, recorder(&log)).unwrap();
      rx.halt();
      rx.input(frame(7, 48));
      assert_eq!(log.lock().unwrap().len(), 1);
   }

   #[test]
   fn test_abort_reports_partial_block() {
      let buffer = AudioBuffer::new(100);
      let log = Log::default();
      let mut rx = ReceivePipeline::new();
      rx.start(&buffer, 0, 100, recorder(&log)).unwrap();
      rx.input(frame(3, 30));
      rx.abort();
      rx.abort();
      assert_eq!(
         *log.lock().unwrap(),
         [InputDone {
            offset: 0,
            len: 30,
            status: TransferStatus::LinkLost
         }]
      );
   }

   #[test]
   fn test_delivery_preserves_arrival_order() {
      let mut rng = StdRng::seed_from_u64(0x5c0);
      let buffer = AudioBuffer::new(120);
      let log = Log::default();
      let mut rx = ReceivePipeline::new();

      let mut received = Vec::new();
      let mut delivered = Vec::new();
      let mut counter = 0u8;

      for _ in 0..200 {
         if !rx.is_active() {
            if let Some(done) = log.lock().unwrap().pop() {
               delivered.extend(buffer.read(done.offset, done.len).unwrap());
            }
            // Completed blocks are read out before the next request reuses the region
            let size = rng.gen_range(1..=120);
            rx.start(&buffer, 0, size, recorder(&log)).unwrap();
            if !rx.is_active()
               && let Some(done) = log.lock().unwrap().pop()
            {
               delivered.extend(buffer.read(done.offset, done.len).unwrap());
               continue;
            }
         }
         let len = rng.gen_range(1..=64);
         let bytes: Frame = (0..len)
            .map(|_| {
               counter = counter.wrapping_add(1);
               counter
            })
            .collect();
         received.extend_from_slice(&bytes);
         rx.input(bytes);
      }
      if let Some(done) = log.lock().unwrap().pop() {
         delivered.extend(buffer.read(done.offset, done.len).unwrap());
      }

      // Everything delivered is a prefix of what arrived; what is missing is
      // the carry-over and the partially filled request.
      assert!(!delivered.is_empty());
      assert_eq!(delivered[..], received[..delivered.len()]);
      let outstanding = received.len() - delivered.len();
      assert!(outstanding <= rx.carried() + 120);
   }
}
