//! Transmit pipeline.
//!
//! An output block handed over by the host is cut into MTU-sized fragments
//! by a deferred task and submitted to the link. The job completes when the
//! transport has acknowledged every fragment, or when the link is lost.

use log::{debug, trace, warn};

use crate::{
   bluetooth::transport::Submit,
   error::{Result, ScoError},
   sco::buffer::{AudioBuffer, Fragment},
};

/// How a host transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum TransferStatus {
   /// Every byte was transferred.
   Complete,
   /// The transport refused part of the block; the rest was dropped.
   Short,
   /// The link went down before the transfer finished.
   LinkLost,
}

/// Completion report for an output block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputDone {
   /// Bytes accepted by the transport.
   pub len: usize,
   pub status: TransferStatus,
}

pub type OutputCallback = Box<dyn FnOnce(OutputDone) + Send>;

struct TransmitJob {
   buffer: AudioBuffer,
   cursor: usize,
   remaining: usize,
   pending: usize,
   sent: usize,
   dropped: usize,
   callback: OutputCallback,
}

impl TransmitJob {
   fn finish(self, status: TransferStatus) {
      (self.callback)(OutputDone {
         len: self.sent,
         status,
      });
   }
}

/// Fragmenting sender for one device.
#[derive(Default)]
pub struct TransmitPipeline {
   job: Option<TransmitJob>,
   scheduled: bool,
   /// Fragments of a halted job still owed an acknowledgement.
   stale: usize,
}

impl TransmitPipeline {
   pub const fn new() -> Self {
      Self {
         job: None,
         scheduled: false,
         stale: 0,
      }
   }

   pub const fn is_active(&self) -> bool {
      self.job.is_some()
   }

   /// True while fragmentation work is waiting for the deferred task.
   pub const fn is_scheduled(&self) -> bool {
      self.scheduled
   }

   /// Fragments of the current job submitted and not yet acknowledged.
   pub fn pending(&self) -> usize {
      self.job.as_ref().map_or(0, |j| j.pending)
   }

   /// Records a new output block and schedules its fragmentation.
   pub fn start(
      &mut self,
      buffer: &AudioBuffer,
      offset: usize,
      size: usize,
      callback: OutputCallback,
   ) -> Result<()> {
      if self.job.is_some() {
         return Err(ScoError::Busy);
      }
      let range = buffer.region(offset, size)?;
      self.job = Some(TransmitJob {
         buffer: buffer.clone(),
         cursor: range.start,
         remaining: range.len(),
         pending: 0,
         sent: 0,
         dropped: 0,
         callback,
      });
      self.scheduled = true;
      Ok(())
   }

   /// Deferred task: cuts the block into fragments of at most `mtu` bytes
   /// and hands each to `submit`.
   pub fn run<F>(&mut self, mtu: usize, mut submit: F)
   where
      F: FnMut(Fragment) -> Result<Submit>,
   {
      if !std::mem::take(&mut self.scheduled) {
         return;
      }
      let Some(job) = self.job.as_mut() else {
         return;
      };
      if mtu == 0 {
         warn!("No MTU known, dropping {} byte block", job.remaining);
         job.dropped = job.remaining;
         job.remaining = 0;
      }

      while job.remaining > 0 {
         let len = job.remaining.min(mtu);
         let fragment = Fragment::new(&job.buffer, job.cursor..job.cursor + len);
         job.pending += 1;
         match submit(fragment) {
            Ok(Submit::Queued) => {},
            Ok(Submit::Completed) => job.pending -= 1,
            Err(e) => {
               job.pending -= 1;
               warn!("Fragment refused ({e}), dropping {} bytes", job.remaining);
               job.dropped = job.remaining;
               job.remaining = 0;
               break;
            },
         }
         job.cursor += len;
         job.remaining -= len;
         job.sent += len;
      }
      trace!("Block cut, {} fragments pending", job.pending);

      if job.pending == 0 {
         self.finish();
      }
   }

   /// The transport acknowledged `count` fragments.
   pub fn complete(&mut self, mut count: usize) {
      if self.stale > 0 {
         let absorbed = count.min(self.stale);
         self.stale -= absorbed;
         count -= absorbed;
      }
      if count == 0 {
         return;
      }
      let Some(job) = self.job.as_mut() else {
         debug!("Acknowledgement for {count} fragments with no transmit pending");
         return;
      };
      if count > job.pending {
         warn!(
            "Acknowledged {count} fragments but only {} pending",
            job.pending
         );
      }
      job.pending = job.pending.saturating_sub(count);
      if job.pending == 0 && job.remaining == 0 && !self.scheduled {
         self.finish();
      }
   }

   /// Stops output without notifying the host.
   pub fn halt(&mut self) {
      if let Some(job) = self.job.take() {
         debug!("Output halted with {} fragments pending", job.pending);
         self.stale += job.pending;
      }
      self.scheduled = false;
   }

   /// Forgets the job and every acknowledgement still owed, without
   /// notifying the host. Used once the link is torn down locally.
   pub fn clear(&mut self) {
      self.job = None;
      self.scheduled = false;
      self.stale = 0;
   }

   /// The link is gone: completes the outstanding job and forgets any
   /// acknowledgements still owed.
   pub fn abort(&mut self) {
      self.scheduled = false;
      self.stale = 0;
      if let Some(job) = self.job.take() {
         debug!("Completing output early, {} fragments unacknowledged", job.pending);
         job.finish(TransferStatus::LinkLost);
      }
   }

   fn finish(&mut self) {
      if let Some(job) = self.job.take() {
         let status = if job.dropped > 0 {
            TransferStatus::Short
         } else {
            TransferStatus::Complete
         };
         job.finish(status);
      }
   }
}
