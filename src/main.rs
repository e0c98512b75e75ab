//! SCO loopback exerciser
//!
//! Attaches the configured listen and dial devices to an in-memory SCO
//! stack, connects them, streams pseudo-random PCM blocks from the dialing
//! side to the listening side and checks every byte arrives intact.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{error, info, warn};
use rand::RngCore;
use smol_str::SmolStr;
use tokio::{sync::Notify, sync::oneshot, time};

use btsco::{
   BtStack, Config, Direction, EventBus, LoopbackStack, Mode, Result, ScoDevice, ScoError,
   ScoEvent,
   sco::{params::AudioParams, rx::InputDone, tx::OutputDone},
};

/// Blocks carry this many fragments each
const FRAGMENTS_PER_BLOCK: usize = 4;

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting SCO loopback...");

   // Load configuration
   let config = Config::load()?;
   info!(
      "Loaded configuration with {} devices",
      config.devices.len()
   );

   // Create event channel
   let event_bus = EventProcessor::new();
   event_bus.clone().spawn_logger();

   let stack = BtStack::new(LoopbackStack::new(config.loopback_mtu));

   let mut gateway = None;
   let mut headset = None;
   for entry in &config.devices {
      let device_config = entry.to_device_config(&config)?;
      let slot = match device_config.mode {
         Mode::Listen => &mut gateway,
         Mode::Dial => &mut headset,
      };
      if slot.is_some() {
         warn!("Ignoring extra {} device {}", device_config.mode, entry.name);
         continue;
      }
      *slot = Some(ScoDevice::attach(&stack, device_config, event_bus.clone())?);
   }
   let (Some(gateway), Some(headset)) = (gateway, headset) else {
      error!("Configuration needs one listening and one dialing device");
      return Err(ScoError::InvalidArgument("incomplete device configuration"));
   };

   let outcome = run(&gateway, &headset, &config).await;
   if let Err(e) = &outcome {
      error!("Loopback failed: {e}");
   }

   for device in [&headset, &gateway] {
      device.close().await?;
      if let Err(e) = device.detach(false).await {
         warn!("{}: detach failed ({e}), forcing", device.name());
         device.detach(true).await?;
      }
   }
   outcome
}

async fn run(gateway: &ScoDevice, headset: &ScoDevice, config: &Config) -> Result<()> {
   // A page that reaches the stack before the listener waits for it
   let listening = tokio::spawn({
      let gateway = gateway.clone();
      async move { gateway.open().await }
   });
   headset.open().await?;
   listening
      .await
      .map_err(|_| ScoError::DeviceShutdown)??;

   for device in [gateway, headset] {
      device.set_params(Direction::Play, AudioParams::SCO);
      let params = device.set_params(Direction::Record, AudioParams::SCO);
      info!(
         "{}: {} Hz, {} bytes/s",
         device.name(),
         params.sample_rate,
         params.byte_rate()
      );
      info!("{}", device.info().await?.to_json());
   }

   let block = headset
      .round_block_size(usize::from(config.loopback_mtu) * FRAGMENTS_PER_BLOCK)
      .await?;
   let play = headset.allocate(Direction::Play, block).await?;
   let record = gateway.allocate(Direction::Record, block).await?;

   let mut rng = rand::thread_rng();
   let mut payload = vec![0u8; block];
   for n in 0..config.loopback_blocks {
      rng.fill_bytes(&mut payload);
      play.write(0, &payload)?;

      let (in_tx, in_rx) = oneshot::channel::<InputDone>();
      gateway
         .start_input(
            0,
            block,
            Box::new(move |done| {
               let _ = in_tx.send(done);
            }),
         )
         .await?;
      let (out_tx, out_rx) = oneshot::channel::<OutputDone>();
      headset
         .start_output(
            0,
            block,
            Box::new(move |done| {
               let _ = out_tx.send(done);
            }),
         )
         .await?;

      let sent = out_rx.await.map_err(|_| ScoError::Cancelled)?;
      let received = in_rx.await.map_err(|_| ScoError::Cancelled)?;
      if record.read(received.offset, received.len)? != payload[..sent.len] {
         error!("Block {n}: payload mismatch");
         return Err(ScoError::InvalidArgument("payload mismatch"));
      }
      info!(
         "Block {n}: {} bytes sent ({}), {} bytes received ({})",
         sent.len, sent.status, received.len, received.status
      );
   }

   headset.free(&play).await?;
   gateway.free(&record).await?;
   info!(
      "Loopback complete: {} blocks of {block} bytes",
      config.loopback_blocks
   );
   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(SmolStr, ScoEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<(SmolStr, ScoEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   fn dispatch(&self, (device, event): (SmolStr, ScoEvent)) {
      match event {
         ScoEvent::Connected { mtu } => info!("{device}: connected, mtu {mtu}"),
         ScoEvent::Disconnected(Some(err)) => warn!("{device}: disconnected ({err})"),
         ScoEvent::Disconnected(None) => info!("{device}: closed"),
         ScoEvent::GainChanged { port, level } => info!("{device}: {port} gain {level}"),
         ScoEvent::Detached => info!("{device}: detached"),
      }
   }

   fn spawn_logger(self: Arc<Self>) {
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            self.dispatch(event);
         }
      });
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, device: &SmolStr, event: ScoEvent) {
      self.queue.push((device.clone(), event));
      self.notifier.notify_waiters();
   }
}
