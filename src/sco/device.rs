//! SCO audio device.
//!
//! [`ScoDevice`] is the handle the host audio framework talks to. All device
//! state lives in a device task that drains two mailboxes in
//! priority order: events posted by the transport first, host commands
//! second. Fragmenting a pending output block runs only once both are empty.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, info, trace, warn};
use serde_json::json;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   time,
};

use crate::{
   bluetooth::transport::{BtStack, Frame, LinkId, LinkMode, ScoUpper},
   error::{LinkError, Result, ScoError},
   event::{EventSender, ScoEvent},
   sco::{
      buffer::{AudioBuffer, BufferPool, Direction, Release},
      link::{Connection, Gate, LinkState, Mode, Teardown},
      mixer::{Mixer, MixerControl, MixerDeviceInfo},
      params::{self, AudioDevice, AudioParams, EncodingInfo, Properties},
      rx::{InputCallback, ReceivePipeline},
      tx::{OutputCallback, TransmitPipeline},
   },
};

/// Maximum time a dial-mode `open` waits for the link
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Attempts to release a buffer still referenced by the transport
pub const DEFAULT_RELEASE_RETRIES: u32 = 10;
/// Delay between release attempts
pub const DEFAULT_RELEASE_INTERVAL: Duration = Duration::from_millis(10);
/// Valid RFCOMM channels
pub const RFCOMM_CHANNELS: std::ops::RangeInclusive<u8> = 1..=30;
/// Command channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;

/// Parameters of one attached device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
   pub name: SmolStr,
   pub local: Address,
   pub remote: Address,
   /// RFCOMM channel of the headset profile signalling the link.
   pub channel: u8,
   pub mode: Mode,
   pub connect_timeout: Duration,
   pub release_retries: u32,
   pub release_interval: Duration,
   pub speaker_gain: u8,
   pub mic_gain: u8,
}

impl DeviceConfig {
   pub fn new(
      name: impl Into<SmolStr>,
      local: Address,
      remote: Address,
      channel: u8,
      mode: Mode,
   ) -> Self {
      let mixer = Mixer::default();
      Self {
         name: name.into(),
         local,
         remote,
         channel,
         mode,
         connect_timeout: DEFAULT_CONNECT_TIMEOUT,
         release_retries: DEFAULT_RELEASE_RETRIES,
         release_interval: DEFAULT_RELEASE_INTERVAL,
         speaker_gain: mixer.speaker(),
         mic_gain: mixer.mic(),
      }
   }

   pub fn validate(&self) -> Result<()> {
      if !RFCOMM_CHANNELS.contains(&self.channel) {
         return Err(ScoError::InvalidChannel(self.channel));
      }
      if self.local == self.remote {
         return Err(ScoError::InvalidAddress(format!(
            "{} is both local and remote",
            self.local
         )));
      }
      Ok(())
   }
}

/// Snapshot of a device, as returned by [`ScoDevice::info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
   pub name: SmolStr,
   pub local: Address,
   pub remote: Address,
   pub channel: u8,
   pub mode: Mode,
   pub state: LinkState,
   pub mtu: u16,
   pub last_error: Option<LinkError>,
   pub speaker_gain: u8,
   pub mic_gain: u8,
   pub outstanding: usize,
}

impl DeviceInfo {
   pub fn to_json(&self) -> serde_json::Value {
      let mut info = json!({
         "name": self.name.as_str(),
         "local": self.local.to_string(),
         "remote": self.remote.to_string(),
         "channel": self.channel,
         "mode": self.mode,
         "state": self.state,
         "speaker_gain": self.speaker_gain,
         "mic_gain": self.mic_gain,
      });
      if self.state == LinkState::Open {
         info["mtu"] = json!(self.mtu);
         info["outstanding"] = json!(self.outstanding);
      }
      info["last_error"] = match self.last_error {
         Some(err) => json!(err.to_string()),
         None => json!(null),
      };
      info
   }
}

// === Transport events ===

#[derive(Debug)]
enum NetEvent {
   Accepted(LinkId),
   Connected(LinkId),
   Disconnected(LinkId, LinkError),
   Complete(LinkId, usize),
   Input(LinkId, Frame),
   LinkMode(LinkId, LinkMode),
}

/// Upper registered with the stack for every link of one device.
struct LinkEvents {
   tx: mpsc::UnboundedSender<NetEvent>,
   gate: Arc<Gate>,
}

impl LinkEvents {
   fn post(&self, event: NetEvent) {
      if self.tx.send(event).is_err() {
         trace!("Device gone, dropping transport event");
      }
   }
}

impl ScoUpper for LinkEvents {
   fn connecting(&self, link: LinkId) {
      trace!("{link} connecting");
   }

   fn connected(&self, link: LinkId) {
      self.post(NetEvent::Connected(link));
   }

   fn disconnected(&self, link: LinkId, err: LinkError) {
      self.post(NetEvent::Disconnected(link, err));
   }

   fn newconn(&self, link: LinkId, local: Address, remote: Address, new_link: LinkId) -> bool {
      if !self.gate.admit(remote) {
         return false;
      }
      debug!("{link} on {local} accepting {remote} as {new_link}");
      self.post(NetEvent::Accepted(new_link));
      true
   }

   fn complete(&self, link: LinkId, count: usize) {
      self.post(NetEvent::Complete(link, count));
   }

   fn linkmode(&self, link: LinkId, mode: LinkMode) {
      self.post(NetEvent::LinkMode(link, mode));
   }

   fn input(&self, link: LinkId, frame: Frame) {
      self.post(NetEvent::Input(link, frame));
   }
}

// === Commands ===

enum Command {
   Open(oneshot::Sender<Result<()>>),
   AbortOpen(oneshot::Sender<Result<()>>),
   Close(oneshot::Sender<()>),
   StartOutput {
      offset: usize,
      size: usize,
      callback: OutputCallback,
      reply: oneshot::Sender<Result<()>>,
   },
   StartInput {
      offset: usize,
      size: usize,
      callback: InputCallback,
      reply: oneshot::Sender<Result<()>>,
   },
   HaltOutput,
   HaltInput,
   Allocate {
      direction: Direction,
      size: usize,
      reply: oneshot::Sender<Result<AudioBuffer>>,
   },
   Free(AudioBuffer, oneshot::Sender<Release>),
   RoundBlockSize(usize, oneshot::Sender<usize>),
   GetMixer(u32, oneshot::Sender<Result<MixerControl>>),
   SetMixer(MixerControl, oneshot::Sender<Result<()>>),
   Info(oneshot::Sender<DeviceInfo>),
   Detach {
      force: bool,
      reply: oneshot::Sender<Result<()>>,
   },
}

// === Device handle ===

struct DeviceShared {
   name: SmolStr,
   mode: Mode,
   connect_timeout: Duration,
   release_retries: u32,
   release_interval: Duration,
   inbox: mpsc::Sender<Command>,
}

/// Host-facing handle to one attached SCO device.
///
/// This type is cheaply cloneable. Completion callbacks passed to
/// [`start_output`](Self::start_output) and [`start_input`](Self::start_input)
/// run on the device task and must not block.
#[derive(Clone)]
pub struct ScoDevice(Arc<DeviceShared>);

impl ScoDevice {
   /// Attaches a device to `stack` and starts its task.
   pub fn attach(stack: &BtStack, config: DeviceConfig, events: EventSender) -> Result<Self> {
      config.validate()?;
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let shared = DeviceShared {
         name: config.name.clone(),
         mode: config.mode,
         connect_timeout: config.connect_timeout,
         release_retries: config.release_retries,
         release_interval: config.release_interval,
         inbox: command_tx,
      };
      info!(
         "Attaching {} ({} -> {}, channel {}, {})",
         config.name, config.local, config.remote, config.channel, config.mode
      );
      tokio::spawn(DeviceActor::new(stack.clone(), config, events, command_rx).run());
      Ok(Self(Arc::new(shared)))
   }

   pub fn name(&self) -> &SmolStr {
      &self.0.name
   }

   async fn send(&self, cmd: Command) -> Result<()> {
      self
         .0
         .inbox
         .send(cmd)
         .await
         .map_err(|_| ScoError::DeviceShutdown)
   }

   async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self.send(make(tx)).await?;
      rx.await.map_err(|_| ScoError::DeviceShutdown)
   }

   /// Brings the link up. In listen mode this waits until the peer connects
   /// or [`close`](Self::close) is called; in dial mode it gives up after
   /// the configured connect timeout.
   pub async fn open(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self.send(Command::Open(tx)).await?;
      let outcome = match self.0.mode {
         Mode::Listen => rx.await,
         Mode::Dial => match time::timeout(self.0.connect_timeout, rx).await {
            Ok(outcome) => outcome,
            Err(_) => {
               warn!(
                  "{}: no connection after {:?}",
                  self.0.name, self.0.connect_timeout
               );
               return self.request(Command::AbortOpen).await?;
            },
         },
      };
      outcome.map_err(|_| ScoError::DeviceShutdown)?
   }

   /// Tears the link down. Outstanding transfers are dropped without
   /// completing.
   pub async fn close(&self) -> Result<()> {
      self.request(Command::Close).await
   }

   /// Normalizes `params` to the link format and returns what was applied.
   pub fn set_params(&self, direction: Direction, params: AudioParams) -> AudioParams {
      let applied = AudioParams::normalize(params);
      debug!(
         "{}: {direction} format {} Hz, {} ch, {}-bit {}",
         self.0.name, applied.sample_rate, applied.channels, applied.precision, applied.encoding
      );
      applied
   }

   pub fn query_encoding(&self, index: usize) -> Result<EncodingInfo> {
      params::query_encoding(index)
   }

   /// Rounds a host block size to a whole number of link fragments.
   pub async fn round_block_size(&self, size: usize) -> Result<usize> {
      self
         .request(|reply| Command::RoundBlockSize(size, reply))
         .await
   }

   /// Sends `size` bytes of the play buffer starting at `offset`.
   pub async fn start_output(
      &self,
      offset: usize,
      size: usize,
      callback: OutputCallback,
   ) -> Result<()> {
      self
         .request(|reply| Command::StartOutput {
            offset,
            size,
            callback,
            reply,
         })
         .await?
   }

   /// Fills `size` bytes of the record buffer starting at `offset`.
   pub async fn start_input(
      &self,
      offset: usize,
      size: usize,
      callback: InputCallback,
   ) -> Result<()> {
      self
         .request(|reply| Command::StartInput {
            offset,
            size,
            callback,
            reply,
         })
         .await?
   }

   pub async fn halt_output(&self) -> Result<()> {
      self.send(Command::HaltOutput).await
   }

   pub async fn halt_input(&self) -> Result<()> {
      self.send(Command::HaltInput).await
   }

   pub async fn allocate(&self, direction: Direction, size: usize) -> Result<AudioBuffer> {
      self
         .request(|reply| Command::Allocate {
            direction,
            size,
            reply,
         })
         .await?
   }

   /// Releases a buffer, waiting a bounded time for the transport to let go
   /// of any fragments still referencing it.
   pub async fn free(&self, buffer: &AudioBuffer) -> Result<()> {
      let mut attempt = 0;
      loop {
         match self
            .request(|reply| Command::Free(buffer.clone(), reply))
            .await?
         {
            Release::Freed => return Ok(()),
            Release::InUse(n) if attempt >= self.0.release_retries => {
               warn!("{}: buffer still referenced by {n} fragments", self.0.name);
               return Err(ScoError::BufferInUse(n));
            },
            Release::InUse(n) => {
               debug!("{}: waiting for {n} fragments", self.0.name);
               attempt += 1;
               time::sleep(self.0.release_interval).await;
            },
         }
      }
   }

   pub async fn get_mixer(&self, port: u32) -> Result<MixerControl> {
      self.request(|reply| Command::GetMixer(port, reply)).await?
   }

   pub async fn set_mixer(&self, ctl: MixerControl) -> Result<()> {
      self.request(|reply| Command::SetMixer(ctl, reply)).await?
   }

   pub fn describe_mixer(&self, index: u32) -> Result<MixerDeviceInfo> {
      Mixer::describe(index)
   }

   pub fn properties(&self) -> Properties {
      Properties { full_duplex: true }
   }

   pub fn audio_device(&self) -> AudioDevice {
      params::AUDIO_DEVICE
   }

   pub async fn info(&self) -> Result<DeviceInfo> {
      self.request(Command::Info).await
   }

   /// Shuts the device down. While fragments are outstanding this retries a
   /// bounded number of times, then fails with [`ScoError::Busy`] unless
   /// `force` is set.
   pub async fn detach(&self, force: bool) -> Result<()> {
      let mut attempt = 0;
      loop {
         let last = attempt >= self.0.release_retries;
         match self
            .request(|reply| Command::Detach {
               force: force && last,
               reply,
            })
            .await?
         {
            Err(ScoError::Busy) if !last => {
               attempt += 1;
               time::sleep(self.0.release_interval).await;
            },
            result => return result,
         }
      }
   }
}

// === Device actor ===

struct DeviceActor {
   name: SmolStr,
   local: Address,
   remote: Address,
   channel: u8,
   stack: BtStack,
   events: EventSender,
   upper: Arc<LinkEvents>,
   command_rx: mpsc::Receiver<Command>,
   net_rx: mpsc::UnboundedReceiver<NetEvent>,

   // State
   conn: Connection,
   tx: TransmitPipeline,
   rx: ReceivePipeline,
   pool: BufferPool,
   mixer: Mixer,
}

impl DeviceActor {
   fn new(
      stack: BtStack,
      config: DeviceConfig,
      events: EventSender,
      command_rx: mpsc::Receiver<Command>,
   ) -> Self {
      let conn = Connection::new(config.local, config.remote, config.mode);
      let (net_tx, net_rx) = mpsc::unbounded_channel();
      let upper = Arc::new(LinkEvents {
         tx: net_tx,
         gate: conn.gate(),
      });
      Self {
         name: config.name,
         local: config.local,
         remote: config.remote,
         channel: config.channel,
         stack,
         events,
         upper,
         command_rx,
         net_rx,
         conn,
         tx: TransmitPipeline::new(),
         rx: ReceivePipeline::new(),
         pool: BufferPool::new(),
         mixer: Mixer::new(config.speaker_gain, config.mic_gain),
      }
   }

   async fn run(mut self) {
      debug!("{}: device task started", self.name);
      loop {
         select! {
            biased;
            Some(event) = self.net_rx.recv() => self.handle_net(event),
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  debug!("{}: all handles dropped", self.name);
                  self.close();
                  break;
               };
               if !self.handle_command(cmd) {
                  break;
               }
            }
            () = std::future::ready(()), if self.tx.is_scheduled() => self.transmit(),
         }
      }
      debug!("{}: device task stopped", self.name);
   }

   fn emit(&self, event: ScoEvent) {
      self.events.emit(&self.name, event);
   }

   fn owns(&self, link: LinkId) -> bool {
      self.conn.active().is_some_and(|h| h.id() == link)
   }

   fn handle_net(&mut self, event: NetEvent) {
      match event {
         NetEvent::Accepted(link) => self.conn.accepted(&self.stack, link),
         NetEvent::Connected(link) => {
            if let Some(mtu) = self.conn.connected(link) {
               self.emit(ScoEvent::Connected { mtu });
            }
         },
         NetEvent::Disconnected(link, err) => match self.conn.disconnected(link, err) {
            Teardown::Stale => {},
            Teardown::Failed | Teardown::Lost => {
               self.tx.abort();
               self.rx.abort();
               self.emit(ScoEvent::Disconnected(Some(err)));
            },
         },
         NetEvent::Complete(link, count) => {
            if self.owns(link) {
               self.tx.complete(count);
            } else {
               debug!("{}: ignoring {count} acks from stale {link}", self.name);
            }
         },
         NetEvent::Input(link, frame) => {
            if self.owns(link) {
               trace!("← {link}: {}", hex::encode(&frame));
               self.rx.input(frame);
            } else {
               debug!("{}: ignoring frame from stale {link}", self.name);
            }
         },
         NetEvent::LinkMode(link, mode) => {
            debug!(
               "{}: {link} mode auth={} encrypt={} secure={}",
               self.name,
               mode.is_authenticated(),
               mode.is_encrypted(),
               mode.is_secure()
            );
         },
      }
   }

   /// Returns false once the device is detached.
   fn handle_command(&mut self, cmd: Command) -> bool {
      match cmd {
         Command::Open(waiter) => {
            let upper: Arc<dyn ScoUpper> = self.upper.clone();
            match self.conn.open(&self.stack, upper) {
               Ok(()) => self.conn.set_waiter(waiter),
               Err(e) => {
                  let _ = waiter.send(Err(e));
               },
            }
         },
         Command::AbortOpen(reply) => {
            let _ = reply.send(self.conn.abort_open());
         },
         Command::Close(reply) => {
            self.close();
            let _ = reply.send(());
         },
         Command::StartOutput {
            offset,
            size,
            callback,
            reply,
         } => {
            let _ = reply.send(self.start_output(offset, size, callback));
         },
         Command::StartInput {
            offset,
            size,
            callback,
            reply,
         } => {
            let _ = reply.send(self.start_input(offset, size, callback));
         },
         Command::HaltOutput => self.tx.halt(),
         Command::HaltInput => self.rx.halt(),
         Command::Allocate {
            direction,
            size,
            reply,
         } => {
            let _ = reply.send(self.pool.allocate(direction, size));
         },
         Command::Free(buffer, reply) => {
            let _ = reply.send(self.pool.try_release(&buffer));
         },
         Command::RoundBlockSize(size, reply) => {
            let rounded = params::round_block_size(size, usize::from(self.conn.mtu()));
            let _ = reply.send(rounded);
         },
         Command::GetMixer(port, reply) => {
            let _ = reply.send(self.mixer.get(port));
         },
         Command::SetMixer(ctl, reply) => {
            let result = self.mixer.set(&ctl).map(|(port, level)| {
               debug!("{}: {port} gain {level}", self.name);
               self.emit(ScoEvent::GainChanged { port, level });
            });
            let _ = reply.send(result);
         },
         Command::Info(reply) => {
            let _ = reply.send(self.info());
         },
         Command::Detach { force, reply } => {
            let result = self.detach(force);
            let done = result.is_ok();
            if done {
               info!("{}: detached", self.name);
               self.emit(ScoEvent::Detached);
            }
            let _ = reply.send(result);
            return !done;
         },
      }
      true
   }

   fn start_output(&mut self, offset: usize, size: usize, callback: OutputCallback) -> Result<()> {
      if !self.conn.is_open() {
         return Err(ScoError::NotConnected);
      }
      let buffer = self
         .pool
         .play()
         .ok_or(ScoError::InvalidArgument("no play buffer allocated"))?;
      self.tx.start(buffer, offset, size, callback)?;
      trace!("{}: output {size} bytes at {offset}", self.name);
      Ok(())
   }

   fn start_input(&mut self, offset: usize, size: usize, callback: InputCallback) -> Result<()> {
      if !self.conn.is_open() {
         return Err(ScoError::NotConnected);
      }
      let buffer = self
         .pool
         .record()
         .ok_or(ScoError::InvalidArgument("no record buffer allocated"))?;
      self.rx.start(buffer, offset, size, callback)?;
      trace!("{}: input {size} bytes at {offset}", self.name);
      Ok(())
   }

   /// Deferred fragmentation of the pending output block.
   fn transmit(&mut self) {
      let mtu = usize::from(self.conn.mtu());
      let Some(link) = self.conn.active() else {
         self.tx.abort();
         return;
      };
      self.tx.run(mtu, |fragment| link.send(fragment));
   }

   fn close(&mut self) {
      self.tx.clear();
      self.rx.halt();
      if self.conn.close() {
         self.emit(ScoEvent::Disconnected(None));
      }
   }

   fn detach(&mut self, force: bool) -> Result<()> {
      self.close();
      let outstanding = self.pool.outstanding();
      if outstanding > 0 {
         if !force {
            return Err(ScoError::Busy);
         }
         warn!(
            "{}: forcing detach with {outstanding} fragments outstanding",
            self.name
         );
      }
      Ok(())
   }

   fn info(&self) -> DeviceInfo {
      DeviceInfo {
         name: self.name.clone(),
         local: self.local,
         remote: self.remote,
         channel: self.channel,
         mode: self.conn.mode(),
         state: self.conn.state(),
         mtu: self.conn.mtu(),
         last_error: self.conn.last_error(),
         speaker_gain: self.mixer.speaker(),
         mic_gain: self.mixer.mic(),
         outstanding: self.pool.outstanding(),
      }
   }
}
