//! Single-owner link manager.
//!
//! All link state (adapter tracker, device registry, connection lifecycle and
//! pending flags) lives inside [`ManagerActor`] and is only touched from its
//! task. Radio operations run on spawned tasks and report back through the
//! loopback channel, so a slow connect never stalls snapshots or notifications.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::json;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::{
   bluetooth::transport::{AdapterNotice, Capability, Inbound, LinkConfig, Payload, Transport},
   error::{LinkError, Result},
   event::{EventSender, LinkEvent},
   link::{
      adapter::{AdapterState, AdapterStateTracker},
      connection::{ConnectPlan, ConnectionManager, ConnectionPhase},
      device::{Device, DeviceId},
      discovery::DiscoverySession,
      permission::PermissionGate,
      registry::DeviceRegistry,
      stream::{DataStreamSubscriber, StreamSink},
   },
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;
/// Time allowed for the final disconnect during shutdown
const SHUTDOWN_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Operations currently in flight; drives the busy indicator upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingOps {
   pub refresh: bool,
   pub discovery: bool,
   pub connect: bool,
   pub disconnect: bool,
}

/// Read-only view of the link state handed to presentation.
#[derive(Debug, Clone)]
pub struct Snapshot {
   pub adapter_enabled: Option<bool>,
   pub adapter_state: AdapterState,
   pub devices: Vec<Device>,
   pub connected_device: Option<Device>,
   pub connection: ConnectionPhase,
   /// Inbound data is attached to the connected device.
   pub streaming: bool,
   pub latest_inbound: Option<Payload>,
   /// Frames received since the current session attached.
   pub inbound_frames: u64,
   pub pending: PendingOps,
}

impl Snapshot {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "adapter_enabled": self.adapter_enabled,
         "adapter_state": self.adapter_state,
         "devices": self.devices,
         "connected_device": self.connected_device,
         "connection": self.connection,
         "streaming": self.streaming,
         "inbound_frames": self.inbound_frames,
         "latest_inbound": self
            .latest_inbound
            .as_ref()
            .map(|p| String::from_utf8_lossy(p).into_owned()),
         "pending": self.pending,
      })
   }
}

// === Commands ===

type Reply<T> = oneshot::Sender<Result<T>>;

enum ManagerCommand {
   // User commands
   RefreshBonded(Reply<usize>),
   Discover(Reply<Vec<Device>>),
   Connect(DeviceId, Reply<bool>),
   Disconnect(Option<DeviceId>, Reply<bool>),
   Send(Vec<u8>, Reply<()>),
   ClearDevices(oneshot::Sender<()>),
   RefreshAdapter(Reply<bool>),
   GetSnapshot(oneshot::Sender<Snapshot>),
   Shutdown(oneshot::Sender<()>),

   // Transport notifications
   Adapter(AdapterNotice),
   LinkLost(DeviceId, SmolStr),

   // Completions of spawned operations
   BondedListed(Result<Vec<Device>>, Reply<usize>),
   DiscoveryFinished(Result<Vec<Device>>, Reply<Vec<Device>>),
   ConnectPermitted(DeviceId, bool, Reply<bool>),
   ConnectFinished(DeviceId, Result<bool>, Reply<bool>),
   DisconnectFinished(DeviceId, Result<bool>, Reply<bool>),
}

// === Handle ===

/// Cloneable handle to the link manager.
#[derive(Clone)]
pub struct BluetoothManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl BluetoothManager {
   pub fn new(transport: Arc<dyn Transport>, config: LinkConfig, event_tx: EventSender) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(ManagerActor::new(transport, config, event_tx, command_rx).run());
      Self { inbox: command_tx }
   }

   async fn request<T>(
      &self,
      make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
   ) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| LinkError::ManagerShutdown)?;
      rx.await.map_err(|_| LinkError::ManagerShutdown)
   }

   /// Re-enumerates bonded devices; returns how many are bonded.
   pub async fn refresh_bonded(&self) -> Result<usize> {
      self.request(ManagerCommand::RefreshBonded).await?
   }

   pub async fn discover(&self) -> Result<Vec<Device>> {
      self.request(ManagerCommand::Discover).await?
   }

   pub async fn connect(&self, id: DeviceId) -> Result<bool> {
      self
         .request(|tx| ManagerCommand::Connect(id, tx))
         .await?
   }

   /// Disconnects the active session.
   pub async fn disconnect(&self) -> Result<bool> {
      self
         .request(|tx| ManagerCommand::Disconnect(None, tx))
         .await?
   }

   /// Disconnects `id` if it is the active session, otherwise reports `false`.
   pub async fn disconnect_device(&self, id: DeviceId) -> Result<bool> {
      self
         .request(|tx| ManagerCommand::Disconnect(Some(id), tx))
         .await?
   }

   pub async fn send(&self, data: Vec<u8>) -> Result<()> {
      self
         .request(|tx| ManagerCommand::Send(data, tx))
         .await?
   }

   pub async fn clear_devices(&self) -> Result<()> {
      self.request(ManagerCommand::ClearDevices).await
   }

   pub async fn refresh_adapter(&self) -> Result<bool> {
      self.request(ManagerCommand::RefreshAdapter).await?
   }

   pub async fn snapshot(&self) -> Result<Snapshot> {
      self.request(ManagerCommand::GetSnapshot).await
   }

   /// Releases every subscription, disconnects the active peer and stops the actor.
   pub async fn shutdown(&self) -> Result<()> {
      self.request(ManagerCommand::Shutdown).await
   }
}

// === Manager Actor ===

struct ManagerActor {
   transport: Arc<dyn Transport>,
   gate: PermissionGate,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,
   tasks: JoinSet<()>,
   shutdown_reply: Option<oneshot::Sender<()>>,

   // State
   adapter: AdapterStateTracker,
   registry: DeviceRegistry,
   connection: ConnectionManager,
   pending: PendingOps,
}

impl ManagerActor {
   fn new(
      transport: Arc<dyn Transport>,
      config: LinkConfig,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let subscriber = DataStreamSubscriber::new(Self::stream_sink(&event_tx, &loopback_tx));
      Self {
         gate: PermissionGate::new(transport.clone()),
         transport,
         event_tx,
         command_rx,
         loopback_rx,
         loopback_tx,
         tasks: JoinSet::new(),
         shutdown_reply: None,
         adapter: AdapterStateTracker::new(),
         registry: DeviceRegistry::new(),
         connection: ConnectionManager::new(config, subscriber),
         pending: PendingOps::default(),
      }
   }

   /// Frames go straight to the event bus; link loss is routed through the actor.
   fn stream_sink(event_tx: &EventSender, loopback: &mpsc::Sender<ManagerCommand>) -> StreamSink {
      let event_tx = event_tx.clone();
      let loopback = loopback.clone();
      Arc::new(move |id: &DeviceId, inbound: &Inbound| match inbound {
         Inbound::Frame(payload) => {
            event_tx.emit(LinkEvent::Inbound(id.clone(), payload.clone()));
         },
         Inbound::Closed(reason) => {
            if let Err(e) = loopback.try_send(ManagerCommand::LinkLost(id.clone(), reason.clone()))
            {
               warn!("Channel overflow sending link lost: {e}");
            }
         },
      })
   }

   async fn run(mut self) {
      info!("Link manager starting up");
      self.initialize().await;

      loop {
         select! {
             biased;
             Some(cmd) = self.loopback_rx.recv() => {
                 if !self.handle_command(cmd).await {
                     break;
                 }
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Link manager shutting down");
                     break;
                 };
                 if !self.handle_command(cmd).await {
                     break;
                 }
             }
         }
         while self.tasks.try_join_next().is_some() {}
      }

      self.cleanup().await;
      self.command_rx.close();
      if let Some(reply) = self.shutdown_reply.take() {
         let _ = reply.send(());
      }
   }

   async fn initialize(&mut self) {
      match self.adapter.query_enabled(self.transport.as_ref()).await {
         Ok(enabled) => self.event_tx.emit(LinkEvent::AdapterChanged(enabled)),
         Err(e) => {
            self.event_tx.emit(LinkEvent::AdapterChanged(false));
            self.event_tx.emit(LinkEvent::failed(&e));
         },
      }

      let loopback = self.loopback_tx.clone();
      let sink = move |notice: AdapterNotice| {
         if let Err(e) = loopback.try_send(ManagerCommand::Adapter(notice)) {
            warn!("Channel overflow sending adapter notice: {e}");
         }
      };
      match self.adapter.subscribe(self.transport.as_ref(), sink) {
         Ok(()) => debug!("Holding {} adapter subscriptions", self.adapter.handle_count()),
         Err(e) => {
            error!("Adapter notifications unavailable: {e}");
            self.event_tx.emit(LinkEvent::failed(&e));
         },
      }
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) -> bool {
      match cmd {
         ManagerCommand::RefreshBonded(reply) => self.handle_refresh_bonded(reply),
         ManagerCommand::Discover(reply) => self.handle_discover(reply),
         ManagerCommand::Connect(id, reply) => self.handle_connect(id, reply),
         ManagerCommand::Disconnect(id, reply) => self.handle_disconnect(id, reply),
         ManagerCommand::Send(data, reply) => self.handle_send(data, reply),
         ManagerCommand::ClearDevices(reply) => {
            self.registry.clear();
            self.event_tx.emit(LinkEvent::DevicesChanged);
            let _ = reply.send(());
         },
         ManagerCommand::RefreshAdapter(reply) => {
            match self.adapter.query_enabled(self.transport.as_ref()).await {
               Ok(enabled) => {
                  self.event_tx.emit(LinkEvent::AdapterChanged(enabled));
                  let _ = reply.send(Ok(enabled));
               },
               Err(e) => {
                  self.event_tx.emit(LinkEvent::AdapterChanged(false));
                  self.fail(reply, e);
               },
            }
         },
         ManagerCommand::GetSnapshot(reply) => {
            let _ = reply.send(self.snapshot());
         },
         ManagerCommand::Shutdown(reply) => {
            self.shutdown_reply = Some(reply);
            return false;
         },
         ManagerCommand::Adapter(notice) => self.handle_adapter_notice(notice),
         ManagerCommand::LinkLost(id, reason) => self.handle_link_lost(id, &reason),
         ManagerCommand::BondedListed(result, reply) => self.handle_bonded_listed(result, reply),
         ManagerCommand::DiscoveryFinished(result, reply) => {
            self.handle_discovery_finished(result, reply);
         },
         ManagerCommand::ConnectPermitted(id, granted, reply) => {
            self.handle_connect_permitted(id, granted, reply);
         },
         ManagerCommand::ConnectFinished(id, outcome, reply) => {
            self.handle_connect_finished(id, outcome, reply);
         },
         ManagerCommand::DisconnectFinished(id, outcome, reply) => {
            self.handle_disconnect_finished(id, outcome, reply);
         },
      }
      true
   }

   /// Runs `fut` on the task set and feeds its result back as a command.
   ///
   /// A panicking operation is reported through `on_panic`, so the matching
   /// pending flag is cleared on every exit path.
   fn spawn_op<T, F, C>(&mut self, fut: F, on_panic: fn(String) -> LinkError, complete: C)
   where
      T: Send + 'static,
      F: Future<Output = Result<T>> + Send + 'static,
      C: FnOnce(Result<T>) -> ManagerCommand + Send + 'static,
   {
      let loopback = self.loopback_tx.clone();
      self.tasks.spawn(async move {
         let result = AssertUnwindSafe(fut)
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(on_panic("operation panicked".to_string())));
         if let Err(e) = loopback.send(complete(result)).await {
            warn!("Channel closed sending operation result: {e}");
         }
      });
   }

   fn fail<T>(&self, reply: Reply<T>, err: LinkError) {
      warn!("Operation failed: {err}");
      self.event_tx.emit(LinkEvent::failed(&err));
      let _ = reply.send(Err(err));
   }

   fn snapshot(&self) -> Snapshot {
      let latest = self.connection.latest();
      Snapshot {
         adapter_enabled: self.adapter.enabled(),
         adapter_state: self.adapter.state(),
         devices: self.registry.snapshot(),
         connected_device: self.connection.connected_device().map(|id| {
            self
               .registry
               .get(id)
               .cloned()
               .unwrap_or_else(|| Device::unlisted(id.clone()))
         }),
         connection: self.connection.phase(),
         streaming: self.connection.is_streaming(),
         latest_inbound: latest.get(),
         inbound_frames: latest.updates(),
         pending: self.pending,
      }
   }

   // === Adapter ===

   fn handle_adapter_notice(&mut self, notice: AdapterNotice) {
      match self.adapter.on_notice(&notice) {
         Some(state) => {
            self
               .event_tx
               .emit(LinkEvent::AdapterChanged(state == AdapterState::Enabled));
         },
         None => {
            if let AdapterNotice::Error(msg) = notice {
               self.event_tx.emit(LinkEvent::AdapterError(msg.to_string()));
            }
         },
      }
   }

   // === Devices ===

   fn handle_refresh_bonded(&mut self, reply: Reply<usize>) {
      if self.pending.refresh {
         return self.fail(reply, LinkError::OperationInProgress);
      }
      self.pending.refresh = true;

      let gate = self.gate.clone();
      let transport = self.transport.clone();
      self.spawn_op(
         async move {
            if !gate.request(Capability::Connect).await {
               return Err(LinkError::PermissionDenied);
            }
            transport
               .bonded_devices()
               .await
               .map_err(|e| LinkError::DiscoveryFailed(e.to_string()))
         },
         LinkError::DiscoveryFailed,
         move |result| ManagerCommand::BondedListed(result, reply),
      );
   }

   fn handle_bonded_listed(&mut self, result: Result<Vec<Device>>, reply: Reply<usize>) {
      self.pending.refresh = false;
      match result {
         Ok(bonded) => {
            let count = bonded.len();
            info!("{count} bonded device(s)");
            self.registry.replace_bonded(bonded);
            self.event_tx.emit(LinkEvent::DevicesChanged);
            let _ = reply.send(Ok(count));
         },
         Err(e) => self.fail(reply, e),
      }
   }

   fn handle_discover(&mut self, reply: Reply<Vec<Device>>) {
      if self.pending.discovery {
         return self.fail(reply, LinkError::OperationInProgress);
      }
      self.pending.discovery = true;

      let protected = self
         .connection
         .connected_device()
         .into_iter()
         .chain(self.connection.target())
         .cloned()
         .collect();
      let session = DiscoverySession::new(self.transport.clone(), protected);
      self.spawn_op(session.run(), LinkError::DiscoveryFailed, move |result| {
         ManagerCommand::DiscoveryFinished(result, reply)
      });
   }

   fn handle_discovery_finished(&mut self, result: Result<Vec<Device>>, reply: Reply<Vec<Device>>) {
      self.pending.discovery = false;
      match result {
         Ok(found) => {
            self.registry.merge_discovered(found.clone());
            debug!("{} device(s) listed", self.registry.len());
            self.event_tx.emit(LinkEvent::DevicesChanged);
            let _ = reply.send(Ok(found));
         },
         Err(e) => self.fail(reply, e),
      }
   }

   // === Connection ===

   const fn link_busy(&self) -> bool {
      self.pending.connect || self.pending.disconnect || self.connection.is_busy()
   }

   fn handle_connect(&mut self, id: DeviceId, reply: Reply<bool>) {
      if self.link_busy() {
         return self.fail(reply, LinkError::OperationInProgress);
      }
      if self.registry.get(&id).is_none() {
         return self.fail(
            reply,
            LinkError::ConnectFailed(format!("unknown device {id}")),
         );
      }
      self.pending.connect = true;

      let gate = self.gate.clone();
      self.spawn_op(
         async move { Ok(gate.request(Capability::Connect).await) },
         LinkError::ConnectFailed,
         move |granted| ManagerCommand::ConnectPermitted(id, granted.unwrap_or(false), reply),
      );
   }

   fn handle_connect_permitted(&mut self, id: DeviceId, granted: bool, reply: Reply<bool>) {
      if !granted {
         self.pending.connect = false;
         return self.fail(reply, LinkError::PermissionDenied);
      }

      let (device, supersedes) = match self.connection.begin_connect(&id) {
         Ok(ConnectPlan::Connect { device, supersedes }) => (device, supersedes),
         Ok(ConnectPlan::AlreadyConnected) => {
            self.pending.connect = false;
            let _ = reply.send(Ok(true));
            return;
         },
         Err(e) => {
            self.pending.connect = false;
            return self.fail(reply, e);
         },
      };
      if let Some(previous) = &supersedes {
         self.event_tx.emit(LinkEvent::Disconnected(previous.clone()));
      }

      let transport = self.transport.clone();
      let config = self.connection.config().clone();
      let target = device.clone();
      self.spawn_op(
         async move {
            if let Some(previous) = supersedes {
               match transport.disconnect(&previous).await {
                  Ok(_) => debug!("Released superseded session with {previous}"),
                  Err(e) => warn!("Disconnect of superseded {previous} failed: {e}"),
               }
            }
            transport.connect(&target, &config).await
         },
         LinkError::ConnectFailed,
         move |outcome| ManagerCommand::ConnectFinished(device, outcome, reply),
      );
   }

   fn handle_connect_finished(&mut self, id: DeviceId, outcome: Result<bool>, reply: Reply<bool>) {
      self.pending.connect = false;
      let link_up = matches!(outcome, Ok(true));

      match self
         .connection
         .finish_connect(self.transport.as_ref(), &id, outcome)
      {
         Ok(connected) => {
            self.event_tx.emit(LinkEvent::Connected(id));
            let _ = reply.send(Ok(connected));
         },
         Err(e) => {
            if link_up {
               // The socket is up but unusable; release it.
               let transport = self.transport.clone();
               let orphan = id.clone();
               self.tasks.spawn(async move {
                  if let Err(e) = transport.disconnect(&orphan).await {
                     warn!("Failed to release link to {orphan}: {e}");
                  }
               });
            }
            self.fail(reply, e);
         },
      }
   }

   fn handle_disconnect(&mut self, id: Option<DeviceId>, reply: Reply<bool>) {
      if self.link_busy() {
         return self.fail(reply, LinkError::OperationInProgress);
      }
      let Some(id) = id.or_else(|| self.connection.connected_device().cloned()) else {
         debug!("Disconnect requested without an active session");
         let _ = reply.send(Ok(false));
         return;
      };

      match self.connection.begin_disconnect(&id) {
         Ok(true) => {},
         Ok(false) => {
            debug!("Disconnect requested for inactive device {id}");
            let _ = reply.send(Ok(false));
            return;
         },
         Err(e) => return self.fail(reply, e),
      }
      self.pending.disconnect = true;

      let transport = self.transport.clone();
      let target = id.clone();
      self.spawn_op(
         async move { transport.disconnect(&target).await },
         LinkError::DisconnectFailed,
         move |outcome| ManagerCommand::DisconnectFinished(id, outcome, reply),
      );
   }

   fn handle_disconnect_finished(
      &mut self,
      id: DeviceId,
      outcome: Result<bool>,
      reply: Reply<bool>,
   ) {
      self.pending.disconnect = false;
      let result = self.connection.finish_disconnect(&id, outcome);
      self.event_tx.emit(LinkEvent::Disconnected(id));
      match result {
         Ok(ok) => {
            let _ = reply.send(Ok(ok));
         },
         Err(e) => self.fail(reply, e),
      }
   }

   fn handle_link_lost(&mut self, id: DeviceId, reason: &str) {
      if !self.connection.on_link_lost(&id) {
         debug!("Ignoring link loss of inactive device {id}: {reason}");
         return;
      }
      self
         .event_tx
         .emit(LinkEvent::failed(&LinkError::ReadFailed(reason.to_string())));
      self.event_tx.emit(LinkEvent::Disconnected(id));
   }

   fn handle_send(&mut self, data: Vec<u8>, reply: Reply<()>) {
      let Some(id) = self.connection.connected_device().cloned() else {
         return self.fail(reply, LinkError::NotConnected);
      };
      if self.connection.phase() != ConnectionPhase::Connected {
         return self.fail(reply, LinkError::NotConnected);
      }

      let transport = self.transport.clone();
      let event_tx = self.event_tx.clone();
      self.tasks.spawn(async move {
         let result = transport.send(&id, &data).await.map_err(|e| match e {
            LinkError::NotConnected => LinkError::NotConnected,
            e => LinkError::WriteFailed(e.to_string()),
         });
         if let Err(e) = &result {
            warn!("Write to {id} failed: {e}");
            event_tx.emit(LinkEvent::failed(e));
         }
         let _ = reply.send(result);
      });
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up link manager");

      let in_flight = self.connection.target().cloned();
      self.tasks.shutdown().await;
      self.adapter.shutdown();

      let active = self.connection.shutdown();
      let in_flight = in_flight.filter(|id| active.as_ref() != Some(id));
      for id in active.into_iter().chain(in_flight) {
         match time::timeout(SHUTDOWN_DISCONNECT_TIMEOUT, self.transport.disconnect(&id)).await {
            Ok(Ok(_)) => info!("Disconnected {id} on shutdown"),
            Ok(Err(e)) => warn!("Failed to disconnect {id} on shutdown: {e}"),
            Err(_) => warn!("Disconnect of {id} timed out on shutdown"),
         }
         self.event_tx.emit(LinkEvent::Disconnected(id));
      }
   }
}
