//! Scriptable in-memory transport for tests.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
   bluetooth::{
      subscription::{Callback, Listeners, Subscription},
      transport::{AdapterNotice, AdapterSignal, Capability, Inbound, LinkConfig, Payload, Transport},
   },
   error::{LinkError, Result},
   link::device::{Device, DeviceId},
};

type Scripted<T> = std::result::Result<T, String>;

fn fault(msg: String) -> LinkError {
   LinkError::Io(std::io::Error::other(msg))
}

pub struct MockTransport {
   pub enabled: Mutex<Scripted<bool>>,
   pub bonded: Mutex<Scripted<Vec<Device>>>,
   pub discovered: Mutex<Scripted<Vec<Device>>>,
   pub granted: Mutex<bool>,
   pub connect_result: Mutex<Scripted<bool>>,
   pub disconnect_result: Mutex<Scripted<bool>>,
   pub connected: Mutex<HashSet<DeviceId>>,
   pub calls: Mutex<Vec<String>>,
   pub sent: Mutex<Vec<(DeviceId, Vec<u8>)>>,
   /// The link closes between connect and the inbound subscription.
   pub closed_before_subscribe: Mutex<bool>,
   pub panic_discovery: Mutex<bool>,
   connect_hold: Mutex<Option<oneshot::Receiver<()>>>,
   discovery_hold: Mutex<Option<oneshot::Receiver<()>>>,
   disconnect_hold: Mutex<Option<oneshot::Receiver<()>>>,
   inbound: Mutex<HashMap<DeviceId, Listeners<Inbound>>>,
   on_enabled: Listeners<AdapterNotice>,
   on_disabled: Listeners<AdapterNotice>,
   on_error: Listeners<AdapterNotice>,
}

impl MockTransport {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         enabled: Mutex::new(Ok(true)),
         bonded: Mutex::new(Ok(Vec::new())),
         discovered: Mutex::new(Ok(Vec::new())),
         granted: Mutex::new(true),
         connect_result: Mutex::new(Ok(true)),
         disconnect_result: Mutex::new(Ok(true)),
         connected: Mutex::new(HashSet::new()),
         calls: Mutex::new(Vec::new()),
         sent: Mutex::new(Vec::new()),
         closed_before_subscribe: Mutex::new(false),
         panic_discovery: Mutex::new(false),
         connect_hold: Mutex::new(None),
         discovery_hold: Mutex::new(None),
         disconnect_hold: Mutex::new(None),
         inbound: Mutex::new(HashMap::new()),
         on_enabled: Listeners::new(),
         on_disabled: Listeners::new(),
         on_error: Listeners::new(),
      })
   }

   /// Makes the next `connect` wait until the returned sender fires or is dropped.
   pub fn hold_connect(&self) -> oneshot::Sender<()> {
      let (tx, rx) = oneshot::channel();
      *self.connect_hold.lock() = Some(rx);
      tx
   }

   /// Makes the next `discovery_pass` wait until the returned sender fires or is dropped.
   pub fn hold_discovery(&self) -> oneshot::Sender<()> {
      let (tx, rx) = oneshot::channel();
      *self.discovery_hold.lock() = Some(rx);
      tx
   }

   /// Makes the next `disconnect` wait until the returned sender fires or is dropped.
   pub fn hold_disconnect(&self) -> oneshot::Sender<()> {
      let (tx, rx) = oneshot::channel();
      *self.disconnect_hold.lock() = Some(rx);
      tx
   }

   pub fn calls(&self) -> Vec<String> {
      self.calls.lock().clone()
   }

   pub fn push_inbound(&self, id: &str, data: &[u8]) {
      let listeners = self.inbound.lock().get(&DeviceId::from(id)).cloned();
      if let Some(listeners) = listeners {
         listeners.emit(Inbound::Frame(Payload::from_slice(data)));
      }
   }

   pub fn drop_link(&self, id: &str, reason: &str) {
      let id = DeviceId::from(id);
      self.connected.lock().remove(&id);
      let listeners = self.inbound.lock().get(&id).cloned();
      if let Some(listeners) = listeners {
         listeners.emit(Inbound::Closed(reason.into()));
      }
   }

   pub fn inbound_listeners(&self, id: &str) -> usize {
      self
         .inbound
         .lock()
         .get(&DeviceId::from(id))
         .map_or(0, Listeners::len)
   }

   pub fn adapter_listeners(&self) -> usize {
      self.on_enabled.len() + self.on_disabled.len() + self.on_error.len()
   }

   pub fn notify_adapter(&self, notice: AdapterNotice) {
      match notice {
         AdapterNotice::Enabled => self.on_enabled.emit(notice),
         AdapterNotice::Disabled => self.on_disabled.emit(notice),
         AdapterNotice::Error(_) => self.on_error.emit(notice),
      }
   }

   fn record(&self, call: String) {
      self.calls.lock().push(call);
   }
}

#[async_trait]
impl Transport for MockTransport {
   async fn adapter_enabled(&self) -> Result<bool> {
      self
         .enabled
         .lock()
         .clone()
         .map_err(LinkError::AdapterUnavailable)
   }

   async fn bonded_devices(&self) -> Result<Vec<Device>> {
      self.record("bonded".into());
      self.bonded.lock().clone().map_err(fault)
   }

   async fn discovery_pass(&self) -> Result<Vec<Device>> {
      self.record("discover".into());
      let hold = self.discovery_hold.lock().take();
      if let Some(hold) = hold {
         let _ = hold.await;
      }
      let panic = *self.panic_discovery.lock();
      if panic {
         panic!("discovery backend crashed");
      }
      self.discovered.lock().clone().map_err(fault)
   }

   async fn request_capability(&self, kind: Capability) -> Result<bool> {
      self.record(format!("permission {kind}"));
      Ok(*self.granted.lock())
   }

   async fn connect(&self, id: &DeviceId, _config: &LinkConfig) -> Result<bool> {
      self.record(format!("connect {id}"));
      let hold = self.connect_hold.lock().take();
      if let Some(hold) = hold {
         let _ = hold.await;
      }
      let ok = self.connect_result.lock().clone().map_err(fault)?;
      if ok {
         self.connected.lock().insert(id.clone());
      }
      Ok(ok)
   }

   async fn disconnect(&self, id: &DeviceId) -> Result<bool> {
      self.record(format!("disconnect {id}"));
      let hold = self.disconnect_hold.lock().take();
      if let Some(hold) = hold {
         let _ = hold.await;
      }
      self.connected.lock().remove(id);
      self.disconnect_result.lock().clone().map_err(fault)
   }

   async fn is_connected(&self, id: &DeviceId) -> Result<bool> {
      Ok(self.connected.lock().contains(id))
   }

   async fn send(&self, id: &DeviceId, data: &[u8]) -> Result<()> {
      if !self.connected.lock().contains(id) {
         return Err(LinkError::NotConnected);
      }
      self.sent.lock().push((id.clone(), data.to_vec()));
      Ok(())
   }

   fn subscribe_inbound(&self, id: &DeviceId, cb: Callback<Inbound>) -> Result<Subscription> {
      if *self.closed_before_subscribe.lock() {
         return Err(LinkError::NotConnected);
      }
      let listeners = self.inbound.lock().entry(id.clone()).or_default().clone();
      Ok(listeners.install(cb))
   }

   fn subscribe_adapter(
      &self,
      signal: AdapterSignal,
      cb: Callback<AdapterNotice>,
   ) -> Result<Subscription> {
      let listeners = match signal {
         AdapterSignal::Enabled => &self.on_enabled,
         AdapterSignal::Disabled => &self.on_disabled,
         AdapterSignal::Error => &self.on_error,
      };
      Ok(listeners.install(cb))
   }
}
