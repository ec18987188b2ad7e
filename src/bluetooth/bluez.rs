//! BlueZ-backed [`Transport`].
//!
//! Discovery is restricted to BR/EDR and runs for a fixed window. Links are
//! RFCOMM streams kept in a map keyed by peer address. Adapter power changes
//! come from the adapter's property stream, watched by a monitor task.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
   time::Duration,
};

use async_trait::async_trait;
use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, DiscoveryFilter, DiscoveryTransport, Session,
};
use futures::{StreamExt, pin_mut};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{select, task::JoinHandle, time};

use crate::{
   bluetooth::{
      rfcomm::Link,
      subscription::{Callback, Listeners, Subscription},
      transport::{AdapterNotice, AdapterSignal, Capability, Inbound, LinkConfig, Transport},
   },
   config::Config,
   error::{LinkError, Result},
   link::device::{Device, DeviceId},
};

#[derive(Clone, Default)]
struct AdapterListeners {
   enabled: Listeners<AdapterNotice>,
   disabled: Listeners<AdapterNotice>,
   error: Listeners<AdapterNotice>,
}

pub struct BluerTransport {
   _session: Session,
   adapter: Adapter,
   links: Mutex<HashMap<Address, Link>>,
   listeners: AdapterListeners,
   discovery_window: Duration,
   connect_timeout: Duration,
   monitor: JoinHandle<()>,
}

impl BluerTransport {
   pub async fn new(config: &Config) -> Result<Arc<Self>> {
      let session = Session::new()
         .await
         .map_err(|e| LinkError::AdapterUnavailable(e.to_string()))?;
      let adapter = match &config.adapter {
         Some(name) => session.adapter(name),
         None => session.default_adapter().await,
      }
      .map_err(|e| LinkError::AdapterUnavailable(e.to_string()))?;
      info!("Using adapter {}", adapter.name());

      let listeners = AdapterListeners::default();
      let monitor = Self::start_adapter_monitor(adapter.clone(), listeners.clone());

      Ok(Arc::new(Self {
         _session: session,
         adapter,
         links: Mutex::new(HashMap::new()),
         listeners,
         discovery_window: config.discovery_window(),
         connect_timeout: config.connect_timeout(),
         monitor,
      }))
   }

   fn start_adapter_monitor(adapter: Adapter, listeners: AdapterListeners) -> JoinHandle<()> {
      tokio::spawn(async move {
         let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
               listeners
                  .error
                  .emit(AdapterNotice::Error(format!("adapter events unavailable: {e}").into()));
               return;
            },
         };

         while let Some(event) = events.next().await {
            if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
               debug!("Adapter {} powered: {powered}", adapter.name());
               if powered {
                  listeners.enabled.emit(AdapterNotice::Enabled);
               } else {
                  listeners.disabled.emit(AdapterNotice::Disabled);
               }
            }
         }

         // The stream ends when the adapter goes away.
         listeners
            .error
            .emit(AdapterNotice::Error(format!("adapter {} removed", adapter.name()).into()));
      })
   }

   fn address(id: &DeviceId) -> Result<Address> {
      id.as_str()
         .parse()
         .map_err(|_| LinkError::InvalidAddress(id.to_string()))
   }

   async fn describe(&self, addr: Address) -> Result<Device> {
      let device = self.adapter.device(addr)?;
      let name = device.name().await?.unwrap_or_default();
      let bonded = device.is_paired().await?;
      Ok(Device::new(addr.to_string().as_str(), name, bonded))
   }
}

impl Drop for BluerTransport {
   fn drop(&mut self) {
      self.monitor.abort();
   }
}

#[async_trait]
impl Transport for BluerTransport {
   async fn adapter_enabled(&self) -> Result<bool> {
      self
         .adapter
         .is_powered()
         .await
         .map_err(|e| LinkError::AdapterUnavailable(e.to_string()))
   }

   async fn bonded_devices(&self) -> Result<Vec<Device>> {
      let mut bonded = Vec::new();
      for addr in self.adapter.device_addresses().await? {
         match self.describe(addr).await {
            Ok(device) if device.bonded => bonded.push(device),
            Ok(_) => {},
            Err(e) => debug!("Skipping {addr}: {e}"),
         }
      }
      Ok(bonded)
   }

   async fn discovery_pass(&self) -> Result<Vec<Device>> {
      let mut filter = DiscoveryFilter::default();
      filter.transport = DiscoveryTransport::BrEdr;
      self.adapter.set_discovery_filter(filter).await?;

      let events = self.adapter.discover_devices().await?;
      pin_mut!(events);
      let window = time::sleep(self.discovery_window);
      pin_mut!(window);

      let mut seen = HashSet::new();
      let mut found = Vec::new();
      loop {
         select! {
            () = &mut window => break,
            event = events.next() => match event {
               Some(AdapterEvent::DeviceAdded(addr)) if seen.insert(addr) => {
                  match self.describe(addr).await {
                     Ok(device) => {
                        debug!("Discovered {} ({:?})", device.id, device.name);
                        found.push(device);
                     },
                     Err(e) => debug!("Device {addr} vanished during discovery: {e}"),
                  }
               },
               Some(_) => {},
               None => break,
            },
         }
      }
      Ok(found)
   }

   async fn request_capability(&self, kind: Capability) -> Result<bool> {
      // BlueZ authorizes through D-Bus policy; there is nothing to prompt for.
      debug!("Capability {kind} implicitly granted");
      Ok(true)
   }

   async fn connect(&self, id: &DeviceId, config: &LinkConfig) -> Result<bool> {
      let addr = Self::address(id)?;
      if self.links.lock().get(&addr).is_some_and(Link::is_connected) {
         return Ok(true);
      }

      let link = Link::connect(addr, config, self.connect_timeout).await?;
      info!("RFCOMM link to {addr} established");
      self.links.lock().insert(addr, link);
      Ok(true)
   }

   async fn disconnect(&self, id: &DeviceId) -> Result<bool> {
      let addr = Self::address(id)?;
      let had_link = self.links.lock().remove(&addr).is_some();

      let device = self.adapter.device(addr)?;
      match device.is_connected().await {
         Ok(true) => {
            device.disconnect().await?;
            return Ok(true);
         },
         Ok(false) => {},
         Err(e) => debug!("Could not query baseband state of {addr}: {e}"),
      }
      Ok(had_link)
   }

   async fn is_connected(&self, id: &DeviceId) -> Result<bool> {
      let addr = Self::address(id)?;
      if self.links.lock().get(&addr).is_some_and(Link::is_connected) {
         return Ok(true);
      }
      Ok(self.adapter.device(addr)?.is_connected().await?)
   }

   async fn send(&self, id: &DeviceId, data: &[u8]) -> Result<()> {
      let addr = Self::address(id)?;
      let sender = self
         .links
         .lock()
         .get(&addr)
         .map(Link::sender)
         .ok_or(LinkError::NotConnected)?;
      sender.send(data).await
   }

   fn subscribe_inbound(&self, id: &DeviceId, cb: Callback<Inbound>) -> Result<Subscription> {
      let addr = Self::address(id)?;
      let links = self.links.lock();
      let link = links.get(&addr).ok_or(LinkError::NotConnected)?;
      link.subscribe(cb)
   }

   fn subscribe_adapter(
      &self,
      signal: AdapterSignal,
      cb: Callback<AdapterNotice>,
   ) -> Result<Subscription> {
      if self.monitor.is_finished() {
         warn!("Adapter monitor is not running");
         return Err(LinkError::AdapterUnavailable(
            "adapter monitor stopped".to_string(),
         ));
      }
      let listeners = match signal {
         AdapterSignal::Enabled => &self.listeners.enabled,
         AdapterSignal::Disabled => &self.listeners.disabled,
         AdapterSignal::Error => &self.listeners.error,
      };
      Ok(listeners.install(cb))
   }
}
