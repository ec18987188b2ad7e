//! Bluetooth Classic serial link D-Bus service.
//!
//! This service discovers and connects a single RFCOMM peer through BlueZ
//! and exposes the link state, inbound data and operations over D-Bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::{bluez::BluerTransport, manager::BluetoothManager};
use dbus::LinkService;
use event::{EventBus, LinkEvent};

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod link;

use crate::{dbus::LinkServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting btlinkd D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;
   let link_config = config.link_config()?;
   info!(
      "Loaded configuration: RFCOMM channel {}, {} framing",
      link_config.channel,
      if link_config.is_raw() { "raw" } else { "delimited" }
   );

   // Create event channel
   let event_bus = EventProcessor::new();

   // Create Bluetooth manager over the BlueZ transport
   let transport = BluerTransport::new(&config).await?;
   let bluetooth_manager = BluetoothManager::new(transport, link_config, event_bus.clone());

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name(dbus::SERVICE_NAME)?
      .serve_at(dbus::OBJECT_PATH, LinkService::new(bluetooth_manager.clone()))?
      .build()
      .await?;

   info!("btlinkd D-Bus service started at {}", dbus::SERVICE_NAME);

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   if let Err(e) = bluetooth_manager.refresh_bonded().await {
      warn!("Initial bonded device listing failed: {e}");
   }

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down btlinkd service...");
   bluetooth_manager.shutdown().await?;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<LinkEvent>,
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
   async fn recv(self: &Arc<Self>) -> Option<LinkEvent> {
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

   async fn dispatch(&self, iface: &InterfaceRef<LinkService>, event: LinkEvent) -> Result<()> {
      match event {
         LinkEvent::AdapterChanged(enabled) => {
            iface.adapter_changed(enabled).await?;
            iface
               .get()
               .await
               .adapter_enabled_changed(iface.signal_emitter())
               .await?;
         },
         LinkEvent::AdapterError(message) => {
            iface.adapter_error(&message).await?;
         },
         LinkEvent::DevicesChanged => {
            iface.devices_changed().await?;
         },
         LinkEvent::Connected(id) => {
            iface.device_connected(id.as_str()).await?;
            iface
               .get()
               .await
               .connected_device_changed(iface.signal_emitter())
               .await?;
         },
         LinkEvent::Disconnected(id) => {
            iface.device_disconnected(id.as_str()).await?;
            iface
               .get()
               .await
               .connected_device_changed(iface.signal_emitter())
               .await?;
         },
         LinkEvent::Inbound(id, payload) => {
            iface
               .inbound_data(id.as_str(), &String::from_utf8_lossy(&payload))
               .await?;
         },
         LinkEvent::OperationFailed(kind, message) => {
            iface.operation_failed(kind.to_str(), &message).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, LinkService>(dbus::OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: LinkEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
