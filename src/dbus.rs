use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{bluetooth::manager::BluetoothManager, error::LinkError};

pub const SERVICE_NAME: &str = "org.btlink";
pub const OBJECT_PATH: &str = "/org/btlink/manager";

pub struct LinkService {
   bluetooth_manager: BluetoothManager,
}

impl LinkService {
   pub const fn new(bluetooth_manager: BluetoothManager) -> Self {
      Self { bluetooth_manager }
   }
}

fn to_fdo(e: LinkError) -> zbus::fdo::Error {
   match e {
      LinkError::PermissionDenied => zbus::fdo::Error::AccessDenied(e.to_string()),
      LinkError::InvalidAddress(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
      e => zbus::fdo::Error::Failed(format!("{}: {e}", e.kind().to_str())),
   }
}

#[interface(name = "org.btlink.Manager")]
impl LinkService {
   async fn get_snapshot(&self) -> zbus::fdo::Result<String> {
      let snapshot = self.bluetooth_manager.snapshot().await.map_err(to_fdo)?;
      Ok(snapshot.to_json().to_string())
   }

   async fn refresh_bonded(&self) -> zbus::fdo::Result<bool> {
      let count = self
         .bluetooth_manager
         .refresh_bonded()
         .await
         .map_err(to_fdo)?;
      info!("Bonded list refreshed ({count} devices)");
      Ok(true)
   }

   async fn discover(&self) -> zbus::fdo::Result<String> {
      let found = self.bluetooth_manager.discover().await.map_err(to_fdo)?;
      serde_json::to_string(&found).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
   }

   async fn connect(&self, address: String) -> zbus::fdo::Result<bool> {
      self
         .bluetooth_manager
         .connect(address.as_str().into())
         .await
         .map_err(to_fdo)
   }

   async fn disconnect(&self) -> zbus::fdo::Result<bool> {
      self.bluetooth_manager.disconnect().await.map_err(to_fdo)
   }

   async fn send(&self, text: String) -> zbus::fdo::Result<bool> {
      self
         .bluetooth_manager
         .send(text.into_bytes())
         .await
         .map_err(to_fdo)?;
      Ok(true)
   }

   async fn refresh_adapter(&self) -> zbus::fdo::Result<bool> {
      self
         .bluetooth_manager
         .refresh_adapter()
         .await
         .map_err(to_fdo)
   }

   async fn clear_devices(&self) -> zbus::fdo::Result<()> {
      self
         .bluetooth_manager
         .clear_devices()
         .await
         .map_err(to_fdo)
   }

   // Signals
   #[zbus(signal)]
   pub async fn adapter_changed(emitter: &SignalEmitter<'_>, enabled: bool) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn adapter_error(emitter: &SignalEmitter<'_>, message: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn devices_changed(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_connected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(emitter: &SignalEmitter<'_>, address: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn inbound_data(
      emitter: &SignalEmitter<'_>,
      address: &str,
      text: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn operation_failed(
      emitter: &SignalEmitter<'_>,
      kind: &str,
      message: &str,
   ) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn adapter_enabled(&self) -> bool {
      self
         .bluetooth_manager
         .snapshot()
         .await
         .ok()
         .and_then(|s| s.adapter_enabled)
         .unwrap_or(false)
   }

   #[zbus(property)]
   async fn connected_device(&self) -> String {
      self
         .bluetooth_manager
         .snapshot()
         .await
         .ok()
         .and_then(|s| s.connected_device)
         .map(|d| d.id.to_string())
         .unwrap_or_default()
   }
}
