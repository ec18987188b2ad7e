//! One discovery pass over the radio.
//!
//! The session only talks to the transport. Merging the result into the
//! registry and clearing the pending flag is left to the owner of the
//! registry, which applies the outcome on its own control flow.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::{
   bluetooth::transport::{Capability, Transport},
   error::{LinkError, Result},
   link::{
      device::{Device, DeviceId},
      permission::PermissionGate,
   },
};

pub struct DiscoverySession {
   transport: Arc<dyn Transport>,
   gate: PermissionGate,
   /// Devices that must not be cleanup-disconnected (active session, connect target).
   protected: Vec<DeviceId>,
}

impl DiscoverySession {
   pub fn new(transport: Arc<dyn Transport>, protected: Vec<DeviceId>) -> Self {
      Self {
         gate: PermissionGate::new(transport.clone()),
         transport,
         protected,
      }
   }

   pub async fn run(self) -> Result<Vec<Device>> {
      if !self.gate.request(Capability::Discover).await {
         info!("Discovery not permitted");
         return Err(LinkError::PermissionDenied);
      }

      info!("Starting discovery pass");
      let found = self
         .transport
         .discovery_pass()
         .await
         .map_err(|e| LinkError::DiscoveryFailed(e.to_string()))?;

      for device in &found {
         if self.protected.contains(&device.id) {
            continue;
         }
         self.release_stale_link(&device.id).await;
      }

      info!("Discovery pass found {} device(s)", found.len());
      Ok(found)
   }

   /// Disconnects a peer that still reports a link left over from an earlier run.
   async fn release_stale_link(&self, id: &DeviceId) {
      match self.transport.is_connected(id).await {
         Ok(true) => {
            info!("{id} reports a stale connection, disconnecting");
            if let Err(e) = self.transport.disconnect(id).await {
               warn!("Cleanup disconnect of {id} failed: {e}");
            }
         },
         Ok(false) => {},
         Err(e) => debug!("Could not query connection state of {id}: {e}"),
      }
   }
}
