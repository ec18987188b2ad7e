use std::sync::Arc;

use log::{debug, warn};

use crate::bluetooth::transport::{Capability, Transport};

/// Live runtime-capability check in front of radio operations.
///
/// Nothing is cached; the OS may revoke a grant at any time.
#[derive(Clone)]
pub struct PermissionGate {
   transport: Arc<dyn Transport>,
}

impl PermissionGate {
   pub fn new(transport: Arc<dyn Transport>) -> Self {
      Self { transport }
   }

   /// Requests `kind`; a faulted request counts as a denial.
   pub async fn request(&self, kind: Capability) -> bool {
      match self.transport.request_capability(kind).await {
         Ok(granted) => {
            debug!("Capability {kind} granted: {granted}");
            granted
         },
         Err(e) => {
            warn!("Capability request for {kind} failed: {e}");
            false
         },
      }
   }
}
