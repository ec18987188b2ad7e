//! Peer device records.

use core::fmt;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Hardware address of a peer, used as its unique key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(SmolStr);

impl DeviceId {
   pub fn new(id: impl Into<SmolStr>) -> Self {
      Self(id.into())
   }

   pub fn as_str(&self) -> &str {
      self.0.as_str()
   }
}

impl fmt::Display for DeviceId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

impl From<&str> for DeviceId {
   fn from(id: &str) -> Self {
      Self::new(id)
   }
}

/// One Bluetooth Classic peer as known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
   pub id: DeviceId,
   /// Human-readable label, may be empty.
   pub name: SmolStr,
   /// Paired at the OS level.
   pub bonded: bool,
}

impl Device {
   pub fn new(id: impl Into<DeviceId>, name: impl Into<SmolStr>, bonded: bool) -> Self {
      Self {
         id: id.into(),
         name: name.into(),
         bonded,
      }
   }

   /// Placeholder for a device that is referenced but no longer listed.
   pub fn unlisted(id: DeviceId) -> Self {
      Self {
         id,
         name: SmolStr::default(),
         bonded: false,
      }
   }
}
