//! Radio/transport collaborator interface.
//!
//! The link core never talks to the Bluetooth stack directly; everything goes
//! through a [`Transport`]. The BlueZ implementation lives in
//! [`crate::bluetooth::bluez`].

use async_trait::async_trait;
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::{
   bluetooth::subscription::{Callback, Subscription},
   error::{LinkError, Result},
   link::device::{Device, DeviceId},
};

/// One inbound frame.
pub type Payload = SmallVec<[u8; 32]>;

/// Maximum delimiter length accepted by [`LinkConfig`].
pub const MAX_DELIMITER_LEN: usize = 8;

/// Runtime capability that has to be granted before touching the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
   Discover,
   Connect,
}

/// Adapter notification streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AdapterSignal {
   Enabled,
   Disabled,
   Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterNotice {
   Enabled,
   Disabled,
   Error(SmolStr),
}

/// What an inbound-data subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
   Frame(Payload),
   /// The link dropped; no frames follow.
   Closed(SmolStr),
}

/// Socket parameters used when connecting to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
   /// RFCOMM channel of the serial port service.
   pub channel: u8,
   /// Frame terminator. Empty means raw mode: each read is delivered as one frame.
   pub delimiter: heapless::Vec<u8, MAX_DELIMITER_LEN>,
}

impl LinkConfig {
   pub fn new(channel: u8, delimiter: &[u8]) -> Result<Self> {
      let delimiter = heapless::Vec::from_slice(delimiter).map_err(|()| {
         LinkError::InvalidConfig(format!(
            "delimiter longer than {MAX_DELIMITER_LEN} bytes"
         ))
      })?;
      Ok(Self { channel, delimiter })
   }

   /// Raw byte mode on the given channel.
   pub fn raw(channel: u8) -> Self {
      Self {
         channel,
         delimiter: heapless::Vec::new(),
      }
   }

   pub fn is_raw(&self) -> bool {
      self.delimiter.is_empty()
   }
}

impl Default for LinkConfig {
   /// Line-oriented framing on channel 1, the usual serial port profile setup.
   fn default() -> Self {
      let mut delimiter = heapless::Vec::new();
      let _ = delimiter.push(b'\n');
      Self {
         channel: 1,
         delimiter,
      }
   }
}

/// Operations the link core consumes from the Bluetooth stack.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
   async fn adapter_enabled(&self) -> Result<bool>;

   async fn bonded_devices(&self) -> Result<Vec<Device>>;

   /// Runs one discovery pass and returns what it found in first-seen order.
   async fn discovery_pass(&self) -> Result<Vec<Device>>;

   /// Asks for a runtime capability. Platforms without a permission model grant it.
   async fn request_capability(&self, kind: Capability) -> Result<bool>;

   async fn connect(&self, id: &DeviceId, config: &LinkConfig) -> Result<bool>;

   async fn disconnect(&self, id: &DeviceId) -> Result<bool>;

   async fn is_connected(&self, id: &DeviceId) -> Result<bool>;

   async fn send(&self, id: &DeviceId, data: &[u8]) -> Result<()>;

   fn subscribe_inbound(&self, id: &DeviceId, cb: Callback<Inbound>) -> Result<Subscription>;

   fn subscribe_adapter(
      &self,
      signal: AdapterSignal,
      cb: Callback<AdapterNotice>,
   ) -> Result<Subscription>;
}
