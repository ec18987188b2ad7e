//! Connection lifecycle of the single active peer.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//!                      \-> Disconnected (connect failed)
//! ```
//!
//! The manager is split into `begin_*`/`finish_*` halves: the owner calls
//! `begin_*`, runs the radio operation elsewhere, and feeds the outcome back
//! through `finish_*`. Every transition therefore happens on the owner's
//! control flow while the radio call is in flight.

use log::{info, warn};
use serde::Serialize;

use crate::{
   bluetooth::transport::{LinkConfig, Transport},
   error::{LinkError, Result},
   link::{
      device::DeviceId,
      stream::{DataStreamSubscriber, LatestValue},
   },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionPhase {
   Disconnected,
   Connecting,
   Connected,
   Disconnecting,
}

/// The one connected peer. Holds the id only so reads go through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSession {
   pub device: DeviceId,
}

/// What the owner has to do after a successful `begin_connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectPlan {
   /// The device is already the active session.
   AlreadyConnected,
   /// Run the connect primitive, after disconnecting `supersedes` if set.
   Connect {
      device: DeviceId,
      supersedes: Option<DeviceId>,
   },
}

pub struct ConnectionManager {
   phase: ConnectionPhase,
   /// Device being connected or disconnected.
   target: Option<DeviceId>,
   session: Option<ConnectionSession>,
   subscriber: DataStreamSubscriber,
   config: LinkConfig,
}

impl ConnectionManager {
   pub fn new(config: LinkConfig, subscriber: DataStreamSubscriber) -> Self {
      Self {
         phase: ConnectionPhase::Disconnected,
         target: None,
         session: None,
         subscriber,
         config,
      }
   }

   pub const fn phase(&self) -> ConnectionPhase {
      self.phase
   }

   pub const fn config(&self) -> &LinkConfig {
      &self.config
   }

   pub fn connected_device(&self) -> Option<&DeviceId> {
      self.session.as_ref().map(|s| &s.device)
   }

   /// Device of an in-flight connect or disconnect.
   pub fn target(&self) -> Option<&DeviceId> {
      self.target.as_ref()
   }

   pub const fn is_busy(&self) -> bool {
      matches!(
         self.phase,
         ConnectionPhase::Connecting | ConnectionPhase::Disconnecting
      )
   }

   pub fn latest(&self) -> &LatestValue {
      self.subscriber.latest()
   }

   /// Inbound data is attached to the active session.
   pub fn is_streaming(&self) -> bool {
      self
         .connected_device()
         .is_some_and(|id| self.subscriber.attached_to() == Some(id))
   }

   pub fn begin_connect(&mut self, device: &DeviceId) -> Result<ConnectPlan> {
      if self.is_busy() {
         return Err(LinkError::OperationInProgress);
      }

      let supersedes = match self.session.take() {
         Some(session) if &session.device == device => {
            self.session = Some(session);
            return Ok(ConnectPlan::AlreadyConnected);
         },
         Some(session) => {
            info!("Connect to {device} supersedes session with {}", session.device);
            self.subscriber.detach();
            Some(session.device)
         },
         None => None,
      };

      info!("Connecting to {device}");
      self.phase = ConnectionPhase::Connecting;
      self.target = Some(device.clone());
      Ok(ConnectPlan::Connect {
         device: device.clone(),
         supersedes,
      })
   }

   /// Applies the outcome of the connect primitive.
   ///
   /// On success the session is established and inbound data attached.
   pub fn finish_connect(
      &mut self,
      transport: &dyn Transport,
      device: &DeviceId,
      outcome: Result<bool>,
   ) -> Result<bool> {
      if self.phase != ConnectionPhase::Connecting || self.target.as_ref() != Some(device) {
         warn!("Ignoring connect result for {device} in phase {}", self.phase);
         return Err(LinkError::ConnectFailed(format!(
            "no connect in flight for {device}"
         )));
      }
      self.target = None;

      let cause = match outcome {
         Ok(true) => {
            self.phase = ConnectionPhase::Connected;
            self.session = Some(ConnectionSession {
               device: device.clone(),
            });
            match self.subscriber.attach(transport, device.clone()) {
               Ok(()) => {
                  info!("Connected to {device}");
                  return Ok(true);
               },
               Err(e) => {
                  self.session = None;
                  format!("inbound subscription failed: {e}")
               },
            }
         },
         Ok(false) => "peer did not accept the connection".to_string(),
         Err(e) => e.to_string(),
      };

      warn!("Connect to {device} failed: {cause}");
      self.phase = ConnectionPhase::Disconnected;
      Err(LinkError::ConnectFailed(cause))
   }

   /// Starts disconnecting `device`.
   ///
   /// Returns `Ok(false)` without side effects when `device` is not the
   /// active session. Inbound data is detached before this returns.
   pub fn begin_disconnect(&mut self, device: &DeviceId) -> Result<bool> {
      if self.is_busy() {
         return Err(LinkError::OperationInProgress);
      }
      if self.connected_device() != Some(device) {
         return Ok(false);
      }

      info!("Disconnecting from {device}");
      self.phase = ConnectionPhase::Disconnecting;
      self.target = Some(device.clone());
      self.subscriber.detach();
      Ok(true)
   }

   /// Applies the outcome of the disconnect primitive.
   ///
   /// The session ends whatever the outcome; a fault is still reported.
   pub fn finish_disconnect(&mut self, device: &DeviceId, outcome: Result<bool>) -> Result<bool> {
      if self.phase != ConnectionPhase::Disconnecting || self.target.as_ref() != Some(device) {
         warn!("Ignoring disconnect result for {device} in phase {}", self.phase);
         return Ok(false);
      }
      self.subscriber.detach();
      self.session = None;
      self.target = None;
      self.phase = ConnectionPhase::Disconnected;

      match outcome {
         Ok(ok) => {
            info!("Disconnected from {device}");
            Ok(ok)
         },
         Err(e) => {
            warn!("Disconnect from {device} unconfirmed: {e}");
            Err(LinkError::DisconnectFailed(e.to_string()))
         },
      }
   }

   /// Handles a link drop reported by the transport.
   ///
   /// Returns true if it ended the active session.
   pub fn on_link_lost(&mut self, device: &DeviceId) -> bool {
      if self.phase != ConnectionPhase::Connected || self.connected_device() != Some(device) {
         return false;
      }
      warn!("Link to {device} lost");
      self.subscriber.detach();
      self.session = None;
      self.phase = ConnectionPhase::Disconnected;
      true
   }

   /// Drops every subscription and the session; returns the device still to disconnect.
   pub fn shutdown(&mut self) -> Option<DeviceId> {
      self.subscriber.detach();
      self.target = None;
      self.phase = ConnectionPhase::Disconnected;
      self.session.take().map(|s| s.device)
   }
}
