//! Event handling for link status updates.
//!
//! This module provides the event infrastructure for notifying about adapter
//! changes, connection transitions, inbound data and failed operations.

use std::sync::Arc;

use crate::{
   bluetooth::transport::Payload,
   error::{ErrorKind, LinkError},
   link::device::DeviceId,
};

/// Events that can be emitted by the link service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
   AdapterChanged(bool),
   AdapterError(String),
   DevicesChanged,
   Connected(DeviceId),
   Disconnected(DeviceId),
   Inbound(DeviceId, Payload),
   OperationFailed(ErrorKind, String),
}

impl LinkEvent {
   pub fn failed(err: &LinkError) -> Self {
      Self::OperationFailed(err.kind(), err.to_string())
   }
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: LinkEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
