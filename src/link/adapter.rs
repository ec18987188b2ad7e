//! Tracking of the local radio's on/off state.

use log::{error, info, warn};
use serde::Serialize;

use crate::{
   bluetooth::{
      subscription::Subscription,
      transport::{AdapterNotice, AdapterSignal, Transport},
   },
   error::{LinkError, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AdapterState {
   Unknown,
   Enabled,
   Disabled,
}

/// Holds the adapter state and the three notification handles feeding it.
///
/// State moves only on an explicit query result or an enable/disable
/// notification. Re-delivery of the current state is applied again, not
/// filtered.
pub struct AdapterStateTracker {
   state: AdapterState,
   handles: Vec<Subscription>,
}

impl Default for AdapterStateTracker {
   fn default() -> Self {
      Self::new()
   }
}

impl AdapterStateTracker {
   pub const fn new() -> Self {
      Self {
         state: AdapterState::Unknown,
         handles: Vec::new(),
      }
   }

   pub const fn state(&self) -> AdapterState {
      self.state
   }

   pub const fn enabled(&self) -> Option<bool> {
      match self.state {
         AdapterState::Unknown => None,
         AdapterState::Enabled => Some(true),
         AdapterState::Disabled => Some(false),
      }
   }

   /// Queries the transport.
   ///
   /// Any fault leaves the adapter marked disabled and is returned as
   /// `AdapterUnavailable`.
   pub async fn query_enabled(&mut self, transport: &dyn Transport) -> Result<bool> {
      match transport.adapter_enabled().await {
         Ok(enabled) => {
            self.apply(enabled);
            Ok(enabled)
         },
         Err(e) => {
            error!("Adapter state query failed: {e}");
            self.apply(false);
            Err(match e {
               LinkError::AdapterUnavailable(cause) => LinkError::AdapterUnavailable(cause),
               e => LinkError::AdapterUnavailable(e.to_string()),
            })
         },
      }
   }

   pub fn apply(&mut self, enabled: bool) -> AdapterState {
      self.state = if enabled {
         AdapterState::Enabled
      } else {
         AdapterState::Disabled
      };
      info!("Adapter {}", self.state);
      self.state
   }

   /// Applies a notification; returns the new state for enable/disable notices.
   pub fn on_notice(&mut self, notice: &AdapterNotice) -> Option<AdapterState> {
      match notice {
         AdapterNotice::Enabled => Some(self.apply(true)),
         AdapterNotice::Disabled => Some(self.apply(false)),
         AdapterNotice::Error(msg) => {
            warn!("Adapter error: {msg}");
            None
         },
      }
   }

   /// Registers for the enabled, disabled and error streams.
   ///
   /// Existing handles are released first. If any registration fails the ones
   /// already acquired are released too.
   pub fn subscribe<F>(&mut self, transport: &dyn Transport, sink: F) -> Result<()>
   where
      F: FnMut(AdapterNotice) + Clone + Send + 'static,
   {
      self.shutdown();
      let mut acquired = Vec::with_capacity(3);
      for signal in [AdapterSignal::Enabled, AdapterSignal::Disabled, AdapterSignal::Error] {
         let mut sink = sink.clone();
         match transport.subscribe_adapter(signal, Box::new(move |n| sink(n))) {
            Ok(handle) => acquired.push(handle),
            Err(e) => {
               error!("Failed to subscribe to adapter {signal} notifications: {e}");
               return Err(LinkError::AdapterUnavailable(e.to_string()));
            },
         }
      }
      self.handles = acquired;
      Ok(())
   }

   pub fn handle_count(&self) -> usize {
      self.handles.len()
   }

   /// Releases every notification handle.
   pub fn shutdown(&mut self) {
      for handle in self.handles.drain(..) {
         handle.remove();
      }
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;

   use parking_lot::Mutex;

   use super::*;
   use crate::bluetooth::mock::MockTransport;

   #[tokio::test]
   async fn test_query_fails_closed() {
      let mock = MockTransport::new();
      let mut tracker = AdapterStateTracker::new();
      assert_eq!(tracker.state(), AdapterState::Unknown);

      assert!(tracker.query_enabled(&*mock).await.expect("query"));
      assert_eq!(tracker.enabled(), Some(true));

      *mock.enabled.lock() = Err("bluetoothd gone".into());
      assert!(matches!(
         tracker.query_enabled(&*mock).await,
         Err(LinkError::AdapterUnavailable(_))
      ));
      assert_eq!(tracker.state(), AdapterState::Disabled);
   }

   #[test]
   fn test_notices_and_redelivery() {
      let mut tracker = AdapterStateTracker::new();
      assert_eq!(
         tracker.on_notice(&AdapterNotice::Disabled),
         Some(AdapterState::Disabled)
      );
      assert_eq!(
         tracker.on_notice(&AdapterNotice::Disabled),
         Some(AdapterState::Disabled)
      );
      assert_eq!(tracker.on_notice(&AdapterNotice::Error("x".into())), None);
      assert_eq!(tracker.state(), AdapterState::Disabled);
      assert_eq!(
         tracker.on_notice(&AdapterNotice::Enabled),
         Some(AdapterState::Enabled)
      );
   }

   #[test]
   fn test_owns_three_handles_and_releases_all() {
      let mock = MockTransport::new();
      let seen = Arc::new(Mutex::new(Vec::new()));
      let mut tracker = AdapterStateTracker::new();

      tracker
         .subscribe(&*mock, {
            let seen = seen.clone();
            move |n| seen.lock().push(n)
         })
         .expect("subscribe");
      assert_eq!(tracker.handle_count(), 3);
      assert_eq!(mock.adapter_listeners(), 3);

      mock.notify_adapter(AdapterNotice::Disabled);
      mock.notify_adapter(AdapterNotice::Error("hci0 reset".into()));
      assert_eq!(seen.lock().len(), 2);

      // resubscribing must not leak the previous registrations
      tracker.subscribe(&*mock, |_| {}).expect("subscribe");
      assert_eq!(mock.adapter_listeners(), 3);

      tracker.shutdown();
      assert_eq!(tracker.handle_count(), 0);
      assert_eq!(mock.adapter_listeners(), 0);

      mock.notify_adapter(AdapterNotice::Enabled);
      assert_eq!(seen.lock().len(), 2);
   }
}
