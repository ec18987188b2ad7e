//! Inbound data subscription for the connected peer.
//!
//! [`DataStreamSubscriber`] keeps at most one transport subscription alive
//! and funnels its frames into a shared [`LatestValue`] slot. Each attach
//! bumps a generation counter; a callback whose generation is stale is
//! ignored, so nothing reaches the slot after `detach` returns even if the
//! transport delivers late.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
   bluetooth::{
      subscription::Subscription,
      transport::{Inbound, Payload, Transport},
   },
   error::{LinkError, Result},
   link::device::DeviceId,
};

/// Observer for frames and link loss accepted by the subscriber.
///
/// Runs with the slot locked; it must not block.
pub type StreamSink = Arc<dyn Fn(&DeviceId, &Inbound) + Send + Sync>;

#[derive(Debug, Default)]
struct Slot {
   generation: u64,
   value: Option<Payload>,
   updates: u64,
}

/// Last-write-wins holder of the most recent inbound frame.
#[derive(Debug, Clone, Default)]
pub struct LatestValue(Arc<Mutex<Slot>>);

impl LatestValue {
   pub fn get(&self) -> Option<Payload> {
      self.0.lock().value.clone()
   }

   /// Number of frames accepted since the last attach.
   pub fn updates(&self) -> u64 {
      self.0.lock().updates
   }
}

pub struct DataStreamSubscriber {
   latest: LatestValue,
   sink: StreamSink,
   active: Option<(DeviceId, Subscription)>,
}

impl DataStreamSubscriber {
   pub fn new(sink: StreamSink) -> Self {
      Self {
         latest: LatestValue::default(),
         sink,
         active: None,
      }
   }

   pub fn latest(&self) -> &LatestValue {
      &self.latest
   }

   pub fn attached_to(&self) -> Option<&DeviceId> {
      self.active.as_ref().map(|(id, _)| id)
   }

   /// Subscribes to `id`'s inbound data, detaching any previous subscription first.
   pub fn attach(&mut self, transport: &dyn Transport, id: DeviceId) -> Result<()> {
      self.detach();

      let generation = {
         let mut slot = self.latest.0.lock();
         slot.value = None;
         slot.updates = 0;
         slot.generation
      };

      let slot = self.latest.0.clone();
      let sink = self.sink.clone();
      let cb_id = id.clone();
      let callback = Box::new(move |inbound: Inbound| {
         let mut slot = slot.lock();
         if slot.generation != generation {
            return;
         }
         if let Inbound::Frame(payload) = &inbound {
            debug!("← {cb_id}: {}", hex::encode(payload));
            slot.value = Some(payload.clone());
            slot.updates += 1;
         }
         sink(&cb_id, &inbound);
      });

      let handle = transport.subscribe_inbound(&id, callback).map_err(|e| {
         warn!("Failed to subscribe to inbound data from {id}: {e}");
         LinkError::ReadFailed(e.to_string())
      })?;
      info!("Inbound data attached to {id}");
      self.active = Some((id, handle));
      Ok(())
   }

   /// Removes the active subscription. Calling it with nothing attached is a no-op.
   pub fn detach(&mut self) -> bool {
      self.latest.0.lock().generation += 1;
      let Some((id, handle)) = self.active.take() else {
         return false;
      };
      handle.remove();
      info!("Inbound data detached from {id}");
      true
   }
}

impl Drop for DataStreamSubscriber {
   fn drop(&mut self) {
      self.detach();
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::bluetooth::mock::MockTransport;

   fn recording_sink() -> (StreamSink, Arc<Mutex<Vec<Inbound>>>) {
      let seen = Arc::new(Mutex::new(Vec::new()));
      let sink: StreamSink = Arc::new({
         let seen = seen.clone();
         move |_id: &DeviceId, inbound: &Inbound| seen.lock().push(inbound.clone())
      });
      (sink, seen)
   }

   #[test]
   fn test_latest_value_last_write_wins() {
      let mock = MockTransport::new();
      let (sink, seen) = recording_sink();
      let mut sub = DataStreamSubscriber::new(sink);

      sub.attach(&*mock, "00:22".into()).expect("attach");
      mock.push_inbound("00:22", b"A\n");
      mock.push_inbound("00:22", b"OK\n");

      assert_eq!(sub.latest().get().as_deref(), Some(&b"OK\n"[..]));
      assert_eq!(sub.latest().updates(), 2);
      assert_eq!(seen.lock().len(), 2);
   }

   #[test]
   fn test_attach_replaces_previous_subscription() {
      let mock = MockTransport::new();
      let (sink, _) = recording_sink();
      let mut sub = DataStreamSubscriber::new(sink);

      sub.attach(&*mock, "00:11".into()).expect("attach");
      sub.attach(&*mock, "00:22".into()).expect("attach");

      assert_eq!(mock.inbound_listeners("00:11"), 0);
      assert_eq!(mock.inbound_listeners("00:22"), 1);
      assert_eq!(sub.attached_to().map(DeviceId::as_str), Some("00:22"));

      mock.push_inbound("00:11", b"stale");
      assert!(sub.latest().get().is_none());
   }

   #[test]
   fn test_frame_count_restarts_per_attach() {
      let mock = MockTransport::new();
      let (sink, _) = recording_sink();
      let mut sub = DataStreamSubscriber::new(sink);

      sub.attach(&*mock, "00:11".into()).expect("attach");
      mock.push_inbound("00:11", b"A\n");
      mock.push_inbound("00:11", b"B\n");
      assert_eq!(sub.latest().updates(), 2);

      sub.attach(&*mock, "00:22".into()).expect("attach");
      assert_eq!(sub.latest().updates(), 0);
      assert!(sub.latest().get().is_none());

      mock.push_inbound("00:22", b"C\n");
      assert_eq!(sub.latest().updates(), 1);
   }

   #[test]
   fn test_detach_is_idempotent_and_final() {
      let mock = MockTransport::new();
      let (sink, seen) = recording_sink();
      let mut sub = DataStreamSubscriber::new(sink);

      assert!(!sub.detach());
      sub.attach(&*mock, "00:22".into()).expect("attach");
      mock.push_inbound("00:22", b"OK\n");

      assert!(sub.detach());
      assert!(!sub.detach());
      assert_eq!(mock.inbound_listeners("00:22"), 0);

      mock.push_inbound("00:22", b"LATE\n");
      assert_eq!(sub.latest().get().as_deref(), Some(&b"OK\n"[..]));
      assert_eq!(sub.latest().updates(), 1);
      assert_eq!(seen.lock().len(), 1);
   }

   #[test]
   fn test_link_loss_reaches_sink() {
      let mock = MockTransport::new();
      let (sink, seen) = recording_sink();
      let mut sub = DataStreamSubscriber::new(sink);

      sub.attach(&*mock, "00:22".into()).expect("attach");
      mock.drop_link("00:22", "connection reset");

      assert_eq!(
         seen.lock().as_slice(),
         [Inbound::Closed("connection reset".into())]
      );
   }

   #[test]
   fn test_drop_releases_subscription() {
      let mock = MockTransport::new();
      let (sink, _) = recording_sink();
      let mut sub = DataStreamSubscriber::new(sink);
      sub.attach(&*mock, "00:22".into()).expect("attach");
      drop(sub);
      assert_eq!(mock.inbound_listeners("00:22"), 0);
   }
}
