//! Scoped listener registrations.
//!
//! Every `subscribe*` call on a transport hands back a [`Subscription`] that
//! owns exactly one removal capability. Removing it (explicitly or by drop)
//! unregisters the callback; if a dispatch is running at that moment the
//! removal waits for it, so no callback runs once `remove` has returned.

use core::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

pub type Callback<T> = Box<dyn FnMut(T) + Send>;

/// Handle owning the removal of one registered callback.
#[must_use = "dropping a subscription unregisters its callback"]
pub struct Subscription {
   remove: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
   pub fn new<F>(remove: F) -> Self
   where
      F: FnOnce() + Send + 'static,
   {
      Self {
         remove: Some(Box::new(remove)),
      }
   }

   /// Unregisters the callback.
   pub fn remove(mut self) {
      self.release();
   }

   fn release(&mut self) {
      if let Some(remove) = self.remove.take() {
         remove();
      }
   }
}

impl Drop for Subscription {
   fn drop(&mut self) {
      self.release();
   }
}

impl fmt::Debug for Subscription {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Subscription")
         .field("active", &self.remove.is_some())
         .finish()
   }
}

struct Registry<T> {
   next_id: u64,
   entries: Vec<(u64, Callback<T>)>,
}

/// A set of callbacks fed from one notification stream.
pub struct Listeners<T> {
   inner: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Listeners<T> {
   fn clone(&self) -> Self {
      Self {
         inner: self.inner.clone(),
      }
   }
}

impl<T> Default for Listeners<T> {
   fn default() -> Self {
      Self {
         inner: Arc::new(Mutex::new(Registry {
            next_id: 0,
            entries: Vec::new(),
         })),
      }
   }
}

impl<T: Clone + Send + 'static> Listeners<T> {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn install(&self, cb: Callback<T>) -> Subscription {
      let id = {
         let mut reg = self.inner.lock();
         let id = reg.next_id;
         reg.next_id += 1;
         reg.entries.push((id, cb));
         id
      };
      let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
      Subscription::new(move || {
         if let Some(inner) = weak.upgrade() {
            inner.lock().entries.retain(|(i, _)| *i != id);
         }
      })
   }

   /// Delivers `value` to every registered callback.
   ///
   /// Callbacks must not touch this registry; the lock is held while they run.
   pub fn emit(&self, value: T) {
      let mut reg = self.inner.lock();
      for (_, cb) in reg.entries.iter_mut() {
         cb(value.clone());
      }
   }

   pub fn len(&self) -> usize {
      self.inner.lock().entries.len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}
