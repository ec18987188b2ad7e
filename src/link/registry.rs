//! Registry of known peers (bonded and discovered).
//!
//! Entries are keyed by [`DeviceId`] and kept in first-seen order. A device
//! reported again updates its entry in place instead of being appended, so
//! the list presented upward never re-sorts itself by latest activity.

use std::collections::{HashMap, HashSet};

use crate::link::device::{Device, DeviceId};

#[derive(Debug, Default)]
pub struct DeviceRegistry {
   devices: Vec<Device>,
   index: HashMap<DeviceId, usize>,
}

impl DeviceRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn len(&self) -> usize {
      self.devices.len()
   }

   pub fn is_empty(&self) -> bool {
      self.devices.is_empty()
   }

   pub fn get(&self, id: &DeviceId) -> Option<&Device> {
      self.index.get(id).map(|&i| &self.devices[i])
   }

   /// Replaces the bonded subset with `list`.
   ///
   /// Bonded entries missing from `list` are dropped, listed ones are updated
   /// in place or appended. Entries that are not bonded are left untouched.
   pub fn replace_bonded(&mut self, list: Vec<Device>) {
      let keep: HashSet<&DeviceId> = list.iter().map(|d| &d.id).collect();
      let before = self.devices.len();
      self.devices.retain(|d| !d.bonded || keep.contains(&d.id));
      if self.devices.len() != before {
         self.reindex();
      }
      for device in list {
         self.upsert(Device {
            bonded: true,
            ..device
         });
      }
   }

   /// Inserts unseen devices and overwrites `name`/`bonded` of known ones.
   pub fn merge_discovered(&mut self, list: Vec<Device>) {
      for device in list {
         self.upsert(device);
      }
   }

   pub fn clear(&mut self) {
      self.devices.clear();
      self.index.clear();
   }

   pub fn snapshot(&self) -> Vec<Device> {
      self.devices.clone()
   }

   fn upsert(&mut self, device: Device) {
      if let Some(&i) = self.index.get(&device.id) {
         let entry = &mut self.devices[i];
         entry.name = device.name;
         entry.bonded = device.bonded;
      } else {
         self.index.insert(device.id.clone(), self.devices.len());
         self.devices.push(device);
      }
   }

   fn reindex(&mut self) {
      self.index.clear();
      for (i, d) in self.devices.iter().enumerate() {
         self.index.insert(d.id.clone(), i);
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn ids(reg: &DeviceRegistry) -> Vec<String> {
      reg.snapshot().iter().map(|d| d.id.to_string()).collect()
   }

   #[test]
   fn test_bonded_then_discovered_dedupes() {
      let mut reg = DeviceRegistry::new();
      reg.replace_bonded(vec![Device::new("00:11", "HC-05", true)]);
      reg.merge_discovered(vec![
         Device::new("00:11", "HC-05", true),
         Device::new("00:22", "HC-06", false),
      ]);

      assert_eq!(reg.len(), 2);
      assert_eq!(ids(&reg), ["00:11", "00:22"]);
   }

   #[test]
   fn test_merge_keeps_first_seen_order() {
      let mut reg = DeviceRegistry::new();
      reg.merge_discovered(vec![
         Device::new("a", "one", false),
         Device::new("b", "two", false),
      ]);
      reg.merge_discovered(vec![
         Device::new("c", "three", false),
         Device::new("a", "uno", true),
      ]);
      reg.merge_discovered(vec![Device::new("b", "", false), Device::new("c", "tres", false)]);

      assert_eq!(ids(&reg), ["a", "b", "c"]);
      let snap = reg.snapshot();
      assert_eq!(snap[0].name, "uno");
      assert!(snap[0].bonded);
      assert_eq!(snap[1].name, "");
      assert_eq!(snap[2].name, "tres");
   }

   #[test]
   fn test_replace_bonded_only_touches_bonded_subset() {
      let mut reg = DeviceRegistry::new();
      reg.replace_bonded(vec![Device::new("a", "A", true), Device::new("b", "B", true)]);
      reg.merge_discovered(vec![Device::new("c", "C", false)]);

      // "a" was unpaired at the OS level, "d" got paired
      reg.replace_bonded(vec![Device::new("b", "B2", true), Device::new("d", "D", true)]);

      assert_eq!(ids(&reg), ["b", "c", "d"]);
      assert_eq!(reg.get(&"b".into()).map(|d| d.name.as_str()), Some("B2"));
      assert!(!reg.get(&"c".into()).is_some_and(|d| d.bonded));
   }

   #[test]
   fn test_replace_bonded_promotes_discovered_entry() {
      let mut reg = DeviceRegistry::new();
      reg.merge_discovered(vec![Device::new("x", "X", false), Device::new("y", "Y", false)]);
      reg.replace_bonded(vec![Device::new("y", "Y", false)]);

      assert_eq!(ids(&reg), ["x", "y"]);
      assert!(reg.get(&"y".into()).is_some_and(|d| d.bonded));
   }

   #[test]
   fn test_clear() {
      let mut reg = DeviceRegistry::new();
      reg.merge_discovered(vec![Device::new("x", "X", false)]);
      reg.clear();
      assert!(reg.is_empty());
      assert!(reg.get(&"x".into()).is_none());

      reg.merge_discovered(vec![Device::new("y", "Y", false)]);
      assert_eq!(ids(&reg), ["y"]);
   }
}
