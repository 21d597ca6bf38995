// Copyright 2024 The Courier Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Integer-keyed ordered map with internal synchronization. Backs the
//! channel and group bookkeeping, where stable sorted traversal and
//! first/last/next/prev anchors are needed.

use std::collections::BTreeMap;
use std::ops::Bound;

use courier_util::RwLock;

/// A sorted map from `u32` keys to cloneable values. All operations are
/// internally synchronized with a reader/writer lock, so a shared
/// reference can be used freely across threads.
pub struct IntMap<V> {
	inner: RwLock<BTreeMap<u32, V>>,
}

impl<V: Clone> IntMap<V> {
	/// Create an empty map.
	pub fn new() -> IntMap<V> {
		IntMap {
			inner: RwLock::new(BTreeMap::new()),
		}
	}

	/// Insert or overwrite the value at `key`.
	pub fn set(&self, key: u32, value: V) {
		self.inner.write().insert(key, value);
	}

	/// Look up the value at `key`.
	pub fn get(&self, key: u32) -> Option<V> {
		self.inner.read().get(&key).cloned()
	}

	/// Whether `key` is present.
	pub fn contains(&self, key: u32) -> bool {
		self.inner.read().contains_key(&key)
	}

	/// Remove and return the value at `key`.
	pub fn remove(&self, key: u32) -> Option<V> {
		self.inner.write().remove(&key)
	}

	/// Number of entries.
	pub fn len(&self) -> usize {
		self.inner.read().len()
	}

	/// Whether the map is empty.
	pub fn is_empty(&self) -> bool {
		self.inner.read().is_empty()
	}

	/// Smallest entry.
	pub fn first(&self) -> Option<(u32, V)> {
		self.inner
			.read()
			.iter()
			.next()
			.map(|(k, v)| (*k, v.clone()))
	}

	/// Largest entry.
	pub fn last(&self) -> Option<(u32, V)> {
		self.inner
			.read()
			.iter()
			.next_back()
			.map(|(k, v)| (*k, v.clone()))
	}

	/// Entry with the smallest key strictly greater than `key`.
	pub fn next_after(&self, key: u32) -> Option<(u32, V)> {
		self.inner
			.read()
			.range((Bound::Excluded(key), Bound::Unbounded))
			.next()
			.map(|(k, v)| (*k, v.clone()))
	}

	/// Entry with the largest key strictly smaller than `key`.
	pub fn prev_before(&self, key: u32) -> Option<(u32, V)> {
		self.inner
			.read()
			.range((Bound::Unbounded, Bound::Excluded(key)))
			.next_back()
			.map(|(k, v)| (*k, v.clone()))
	}

	/// Visit every entry in key order while holding the read lock.
	pub fn for_each<F>(&self, mut f: F)
	where
		F: FnMut(u32, &V),
	{
		for (k, v) in self.inner.read().iter() {
			f(*k, v);
		}
	}

	/// Snapshot of all keys in sorted order.
	pub fn keys(&self) -> Vec<u32> {
		self.inner.read().keys().cloned().collect()
	}

	/// Snapshot of all values in key order.
	pub fn values(&self) -> Vec<V> {
		self.inner.read().values().cloned().collect()
	}

	/// Remove every entry, returning the drained values in key order.
	pub fn drain(&self) -> Vec<V> {
		let mut inner = self.inner.write();
		let drained = std::mem::replace(&mut *inner, BTreeMap::new());
		drained.into_iter().map(|(_, v)| v).collect()
	}
}

impl<V: Clone> Default for IntMap<V> {
	fn default() -> IntMap<V> {
		IntMap::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn set_get_del() {
		let map = IntMap::new();
		map.set(3, "c");
		map.set(1, "a");
		map.set(2, "b");
		assert_eq!(map.get(2), Some("b"));
		assert_eq!(map.len(), 3);
		assert_eq!(map.remove(2), Some("b"));
		assert_eq!(map.get(2), None);
		map.set(1, "a2");
		assert_eq!(map.get(1), Some("a2"));
	}

	#[test]
	fn traversal_anchors() {
		let map = IntMap::new();
		for k in &[10u32, 20, 30] {
			map.set(*k, *k * 2);
		}
		assert_eq!(map.first(), Some((10, 20)));
		assert_eq!(map.last(), Some((30, 60)));
		assert_eq!(map.next_after(10), Some((20, 40)));
		assert_eq!(map.next_after(15), Some((20, 40)));
		assert_eq!(map.next_after(30), None);
		assert_eq!(map.prev_before(30), Some((20, 40)));
		assert_eq!(map.prev_before(10), None);
	}

	#[test]
	fn ordered_iteration() {
		let map = IntMap::new();
		for k in &[5u32, 1, 9, 3] {
			map.set(*k, ());
		}
		let mut seen = vec![];
		map.for_each(|k, _| seen.push(k));
		assert_eq!(seen, vec![1, 3, 5, 9]);
	}
}
