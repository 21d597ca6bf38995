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

//! Multiqueues: sets of subqueues drained through a single blocking get,
//! either fairly (round-robin) or unfairly (strict priority by subqueue
//! position). Subqueues can be re-parented between multiqueues at
//! runtime, which is how a channel's inbound traffic is split onto a
//! private queue handle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use courier_util::{Condvar, Mutex};

use crate::error::{Error, Result};

static NEXT_SUBQUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Selector for the enable/disable operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqFunction {
	/// The add side.
	Add,
	/// The remove (get) side.
	Remove,
	/// Both sides.
	Both,
}

impl MqFunction {
	fn covers_add(self) -> bool {
		self != MqFunction::Remove
	}

	fn covers_remove(self) -> bool {
		self != MqFunction::Add
	}
}

struct SubSlot<T> {
	id: u64,
	items: VecDeque<T>,
	add_enabled: bool,
	remove_enabled: bool,
}

struct MultiState<T> {
	slots: Vec<SubSlot<T>>,
	returned: VecDeque<T>,
	cursor: usize,
	add_enabled: bool,
	remove_enabled: bool,
	shutdown: bool,
}

struct MultiInner<T> {
	state: Mutex<MultiState<T>>,
	cond: Condvar,
	fair: bool,
}

/// A set of subqueues drained as one queue.
pub struct Multiqueue<T> {
	inner: Arc<MultiInner<T>>,
}

impl<T> Clone for Multiqueue<T> {
	fn clone(&self) -> Multiqueue<T> {
		Multiqueue {
			inner: self.inner.clone(),
		}
	}
}

struct SubShared<T> {
	id: u64,
	owner: Mutex<Arc<MultiInner<T>>>,
	destroyed: std::sync::atomic::AtomicBool,
}

/// A handle to one subqueue of a multiqueue.
pub struct Subqueue<T> {
	shared: Arc<SubShared<T>>,
}

impl<T> Clone for Subqueue<T> {
	fn clone(&self) -> Subqueue<T> {
		Subqueue {
			shared: self.shared.clone(),
		}
	}
}

impl<T> Multiqueue<T> {
	fn with_policy(fair: bool) -> Multiqueue<T> {
		Multiqueue {
			inner: Arc::new(MultiInner {
				state: Mutex::new(MultiState {
					slots: vec![],
					returned: VecDeque::new(),
					cursor: 0,
					add_enabled: true,
					remove_enabled: true,
					shutdown: false,
				}),
				cond: Condvar::new(),
				fair,
			}),
		}
	}

	/// Create a multiqueue that drains its subqueues round-robin.
	pub fn fair() -> Multiqueue<T> {
		Multiqueue::with_policy(true)
	}

	/// Create a multiqueue that drains its first subqueue completely
	/// before visiting later ones (two-tier priority).
	pub fn unfair() -> Multiqueue<T> {
		Multiqueue::with_policy(false)
	}

	/// Add a new subqueue. Fails while adds are disabled or after
	/// shutdown.
	pub fn create_queue(&self) -> Result<Subqueue<T>> {
		let mut state = self.inner.state.lock();
		if state.shutdown {
			return Err(Error::Shutdown);
		}
		if !state.add_enabled {
			return Err(Error::Disabled);
		}
		let id = NEXT_SUBQUEUE_ID.fetch_add(1, Ordering::Relaxed);
		state.slots.push(SubSlot {
			id,
			items: VecDeque::new(),
			add_enabled: true,
			remove_enabled: true,
		});
		Ok(Subqueue {
			shared: Arc::new(SubShared {
				id,
				owner: Mutex::new(self.inner.clone()),
				destroyed: std::sync::atomic::AtomicBool::new(false),
			}),
		})
	}

	/// Blocking get across all subqueues, honoring the draining policy.
	pub fn get(&self) -> Result<T> {
		let mut state = self.inner.state.lock();
		loop {
			if state.shutdown {
				return Err(Error::Shutdown);
			}
			if !state.remove_enabled {
				return Err(Error::Disabled);
			}
			if let Some(item) = state.returned.pop_front() {
				return Ok(item);
			}
			let nslots = state.slots.len();
			if nslots > 0 {
				let start = if self.inner.fair {
					state.cursor % nslots
				} else {
					0
				};
				let mut found = None;
				for step in 0..nslots {
					let idx = (start + step) % nslots;
					let slot = &mut state.slots[idx];
					if !slot.remove_enabled {
						continue;
					}
					if let Some(item) = slot.items.pop_front() {
						found = Some((idx, item));
						break;
					}
				}
				if let Some((idx, item)) = found {
					if self.inner.fair {
						state.cursor = (idx + 1) % nslots;
					}
					return Ok(item);
				}
			}
			self.inner.cond.wait(&mut state);
		}
	}

	/// Put an element back so that it is the next one returned by
	/// `get`.
	pub fn push_back(&self, item: T) -> Result<()> {
		let mut state = self.inner.state.lock();
		if state.shutdown {
			return Err(Error::Shutdown);
		}
		state.returned.push_front(item);
		self.inner.cond.notify_all();
		Ok(())
	}

	/// Disable the add and/or remove side. Disabling the remove side
	/// unblocks pending `get` calls with `Disabled`.
	pub fn disable(&self, which: MqFunction) {
		let mut state = self.inner.state.lock();
		if which.covers_add() {
			state.add_enabled = false;
		}
		if which.covers_remove() {
			state.remove_enabled = false;
		}
		self.inner.cond.notify_all();
	}

	/// Re-enable previously disabled functionality.
	pub fn enable(&self, which: MqFunction) {
		let mut state = self.inner.state.lock();
		if which.covers_add() {
			state.add_enabled = true;
		}
		if which.covers_remove() {
			state.remove_enabled = true;
		}
		self.inner.cond.notify_all();
	}

	/// Shut the multiqueue down: every blocked and future operation
	/// fails with `Shutdown`. Terminal.
	pub fn shutdown(&self) {
		let mut state = self.inner.state.lock();
		state.shutdown = true;
		self.inner.cond.notify_all();
	}

	/// Total number of queued elements across all subqueues.
	pub fn len(&self) -> usize {
		let state = self.inner.state.lock();
		state.returned.len() + state.slots.iter().map(|s| s.items.len()).sum::<usize>()
	}

	/// Whether no elements are queued.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn same_inner(&self, other: &Arc<MultiInner<T>>) -> bool {
		Arc::ptr_eq(&self.inner, other)
	}
}

impl<T> Subqueue<T> {
	/// Stable identifier of this subqueue.
	pub fn id(&self) -> u64 {
		self.shared.id
	}

	fn owner(&self) -> Arc<MultiInner<T>> {
		self.shared.owner.lock().clone()
	}

	fn check_destroyed(&self) -> Result<()> {
		if self.shared.destroyed.load(Ordering::Relaxed) {
			Err(Error::Destroyed)
		} else {
			Ok(())
		}
	}

	/// Add an element. Fails when adds are disabled on this subqueue or
	/// its owning multiqueue.
	pub fn add(&self, item: T) -> Result<()> {
		loop {
			self.check_destroyed()?;
			let owner = self.owner();
			let mut state = owner.state.lock();
			if state.shutdown {
				return Err(Error::Shutdown);
			}
			let add_enabled = state.add_enabled;
			let slot = match state.slots.iter_mut().find(|s| s.id == self.shared.id) {
				Some(slot) => slot,
				// re-parented between the owner load and the lock
				None => continue,
			};
			if !add_enabled || !slot.add_enabled {
				return Err(Error::Disabled);
			}
			slot.items.push_back(item);
			owner.cond.notify_all();
			return Ok(());
		}
	}

	/// Blocking get restricted to this subqueue.
	pub fn get(&self) -> Result<T> {
		loop {
			self.check_destroyed()?;
			let owner = self.owner();
			let mut state = owner.state.lock();
			loop {
				if state.shutdown {
					return Err(Error::Shutdown);
				}
				if self.shared.destroyed.load(Ordering::Relaxed) {
					return Err(Error::Destroyed);
				}
				let slot = match state.slots.iter_mut().find(|s| s.id == self.shared.id)
				{
					Some(slot) => slot,
					None => break, // moved; find the new owner
				};
				if !slot.remove_enabled {
					return Err(Error::Disabled);
				}
				if let Some(item) = slot.items.pop_front() {
					return Ok(item);
				}
				owner.cond.wait(&mut state);
			}
		}
	}

	/// Put an element back so the next `get` on this subqueue returns
	/// it.
	pub fn push_back(&self, item: T) -> Result<()> {
		loop {
			self.check_destroyed()?;
			let owner = self.owner();
			let mut state = owner.state.lock();
			if state.shutdown {
				return Err(Error::Shutdown);
			}
			let slot = match state.slots.iter_mut().find(|s| s.id == self.shared.id) {
				Some(slot) => slot,
				None => continue,
			};
			slot.items.push_front(item);
			owner.cond.notify_all();
			return Ok(());
		}
	}

	/// Re-parent this subqueue (and its queued elements) onto another
	/// multiqueue. Waiting getters chase the subqueue to its new owner.
	pub fn move_to(&self, target: &Multiqueue<T>) -> Result<()> {
		let mut owner_guard = self.shared.owner.lock();
		if target.same_inner(&*owner_guard) {
			return Ok(());
		}
		let slot = {
			let mut state = owner_guard.state.lock();
			let pos = state
				.slots
				.iter()
				.position(|s| s.id == self.shared.id)
				.ok_or(Error::Shutdown)?;
			let slot = state.slots.remove(pos);
			if state.cursor >= state.slots.len() {
				state.cursor = 0;
			}
			owner_guard.cond.notify_all();
			slot
		};
		{
			let mut state = target.inner.state.lock();
			if state.shutdown {
				return Err(Error::Shutdown);
			}
			state.slots.push(slot);
			target.inner.cond.notify_all();
		}
		*owner_guard = target.inner.clone();
		Ok(())
	}

	/// Disable add and/or remove on this subqueue only. Disabling the
	/// remove side unblocks `get` calls on this subqueue.
	pub fn disable(&self, which: MqFunction) {
		let owner = self.owner();
		let mut state = owner.state.lock();
		if let Some(slot) = state.slots.iter_mut().find(|s| s.id == self.shared.id) {
			if which.covers_add() {
				slot.add_enabled = false;
			}
			if which.covers_remove() {
				slot.remove_enabled = false;
			}
		}
		owner.cond.notify_all();
	}

	/// Re-enable previously disabled functionality on this subqueue.
	pub fn enable(&self, which: MqFunction) {
		let owner = self.owner();
		let mut state = owner.state.lock();
		if let Some(slot) = state.slots.iter_mut().find(|s| s.id == self.shared.id) {
			if which.covers_add() {
				slot.add_enabled = true;
			}
			if which.covers_remove() {
				slot.remove_enabled = true;
			}
		}
		owner.cond.notify_all();
	}

	/// Detach this subqueue from its multiqueue, dropping any queued
	/// elements and waking blocked getters.
	pub fn destroy(&self) {
		let owner_guard = self.shared.owner.lock();
		self.shared
			.destroyed
			.store(true, Ordering::Relaxed);
		let mut state = owner_guard.state.lock();
		if let Some(pos) = state.slots.iter().position(|s| s.id == self.shared.id) {
			state.slots.remove(pos);
			if state.cursor >= state.slots.len() {
				state.cursor = 0;
			}
		}
		owner_guard.cond.notify_all();
	}

	/// Number of elements queued on this subqueue.
	pub fn len(&self) -> usize {
		let owner = self.owner();
		let state = owner.state.lock();
		state
			.slots
			.iter()
			.find(|s| s.id == self.shared.id)
			.map(|s| s.items.len())
			.unwrap_or(0)
	}

	/// Whether this subqueue is empty.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::thread;
	use std::time::Duration;

	#[test]
	fn unfair_drains_first_subqueue_completely() {
		let mq = Multiqueue::unfair();
		let high = mq.create_queue().unwrap();
		let low = mq.create_queue().unwrap();
		low.add("l1").unwrap();
		high.add("h1").unwrap();
		high.add("h2").unwrap();
		low.add("l2").unwrap();
		assert_eq!(mq.get().unwrap(), "h1");
		assert_eq!(mq.get().unwrap(), "h2");
		assert_eq!(mq.get().unwrap(), "l1");
		// repopulating the first subqueue takes priority again
		high.add("h3").unwrap();
		assert_eq!(mq.get().unwrap(), "h3");
		assert_eq!(mq.get().unwrap(), "l2");
	}

	#[test]
	fn fair_round_robins_subqueues() {
		let mq = Multiqueue::fair();
		let a = mq.create_queue().unwrap();
		let b = mq.create_queue().unwrap();
		for i in 0..3 {
			a.add(format!("a{}", i)).unwrap();
			b.add(format!("b{}", i)).unwrap();
		}
		let order: Vec<String> = (0..6).map(|_| mq.get().unwrap()).collect();
		assert_eq!(order, vec!["a0", "b0", "a1", "b1", "a2", "b2"]);
	}

	#[test]
	fn push_back_returns_element_first() {
		let mq = Multiqueue::fair();
		let sq = mq.create_queue().unwrap();
		sq.add(1).unwrap();
		sq.add(2).unwrap();
		let first = mq.get().unwrap();
		mq.push_back(first).unwrap();
		assert_eq!(mq.get().unwrap(), 1);
		assert_eq!(mq.get().unwrap(), 2);
	}

	#[test]
	fn disable_remove_unblocks_getter() {
		let mq: Multiqueue<u8> = Multiqueue::fair();
		let _sq = mq.create_queue().unwrap();
		let mq2 = mq.clone();
		let getter = thread::spawn(move || mq2.get());
		thread::sleep(Duration::from_millis(50));
		mq.disable(MqFunction::Remove);
		assert!(matches!(getter.join().unwrap(), Err(Error::Disabled)));
		mq.enable(MqFunction::Remove);
		let sq2 = mq.create_queue().unwrap();
		sq2.add(5).unwrap();
		assert_eq!(mq.get().unwrap(), 5);
	}

	#[test]
	fn disable_add_rejects_adds() {
		let mq = Multiqueue::fair();
		let sq = mq.create_queue().unwrap();
		mq.disable(MqFunction::Add);
		assert!(matches!(sq.add(1), Err(Error::Disabled)));
		assert!(matches!(mq.create_queue(), Err(Error::Disabled)));
		mq.enable(MqFunction::Add);
		sq.add(1).unwrap();
	}

	#[test]
	fn move_subqueue_carries_elements() {
		let mq1 = Multiqueue::fair();
		let mq2 = Multiqueue::fair();
		let sq = mq1.create_queue().unwrap();
		sq.add(42).unwrap();
		sq.move_to(&mq2).unwrap();
		assert!(mq1.is_empty());
		assert_eq!(mq2.get().unwrap(), 42);
		// adds now land on the new owner
		sq.add(43).unwrap();
		assert_eq!(mq2.get().unwrap(), 43);
	}

	#[test]
	fn move_wakes_getter_on_new_owner() {
		let mq1: Multiqueue<u8> = Multiqueue::fair();
		let mq2: Multiqueue<u8> = Multiqueue::fair();
		let sq = mq1.create_queue().unwrap();
		let sq2 = sq.clone();
		let getter = thread::spawn(move || sq2.get());
		thread::sleep(Duration::from_millis(50));
		sq.move_to(&mq2).unwrap();
		sq.add(7).unwrap();
		assert_eq!(getter.join().unwrap().unwrap(), 7);
	}

	#[test]
	fn shutdown_unblocks_everything() {
		let mq: Multiqueue<u8> = Multiqueue::unfair();
		let sq = mq.create_queue().unwrap();
		let mq2 = mq.clone();
		let getter = thread::spawn(move || mq2.get());
		thread::sleep(Duration::from_millis(50));
		mq.shutdown();
		assert!(matches!(getter.join().unwrap(), Err(Error::Shutdown)));
		assert!(matches!(sq.add(1), Err(Error::Shutdown)));
	}
}
