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

//! Thread-safe double-ended queue with blocking, timed and non-blocking
//! pops. Producers push to the front and the single consumer pops from
//! the back, so urgent control frames ride the same FIFO path as data.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use courier_util::{Condvar, Mutex};

use crate::error::{Error, Result};

struct DequeState<T> {
	items: VecDeque<T>,
	unblocked: bool,
	destroyed: bool,
}

struct DequeInner<T> {
	state: Mutex<DequeState<T>>,
	cond: Condvar,
}

/// A clonable handle to a shared deque.
pub struct Deque<T> {
	inner: Arc<DequeInner<T>>,
}

impl<T> Clone for Deque<T> {
	fn clone(&self) -> Deque<T> {
		Deque {
			inner: self.inner.clone(),
		}
	}
}

#[derive(Clone, Copy)]
enum PopMode {
	Block,
	Timed(Duration),
	NonBlock,
}

impl<T> Deque<T> {
	/// Create an empty deque.
	pub fn new() -> Deque<T> {
		Deque {
			inner: Arc::new(DequeInner {
				state: Mutex::new(DequeState {
					items: VecDeque::new(),
					unblocked: false,
					destroyed: false,
				}),
				cond: Condvar::new(),
			}),
		}
	}

	/// Push an element at the front.
	pub fn push_front(&self, item: T) -> Result<()> {
		let mut state = self.inner.state.lock();
		if state.destroyed {
			return Err(Error::Destroyed);
		}
		state.items.push_front(item);
		self.inner.cond.notify_one();
		Ok(())
	}

	/// Push an element at the back.
	pub fn push_back(&self, item: T) -> Result<()> {
		let mut state = self.inner.state.lock();
		if state.destroyed {
			return Err(Error::Destroyed);
		}
		state.items.push_back(item);
		self.inner.cond.notify_one();
		Ok(())
	}

	fn pop(&self, front: bool, mode: PopMode) -> Result<T> {
		let mut state = self.inner.state.lock();
		loop {
			if state.destroyed {
				return Err(Error::Destroyed);
			}
			let popped = if front {
				state.items.pop_front()
			} else {
				state.items.pop_back()
			};
			if let Some(item) = popped {
				return Ok(item);
			}
			if state.unblocked {
				return Err(Error::Unblocked);
			}
			match mode {
				PopMode::NonBlock => return Err(Error::Empty),
				PopMode::Block => {
					self.inner.cond.wait(&mut state);
				}
				PopMode::Timed(dur) => {
					if self.inner.cond.wait_for(&mut state, dur).timed_out() {
						return Err(Error::TimedOut);
					}
				}
			}
		}
	}

	/// Pop from the front, blocking until an element is available.
	pub fn pop_front(&self) -> Result<T> {
		self.pop(true, PopMode::Block)
	}

	/// Pop from the front, waiting at most `dur`.
	pub fn pop_front_timed(&self, dur: Duration) -> Result<T> {
		self.pop(true, PopMode::Timed(dur))
	}

	/// Pop from the front without blocking.
	pub fn pop_front_nb(&self) -> Result<T> {
		self.pop(true, PopMode::NonBlock)
	}

	/// Pop from the back, blocking until an element is available.
	pub fn pop_back(&self) -> Result<T> {
		self.pop(false, PopMode::Block)
	}

	/// Pop from the back, waiting at most `dur`.
	pub fn pop_back_timed(&self, dur: Duration) -> Result<T> {
		self.pop(false, PopMode::Timed(dur))
	}

	/// Pop from the back without blocking.
	pub fn pop_back_nb(&self) -> Result<T> {
		self.pop(false, PopMode::NonBlock)
	}

	/// Wake all blocked poppers with `Unblocked`. The unblocked state is
	/// sticky: any later pop that finds the deque empty also returns
	/// `Unblocked` instead of waiting.
	pub fn unblock(&self) {
		let mut state = self.inner.state.lock();
		state.unblocked = true;
		self.inner.cond.notify_all();
	}

	/// Drop all contents and fail every present and future operation
	/// with `Destroyed`.
	pub fn destroy(&self) {
		let mut state = self.inner.state.lock();
		state.destroyed = true;
		state.items.clear();
		self.inner.cond.notify_all();
	}

	/// Remove and return everything currently queued, front to back.
	pub fn drain(&self) -> Vec<T> {
		let mut state = self.inner.state.lock();
		state.items.drain(..).collect()
	}

	/// Number of queued elements.
	pub fn len(&self) -> usize {
		self.inner.state.lock().items.len()
	}

	/// Whether the deque is empty.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl<T> Default for Deque<T> {
	fn default() -> Deque<T> {
		Deque::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::thread;

	#[test]
	fn fifo_through_front_push_back_pop() {
		let dq = Deque::new();
		dq.push_front(1).unwrap();
		dq.push_front(2).unwrap();
		dq.push_front(3).unwrap();
		assert_eq!(dq.pop_back().unwrap(), 1);
		assert_eq!(dq.pop_back().unwrap(), 2);
		assert_eq!(dq.pop_back().unwrap(), 3);
	}

	#[test]
	fn nonblocking_pop_on_empty() {
		let dq: Deque<u8> = Deque::new();
		assert!(matches!(dq.pop_back_nb(), Err(Error::Empty)));
	}

	#[test]
	fn timed_pop_times_out() {
		let dq: Deque<u8> = Deque::new();
		let err = dq.pop_back_timed(Duration::from_millis(20)).unwrap_err();
		assert!(matches!(err, Error::TimedOut));
	}

	#[test]
	fn unblock_wakes_waiter_and_sticks() {
		let dq: Deque<u8> = Deque::new();
		let dq2 = dq.clone();
		let waiter = thread::spawn(move || dq2.pop_back());
		thread::sleep(Duration::from_millis(50));
		dq.unblock();
		assert!(matches!(waiter.join().unwrap(), Err(Error::Unblocked)));
		// sticky: empty pops keep reporting Unblocked
		assert!(matches!(dq.pop_back_nb(), Err(Error::Unblocked)));
		// but queued data is still delivered
		dq.push_front(9).unwrap();
		assert_eq!(dq.pop_back().unwrap(), 9);
	}

	#[test]
	fn destroy_wakes_waiter() {
		let dq: Deque<u8> = Deque::new();
		let dq2 = dq.clone();
		let waiter = thread::spawn(move || dq2.pop_front());
		thread::sleep(Duration::from_millis(50));
		dq.destroy();
		assert!(matches!(waiter.join().unwrap(), Err(Error::Destroyed)));
		assert!(matches!(dq.push_back(1), Err(Error::Destroyed)));
	}

	#[test]
	fn urgent_front_pop() {
		let dq = Deque::new();
		dq.push_front("data").unwrap();
		dq.push_back("urgent-last").unwrap();
		assert_eq!(dq.pop_front().unwrap(), "data");
		assert_eq!(dq.pop_front().unwrap(), "urgent-last");
	}
}
