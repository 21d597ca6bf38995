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

//! Counting semaphore used to bound the number of simultaneously open
//! incoming files across all receiver threads.

use parking_lot::{Condvar, Mutex};

/// A simple counting semaphore. `acquire` blocks while the count is zero.
pub struct Semaphore {
	count: Mutex<usize>,
	cond: Condvar,
}

impl Semaphore {
	/// Create a semaphore with `permits` initial permits.
	pub fn new(permits: usize) -> Semaphore {
		Semaphore {
			count: Mutex::new(permits),
			cond: Condvar::new(),
		}
	}

	/// Take one permit, blocking until one is available.
	pub fn acquire(&self) {
		let mut count = self.count.lock();
		while *count == 0 {
			self.cond.wait(&mut count);
		}
		*count -= 1;
	}

	/// Take one permit, waiting at most `timeout`. Returns whether a
	/// permit was obtained.
	pub fn acquire_timeout(&self, timeout: std::time::Duration) -> bool {
		let deadline = std::time::Instant::now() + timeout;
		let mut count = self.count.lock();
		while *count == 0 {
			let now = std::time::Instant::now();
			if now >= deadline {
				return false;
			}
			if self
				.cond
				.wait_for(&mut count, deadline - now)
				.timed_out() && *count == 0
			{
				return false;
			}
		}
		*count -= 1;
		true
	}

	/// Take one permit if immediately available.
	pub fn try_acquire(&self) -> bool {
		let mut count = self.count.lock();
		if *count == 0 {
			return false;
		}
		*count -= 1;
		true
	}

	/// Return one permit, waking a blocked acquirer.
	pub fn release(&self) {
		let mut count = self.count.lock();
		*count += 1;
		self.cond.notify_one();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;
	use std::thread;
	use std::time::Duration;

	#[test]
	fn bounded_acquire() {
		let sem = Semaphore::new(2);
		assert!(sem.try_acquire());
		assert!(sem.try_acquire());
		assert!(!sem.try_acquire());
		sem.release();
		assert!(sem.try_acquire());
	}

	#[test]
	fn blocked_acquirer_wakes_on_release() {
		let sem = Arc::new(Semaphore::new(0));
		let sem2 = sem.clone();
		let waiter = thread::spawn(move || {
			sem2.acquire();
		});
		thread::sleep(Duration::from_millis(50));
		sem.release();
		waiter.join().unwrap();
	}
}
