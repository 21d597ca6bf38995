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

//! Process-wide stop flag observed by all long-running threads.

use std::sync::atomic::{AtomicBool, Ordering};

/// Shared stop/pause state. Threads poll this at least once per second
/// rather than being cancelled, so shutdown is always cooperative.
pub struct StopState {
	stopping: AtomicBool,
	paused: AtomicBool,
}

impl Default for StopState {
	fn default() -> StopState {
		StopState::new()
	}
}

impl StopState {
	/// Create a new stop state, neither stopped nor paused.
	pub fn new() -> StopState {
		StopState {
			stopping: AtomicBool::new(false),
			paused: AtomicBool::new(false),
		}
	}

	/// Request all threads observing this state to wind down.
	pub fn stop(&self) {
		self.stopping.store(true, Ordering::SeqCst);
	}

	/// Whether a stop has been requested.
	pub fn is_stopped(&self) -> bool {
		self.stopping.load(Ordering::SeqCst)
	}

	/// Pause activity without shutting down. Only used by tests.
	pub fn pause(&self) {
		self.paused.store(true, Ordering::SeqCst);
	}

	/// Resume after a pause.
	pub fn resume(&self) {
		self.paused.store(false, Ordering::SeqCst);
	}

	/// Whether the state is currently paused.
	pub fn is_paused(&self) -> bool {
		self.paused.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stop_is_sticky() {
		let state = StopState::new();
		assert!(!state.is_stopped());
		state.stop();
		assert!(state.is_stopped());
		assert!(!state.is_paused());
	}

	#[test]
	fn pause_and_resume() {
		let state = StopState::new();
		state.pause();
		assert!(state.is_paused());
		state.resume();
		assert!(!state.is_paused());
	}
}
