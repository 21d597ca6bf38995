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

//! Logging, locking and lifecycle utilities shared by the courier crates.

#![deny(unused_mut)]
#![warn(missing_docs)]

#[macro_use]
extern crate log;

// Re-export the lock types so the rest of the workspace uses a single
// consistent set of synchronization primitives.
pub use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

mod logger;
mod sem;
mod stop_state;

pub use crate::logger::{init_logger, init_test_logger, LoggingConfig};
pub use crate::sem::Semaphore;
pub use crate::stop_state::StopState;
