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

//! Channels: logical streams multiplexed on a connection. A channel has
//! a local id, learns its remote id through the announce/reply
//! handshake, and owns the subqueue its inbound messages land on.

use std::sync::Arc;

use courier_util::{Condvar, Mutex};

use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::message::Msg;
use crate::multiqueue::Subqueue;

/// Channel lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanState {
	/// Allocated, not yet bound to a connection.
	Created,
	/// Bound to a connection, waiting for the remote id.
	Connecting,
	/// Fully established.
	Connected,
	/// Dead. No further transitions.
	Closed,
}

struct ChanInfo {
	state: ChanState,
	remote: u16,
}

/// One logical stream on a connection.
pub(crate) struct Channel {
	/// Local channel id; key in the root channel map.
	pub(crate) id: u16,
	info: Mutex<ChanInfo>,
	/// Broadcast when a pending connect completes or fails.
	pending: Condvar,
	conn: Mutex<Option<Arc<Connection>>>,
	/// Inbound subqueue; parented to the owning queue's multiqueue.
	pub(crate) queue: Subqueue<Msg>,
}

impl Channel {
	pub(crate) fn new(id: u16, queue: Subqueue<Msg>) -> Channel {
		Channel {
			id,
			info: Mutex::new(ChanInfo {
				state: ChanState::Created,
				remote: 0,
			}),
			pending: Condvar::new(),
			conn: Mutex::new(None),
			queue,
		}
	}

	/// Build the already-connected control channel.
	pub(crate) fn new_control(id: u16, queue: Subqueue<Msg>) -> Channel {
		Channel {
			id,
			info: Mutex::new(ChanInfo {
				state: ChanState::Connected,
				remote: id,
			}),
			pending: Condvar::new(),
			conn: Mutex::new(None),
			queue,
		}
	}

	pub(crate) fn state(&self) -> ChanState {
		self.info.lock().state
	}

	pub(crate) fn remote(&self) -> u16 {
		self.info.lock().remote
	}

	pub(crate) fn connection(&self) -> Option<Arc<Connection>> {
		self.conn.lock().clone()
	}

	/// Bind this channel to a connection and mark it connecting. The
	/// caller adjusts the connection refcount under the root lock.
	pub(crate) fn set_connecting(&self, conn: &Arc<Connection>) {
		let mut info = self.info.lock();
		debug_assert!(info.state == ChanState::Created);
		info.state = ChanState::Connecting;
		*self.conn.lock() = Some(conn.clone());
		conn.channels.set(u32::from(self.id), ());
	}

	/// Record the remote id and mark the channel connected, waking any
	/// pending connect waiter.
	pub(crate) fn set_connected(&self, remote: u16) {
		let mut info = self.info.lock();
		if info.state == ChanState::Closed {
			return;
		}
		info.remote = remote;
		info.state = ChanState::Connected;
		self.pending.notify_all();
	}

	/// Move to `Closed`, returning the previous state, or `None` if the
	/// channel was already closed. Waiters on the pending condition are
	/// always woken.
	pub(crate) fn mark_closed(&self) -> Option<ChanState> {
		let mut info = self.info.lock();
		if info.state == ChanState::Closed {
			return None;
		}
		let prev = info.state;
		info.state = ChanState::Closed;
		self.pending.notify_all();
		Some(prev)
	}

	/// Detach the connection reference, if any.
	pub(crate) fn take_connection(&self) -> Option<Arc<Connection>> {
		self.conn.lock().take()
	}

	/// Block until the pending connect completes. Returns the remote
	/// channel id on success, `Closed` if the channel died first.
	pub(crate) fn wait_connected(&self) -> Result<u16> {
		let mut info = self.info.lock();
		loop {
			match info.state {
				ChanState::Connected => return Ok(info.remote),
				ChanState::Closed => return Err(Error::Closed),
				_ => self.pending.wait(&mut info),
			}
		}
	}
}
