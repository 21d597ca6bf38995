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

//! The peer directory: every configured remote identity with its
//! addresses, filter, outbound file queues and connection state, plus
//! the control-channel monitor that reacts to new and dying channels.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_msgq::{
	decode_channel_payload, MqFunction, MsgQueue, Multiqueue, Subqueue, CHANNEL_CONTROL,
	CTL_CHANNEL_DIED, CTL_NEW_CONNECTION,
};
use courier_util::{Mutex, RwLock, StopState};
use regex::Regex;

use crate::config::{check_ident, PeerConfig, Priority};
use crate::error::{Error, Result};

/// Initial reconnect backoff.
pub(crate) const BACKOFF_START: Duration = Duration::from_secs(1);
/// Reconnect backoff cap.
pub(crate) const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// A file queued for delivery to one peer.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
	/// Absolute path of the file to deliver.
	pub path: PathBuf,
	/// Queue class it was enqueued under.
	pub priority: Priority,
}

/// One configured remote endpoint and its runtime state.
pub struct Peer {
	/// Validated unique identity.
	pub ident: String,
	/// Addresses to dial in connector mode.
	pub addrs: Vec<SocketAddr>,
	/// Default priority class for this peer's files.
	pub priority: Priority,
	/// Receiver-side filename gate.
	pub filter: Option<Regex>,

	/// The single active transfer channel, when connected.
	channel: Mutex<Option<u16>>,
	/// Negotiated remote protocol version.
	remote_version: AtomicU32,
	/// Set when the peer told us not to reconnect.
	disconnect: AtomicBool,

	/// Outbound files, drained high before low (or round-robin when
	/// the daemon is configured fair).
	queue: Multiqueue<OutgoingFile>,
	high: Subqueue<OutgoingFile>,
	low: Subqueue<OutgoingFile>,

	/// Filenames already received from this peer, for duplicate
	/// suppression on the receiving side.
	completed: Mutex<HashSet<String>>,
}

impl Peer {
	fn from_config(config: &PeerConfig, fair: bool) -> Result<Peer> {
		check_ident(&config.ident)?;
		let filter = match &config.filter {
			Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
				Error::Config(format!(
					"bad filter for peer '{}': {}",
					config.ident, e
				))
			})?),
			None => None,
		};
		let queue = if fair {
			Multiqueue::fair()
		} else {
			Multiqueue::unfair()
		};
		let high = queue.create_queue()?;
		let low = queue.create_queue()?;
		Ok(Peer {
			ident: config.ident.clone(),
			addrs: config.addrs.clone(),
			priority: config.priority,
			filter,
			channel: Mutex::new(None),
			remote_version: AtomicU32::new(0),
			disconnect: AtomicBool::new(false),
			queue,
			high,
			low,
			completed: Mutex::new(HashSet::new()),
		})
	}

	/// Queue a file for delivery.
	pub fn enqueue(&self, file: OutgoingFile) -> Result<()> {
		match file.priority {
			Priority::High => self.high.add(file)?,
			Priority::Low => self.low.add(file)?,
		}
		Ok(())
	}

	/// Pop the next file to send; blocks until one is queued or the
	/// queue is unblocked for session teardown.
	pub(crate) fn next_file(&self) -> Result<OutgoingFile> {
		Ok(self.queue.get()?)
	}

	/// Put a file back so it is retried first after a reconnect.
	pub(crate) fn requeue(&self, file: OutgoingFile) {
		let _ = self.queue.push_back(file);
	}

	/// Wake a sender thread blocked on the file queue.
	pub(crate) fn unblock(&self) {
		self.queue.disable(MqFunction::Remove);
	}

	/// Re-arm the file queue for a new session.
	pub(crate) fn rearm(&self) {
		self.queue.enable(MqFunction::Remove);
	}

	/// Number of files waiting.
	pub fn backlog(&self) -> usize {
		self.queue.len()
	}

	/// Bind the active channel. Fails if one is already active.
	pub(crate) fn bind_channel(&self, channel: u16) -> Result<()> {
		let mut active = self.channel.lock();
		if let Some(existing) = *active {
			return Err(Error::Protocol(format!(
				"peer '{}' already active on channel {:#06x}",
				self.ident, existing
			)));
		}
		*active = Some(channel);
		Ok(())
	}

	/// Clear the active channel if it matches.
	pub(crate) fn clear_channel(&self, channel: u16) {
		let mut active = self.channel.lock();
		if *active == Some(channel) {
			*active = None;
		}
	}

	/// The active channel, when connected.
	pub fn active_channel(&self) -> Option<u16> {
		*self.channel.lock()
	}

	pub(crate) fn set_remote_version(&self, version: u32) {
		self.remote_version.store(version, Ordering::SeqCst);
	}

	/// Negotiated protocol version of the last session.
	pub fn remote_version(&self) -> u32 {
		self.remote_version.load(Ordering::SeqCst)
	}

	/// Whether the peer forbade reconnecting.
	pub(crate) fn wants_disconnect(&self) -> bool {
		self.disconnect.load(Ordering::SeqCst)
	}

	pub(crate) fn set_disconnect(&self) {
		self.disconnect.store(true, Ordering::SeqCst);
	}

	/// Record a completed receive for duplicate suppression.
	pub(crate) fn record_completed(&self, name: &str) {
		self.completed.lock().insert(name.to_string());
	}

	/// Whether a filename was already received from this peer.
	pub(crate) fn already_completed(&self, name: &str) -> bool {
		self.completed.lock().contains(name)
	}

	/// Apply the filename filter; no filter accepts everything.
	pub(crate) fn filter_accepts(&self, name: &str) -> bool {
		match &self.filter {
			Some(filter) => filter.is_match(name),
			None => true,
		}
	}
}

/// Identity-keyed directory of all configured peers.
pub struct Transfers {
	peers: RwLock<BTreeMap<String, Arc<Peer>>>,
}

impl Transfers {
	/// Build the directory from configuration. `fair` selects the
	/// draining policy of every peer's file queue.
	pub fn new(configs: &[PeerConfig], fair: bool) -> Result<Transfers> {
		let mut peers = BTreeMap::new();
		for config in configs {
			let peer = Peer::from_config(config, fair)?;
			if peers
				.insert(peer.ident.clone(), Arc::new(peer))
				.is_some()
			{
				return Err(Error::Config(format!(
					"duplicate peer identity '{}'",
					config.ident
				)));
			}
		}
		Ok(Transfers {
			peers: RwLock::new(peers),
		})
	}

	/// Look up a peer by identity.
	pub fn get(&self, ident: &str) -> Option<Arc<Peer>> {
		self.peers.read().get(ident).cloned()
	}

	/// All peers in identity order.
	pub fn iter(&self) -> Vec<Arc<Peer>> {
		self.peers.read().values().cloned().collect()
	}

	/// Wake every blocked sender loop (shutdown path).
	pub fn unblock_all(&self) {
		for peer in self.iter() {
			peer.unblock();
		}
	}
}

/// Channel-to-session bookkeeping used by the monitor to tear sessions
/// down when their channel dies.
#[derive(Default)]
pub(crate) struct SessionRegistry {
	sessions: Mutex<HashMap<u16, (MsgQueue, Option<String>)>>,
}

impl SessionRegistry {
	pub(crate) fn new() -> Arc<SessionRegistry> {
		Arc::new(SessionRegistry {
			sessions: Mutex::new(HashMap::new()),
		})
	}

	pub(crate) fn register(&self, channel: u16, queue: MsgQueue) {
		self.sessions.lock().insert(channel, (queue, None));
	}

	/// Record which peer a session resolved to once the identity
	/// exchange completes.
	pub(crate) fn set_ident(&self, channel: u16, ident: &str) {
		if let Some(entry) = self.sessions.lock().get_mut(&channel) {
			entry.1 = Some(ident.to_string());
		}
	}

	pub(crate) fn remove(&self, channel: u16) -> Option<(MsgQueue, Option<String>)> {
		self.sessions.lock().remove(&channel)
	}

	pub(crate) fn drain(&self) -> Vec<(u16, MsgQueue, Option<String>)> {
		self.sessions
			.lock()
			.drain()
			.map(|(chan, (queue, ident))| (chan, queue, ident))
			.collect()
	}
}

/// Watch the main queue's control channel: hand new channels to
/// `on_new` and tear down the session of every dying channel. Runs
/// until the queue shuts down.
pub(crate) fn monitor_loop<F>(
	queue: &MsgQueue,
	registry: &Arc<SessionRegistry>,
	transfers: &Arc<Transfers>,
	stop: &Arc<StopState>,
	mut on_new: F,
) where
	F: FnMut(u16, String),
{
	loop {
		let msg = match queue.get_message() {
			Ok(msg) => msg,
			Err(_) => break,
		};
		if stop.is_stopped() {
			break;
		}
		if msg.channel() != CHANNEL_CONTROL {
			// A session message popped before its channel was split
			// off; put it back so the session thread sees it.
			let _ = queue.push_back_message(msg);
			continue;
		}
		match msg.typ() {
			CTL_NEW_CONNECTION => {
				let payload = msg.to_vec();
				let channel = match decode_channel_payload(&payload) {
					Ok(channel) => channel,
					Err(_) => continue,
				};
				let addr = String::from_utf8_lossy(&payload[2..]).to_string();
				debug!("new channel {:#06x} from {}", channel, addr);
				on_new(channel, addr);
			}
			CTL_CHANNEL_DIED => {
				let channel = match decode_channel_payload(msg.payload()) {
					Ok(channel) => channel,
					Err(_) => continue,
				};
				debug!("channel {:#06x} died", channel);
				if let Some((session_queue, ident)) = registry.remove(channel) {
					session_queue.shutdown();
					if let Some(ident) = ident {
						if let Some(peer) = transfers.get(&ident) {
							peer.clear_channel(channel);
							peer.unblock();
						}
					}
				}
			}
			_ => {}
		}
	}
	trace!("monitor exiting");
}

/// Sleep out a backoff period in one-second slices, bailing early on
/// stop. Returns the next backoff value.
pub(crate) fn backoff_sleep(stop: &StopState, current: Duration) -> Duration {
	let mut remaining = current;
	while remaining > Duration::from_secs(0) {
		if stop.is_stopped() {
			break;
		}
		let slice = remaining.min(Duration::from_secs(1));
		std::thread::sleep(slice);
		remaining -= slice;
	}
	(current * 2).min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn peer_config(ident: &str) -> PeerConfig {
		PeerConfig {
			ident: ident.to_string(),
			addrs: vec![],
			filter: None,
			priority: Priority::Low,
		}
	}

	#[test]
	fn priority_queue_drains_high_first() {
		let mut config = peer_config("dest1");
		config.priority = Priority::High;
		let peer = Peer::from_config(&config, false).unwrap();
		peer.enqueue(OutgoingFile {
			path: PathBuf::from("low-1"),
			priority: Priority::Low,
		})
		.unwrap();
		peer.enqueue(OutgoingFile {
			path: PathBuf::from("high-1"),
			priority: Priority::High,
		})
		.unwrap();
		peer.enqueue(OutgoingFile {
			path: PathBuf::from("high-2"),
			priority: Priority::High,
		})
		.unwrap();
		assert_eq!(peer.next_file().unwrap().path, PathBuf::from("high-1"));
		assert_eq!(peer.next_file().unwrap().path, PathBuf::from("high-2"));
		assert_eq!(peer.next_file().unwrap().path, PathBuf::from("low-1"));
	}

	#[test]
	fn unblock_wakes_and_rearm_restores() {
		let peer = Arc::new(Peer::from_config(&peer_config("dest1"), false).unwrap());
		let peer2 = peer.clone();
		let waiter = std::thread::spawn(move || peer2.next_file());
		std::thread::sleep(Duration::from_millis(50));
		peer.unblock();
		assert!(waiter.join().unwrap().is_err());
		peer.rearm();
		peer.enqueue(OutgoingFile {
			path: PathBuf::from("f"),
			priority: Priority::Low,
		})
		.unwrap();
		assert_eq!(peer.next_file().unwrap().path, PathBuf::from("f"));
	}

	#[test]
	fn filter_gate() {
		let mut config = peer_config("dest1");
		config.filter = Some(String::from(r"^flows-\d+$"));
		let peer = Peer::from_config(&config, false).unwrap();
		assert!(peer.filter_accepts("flows-20240101"));
		assert!(!peer.filter_accepts("notes.txt"));
	}

	#[test]
	fn single_active_channel() {
		let peer = Peer::from_config(&peer_config("dest1"), false).unwrap();
		peer.bind_channel(3).unwrap();
		assert!(peer.bind_channel(4).is_err());
		peer.clear_channel(3);
		peer.bind_channel(4).unwrap();
	}

	#[test]
	fn duplicate_ledger() {
		let peer = Peer::from_config(&peer_config("dest1"), false).unwrap();
		assert!(!peer.already_completed("a.bin"));
		peer.record_completed("a.bin");
		assert!(peer.already_completed("a.bin"));
	}

	#[test]
	fn transfers_lookup() {
		let transfers =
			Transfers::new(&[peer_config("alpha"), peer_config("beta")], false).unwrap();
		assert!(transfers.get("alpha").is_some());
		assert!(transfers.get("gamma").is_none());
		assert_eq!(transfers.iter().len(), 2);
	}
}
