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

//! The sender daemon: one state-machine thread per peer that pops
//! queued files and drives the transfer protocol as the source side.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use courier_msgq::{MsgQueue, TlsCreds};
use courier_util::{Mutex, StopState};

use crate::config::{DaemonMode, Priority, TransferConfig};
use crate::disposition::Dispositions;
use crate::error::{Error, Result};
use crate::peers::{
	backoff_sleep, monitor_loop, OutgoingFile, Peer, SessionRegistry, Transfers,
	BACKOFF_START,
};
use crate::proto::{encode_block_offset, encode_u32, FileInfo, TransferMsg, LOCAL_VERSION};
use crate::session::{
	decode_ident, expect, negotiate_version, recv, resolve_peer, send, send_disconnect,
	send_empty,
};

/// Default block size for file data messages.
pub const DEFAULT_BLOCK_SIZE: u32 = 8192;

/// Sender daemon configuration.
#[derive(Debug, Clone)]
pub struct SenderConfig {
	/// Identity, mode, peers, TLS.
	pub transfer: TransferConfig,
	/// Bytes of file data per `FileBlock`.
	pub block_size: u32,
	/// Drain the per-peer file queues round-robin instead of high
	/// priority first.
	pub fair: bool,
	/// Post-send placement policy; archived and failed files land in
	/// per-peer subdirectories keyed by the receiving identity.
	pub dispositions: Dispositions,
}

/// Outcome of offering one file to the peer.
enum FileOutcome {
	/// Delivered (or acknowledged as duplicate): success disposition.
	Delivered,
	/// The peer refused it: error disposition.
	Rejected,
	/// A local problem (unreadable file): error disposition, session
	/// continues.
	LocalFailed,
}

/// The source side of the file transfer system.
pub struct SenderDaemon {
	queue: MsgQueue,
	transfers: Arc<Transfers>,
	config: Arc<SenderConfig>,
	stop: Arc<StopState>,
	registry: Arc<SessionRegistry>,
	threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl SenderDaemon {
	/// Validate the configuration and build the daemon. Nothing runs
	/// until `start`.
	pub fn new(config: SenderConfig) -> Result<SenderDaemon> {
		config.transfer.validate()?;
		let idents: Vec<String> = config
			.transfer
			.peers
			.iter()
			.map(|p| p.ident.clone())
			.collect();
		config.dispositions.validate(&idents)?;
		if config.block_size == 0 {
			return Err(Error::Config(String::from("block size must be non-zero")));
		}
		let transfers = Arc::new(Transfers::new(&config.transfer.peers, config.fair)?);
		let queue = MsgQueue::create()?;
		if let Some(tls) = &config.transfer.tls {
			queue.set_tls_creds(TlsCreds::new(
				&tls.ca_file,
				&tls.cert_file,
				&tls.key_file,
			)?);
		}
		Ok(SenderDaemon {
			queue,
			transfers,
			config: Arc::new(config),
			stop: Arc::new(StopState::new()),
			registry: SessionRegistry::new(),
			threads: Mutex::new(vec![]),
		})
	}

	/// The peer directory.
	pub fn transfers(&self) -> Arc<Transfers> {
		self.transfers.clone()
	}

	/// Queue a file for delivery to `ident` under the peer's default
	/// priority class.
	pub fn queue_file(&self, ident: &str, path: &Path) -> Result<()> {
		let peer = self
			.transfers
			.get(ident)
			.ok_or_else(|| Error::Config(format!("unknown peer '{}'", ident)))?;
		self.queue_file_with_priority(ident, path, peer.priority)
	}

	/// Queue a file for delivery under an explicit priority class.
	pub fn queue_file_with_priority(
		&self,
		ident: &str,
		path: &Path,
		priority: Priority,
	) -> Result<()> {
		let peer = self
			.transfers
			.get(ident)
			.ok_or_else(|| Error::Config(format!("unknown peer '{}'", ident)))?;
		peer.enqueue(OutgoingFile {
			path: path.to_path_buf(),
			priority,
		})
	}

	/// Start the listener or the per-peer connector threads, plus the
	/// control monitor.
	pub fn start(&self) -> Result<()> {
		match &self.config.transfer.mode {
			DaemonMode::Listen { bind } => {
				if self.config.transfer.tls.is_some() {
					self.queue.bind_tls(bind)?;
				} else {
					self.queue.bind_tcp(bind)?;
				}
				self.spawn_monitor(true);
			}
			DaemonMode::Connect => {
				self.spawn_monitor(false);
				for peer in self.transfers.iter() {
					self.spawn_connector(peer);
				}
			}
		}
		Ok(())
	}

	fn spawn_monitor(&self, accept_sessions: bool) {
		let queue = self.queue.clone();
		let registry = self.registry.clone();
		let transfers = self.transfers.clone();
		let stop = self.stop.clone();
		let config = self.config.clone();
		let handle = thread::Builder::new()
			.name("snd_monitor".to_string())
			.spawn(move || {
				let session_queue = queue.clone();
				let session_transfers = transfers.clone();
				let session_stop = stop.clone();
				let session_registry = registry.clone();
				monitor_loop(
					&queue,
					&registry,
					&transfers,
					&stop,
					move |channel, addr| {
						if !accept_sessions {
							debug!(
								"ignoring unsolicited channel {:#06x} from {}",
								channel, addr
							);
							return;
						}
						spawn_session_thread(
							&session_queue,
							channel,
							&session_transfers,
							None,
							&config,
							&session_stop,
							&session_registry,
						);
					},
				);
			})
			.expect("unable to spawn monitor thread");
		self.threads.lock().push(handle);
	}

	fn spawn_connector(&self, peer: Arc<Peer>) {
		let queue = self.queue.clone();
		let transfers = self.transfers.clone();
		let config = self.config.clone();
		let stop = self.stop.clone();
		let registry = self.registry.clone();
		let name = format!("snd_{}", peer.ident);
		let handle = thread::Builder::new()
			.name(name)
			.spawn(move || {
				connector_loop(&queue, &transfers, &peer, &config, &stop, &registry)
			})
			.expect("unable to spawn connector thread");
		self.threads.lock().push(handle);
	}

	/// Stop every thread and shut the transport down.
	pub fn stop(&self) {
		self.stop.stop();
		self.transfers.unblock_all();
		for (_, queue, _) in self.registry.drain() {
			queue.shutdown();
		}
		self.queue.shutdown_all();
		let handles: Vec<_> = self.threads.lock().drain(..).collect();
		for handle in handles {
			let _ = handle.join();
		}
	}
}

fn spawn_session_thread(
	queue: &MsgQueue,
	channel: u16,
	transfers: &Arc<Transfers>,
	expected: Option<Arc<Peer>>,
	config: &Arc<SenderConfig>,
	stop: &Arc<StopState>,
	registry: &Arc<SessionRegistry>,
) {
	let split = match queue.channel_split(channel) {
		Ok(split) => split,
		Err(e) => {
			warn!("unable to split channel {:#06x}: {}", channel, e);
			let _ = queue.channel_kill(channel);
			return;
		}
	};
	registry.register(channel, split.clone());

	let queue = queue.clone();
	let transfers = transfers.clone();
	let config = config.clone();
	let stop = stop.clone();
	let registry_owned = registry.clone();
	let spawned = thread::Builder::new()
		.name(format!("snd_chan_{:04x}", channel))
		.spawn(move || {
			let result = run_sender_session(
				&split, channel, &transfers, expected, &config, &stop, &registry_owned,
			);
			if let Err(e) = result {
				warn!("sender session on {:#06x} ended: {}", channel, e);
			}
			registry_owned.remove(channel);
			let _ = queue.channel_kill(channel);
		});
	if let Err(e) = spawned {
		error!("unable to spawn session thread: {}", e);
		registry.remove(channel);
	}
}

fn connector_loop(
	queue: &MsgQueue,
	transfers: &Arc<Transfers>,
	peer: &Arc<Peer>,
	config: &Arc<SenderConfig>,
	stop: &Arc<StopState>,
	registry: &Arc<SessionRegistry>,
) {
	let mut backoff = BACKOFF_START;
	while !stop.is_stopped() && !peer.wants_disconnect() {
		let channel = match connect_peer(queue, peer, config) {
			Ok(channel) => channel,
			Err(e) => {
				warn!("unable to connect to '{}': {}", peer.ident, e);
				backoff = backoff_sleep(stop, backoff);
				continue;
			}
		};

		let split = match queue.channel_split(channel) {
			Ok(split) => split,
			Err(e) => {
				warn!("unable to split channel to '{}': {}", peer.ident, e);
				let _ = queue.channel_kill(channel);
				backoff = backoff_sleep(stop, backoff);
				continue;
			}
		};
		registry.register(channel, split.clone());
		registry.set_ident(channel, &peer.ident);

		let result = run_sender_session(
			&split,
			channel,
			transfers,
			Some(peer.clone()),
			config,
			stop,
			registry,
		);
		registry.remove(channel);
		let _ = queue.channel_kill(channel);

		match result {
			Ok(()) | Err(Error::SessionClosed) => {
				// An established session ended; reconnect promptly.
				backoff = BACKOFF_START;
			}
			Err(e) => {
				if !e.retryable() {
					info!(
						"peer '{}' asked us not to reconnect: {}",
						peer.ident, e
					);
					peer.set_disconnect();
					break;
				}
				warn!("session with '{}' failed: {}", peer.ident, e);
				backoff = backoff_sleep(stop, backoff);
			}
		}
	}
	debug!("connector for '{}' exiting", peer.ident);
}

fn connect_peer(queue: &MsgQueue, peer: &Arc<Peer>, config: &Arc<SenderConfig>) -> Result<u16> {
	let mut last = Error::Config(format!("peer '{}' has no addresses", peer.ident));
	for addr in &peer.addrs {
		let attempt = if config.transfer.tls.is_some() {
			queue.connect_tls(addr, None)
		} else {
			queue.connect_tcp(addr)
		};
		match attempt {
			Ok(channel) => return Ok(channel),
			Err(e) => {
				debug!("connect to {} failed: {}", addr, e);
				last = Error::Msgq(e);
			}
		}
	}
	Err(last)
}

fn run_sender_session(
	split: &MsgQueue,
	channel: u16,
	transfers: &Arc<Transfers>,
	expected: Option<Arc<Peer>>,
	config: &Arc<SenderConfig>,
	stop: &Arc<StopState>,
	registry: &Arc<SessionRegistry>,
) -> Result<()> {
	split.set_keepalive(channel, config.transfer.keepalive_secs)?;

	send(split, channel, TransferMsg::SenderVersion, &encode_u32(LOCAL_VERSION))?;
	let msg = expect(split, TransferMsg::ReceiverVersion)?;
	let remote_version = crate::proto::decode_u32(msg.payload())?;
	let version = match negotiate_version(LOCAL_VERSION, remote_version) {
		Ok(version) => version,
		Err(e) => {
			send_disconnect(split, channel, false, "unsupported protocol version");
			return Err(e);
		}
	};

	send(
		split,
		channel,
		TransferMsg::Ident,
		config.transfer.ident.as_bytes(),
	)?;
	let msg = expect(split, TransferMsg::Ident)?;
	let remote_ident = decode_ident(&msg)?;
	let peer = match resolve_peer(transfers, expected.as_ref(), &remote_ident) {
		Ok(peer) => peer,
		Err(e) => {
			send_disconnect(split, channel, false, "unexpected identity");
			return Err(e);
		}
	};
	registry.set_ident(channel, &peer.ident);
	if let Err(e) = peer.bind_channel(channel) {
		send_disconnect(split, channel, true, "already connected");
		return Err(e);
	}
	peer.set_remote_version(version);

	let result = (|| {
		send_empty(split, channel, TransferMsg::Ready)?;
		expect(split, TransferMsg::Ready)?;
		info!(
			"sender session with '{}' ready (version {}, {})",
			peer.ident,
			version,
			split
				.connection_info(channel)
				.unwrap_or_else(|_| String::from("?"))
		);
		peer.rearm();
		file_loop(split, channel, &peer, config, stop)
	})();
	peer.clear_channel(channel);
	result
}

fn file_loop(
	split: &MsgQueue,
	channel: u16,
	peer: &Arc<Peer>,
	config: &Arc<SenderConfig>,
	stop: &Arc<StopState>,
) -> Result<()> {
	loop {
		if stop.is_stopped() {
			send_disconnect(split, channel, true, "shutting down");
			return Ok(());
		}
		let file = match peer.next_file() {
			Ok(file) => file,
			// Unblocked for teardown, or the daemon is stopping.
			Err(_) => return Ok(()),
		};

		match offer_file(split, channel, &file, config) {
			Ok(FileOutcome::Delivered) => {
				if let Err(e) = config.dispositions.success(&peer.ident, &file.path) {
					warn!(
						"unable to dispose of sent file {}: {}",
						file.path.display(),
						e
					);
				}
			}
			Ok(FileOutcome::Rejected) | Ok(FileOutcome::LocalFailed) => {
				if let Err(e) = config.dispositions.error(&peer.ident, &file.path) {
					warn!(
						"unable to dispose of failed file {}: {}",
						file.path.display(),
						e
					);
				}
			}
			Err(e) => {
				// Transport or session failure: the file was not
				// delivered, keep it for the next session.
				peer.requeue(file);
				return Err(e);
			}
		}
	}
}

fn offer_file(
	split: &MsgQueue,
	channel: u16,
	file: &OutgoingFile,
	config: &Arc<SenderConfig>,
) -> Result<FileOutcome> {
	let name = match file.path.file_name().and_then(|n| n.to_str()) {
		Some(name) => name.to_string(),
		None => {
			warn!("queued path {} has no usable name", file.path.display());
			return Ok(FileOutcome::LocalFailed);
		}
	};
	let handle = match File::open(&file.path) {
		Ok(handle) => handle,
		Err(e) => {
			warn!("unable to open {}: {}", file.path.display(), e);
			return Ok(FileOutcome::LocalFailed);
		}
	};
	let meta = match handle.metadata() {
		Ok(meta) => meta,
		Err(e) => {
			warn!("unable to stat {}: {}", file.path.display(), e);
			return Ok(FileOutcome::LocalFailed);
		}
	};
	let info = FileInfo {
		size: meta.len(),
		block_size: config.block_size,
		mode: meta.permissions().mode() & 0o7777,
		name,
	};
	debug!(
		"offering {} ({} bytes) on channel {:#06x}",
		info.name, info.size, channel
	);
	send(split, channel, TransferMsg::NewFile, &info.encode()?)?;

	let (reply, _msg) = recv(split)?;
	match reply {
		TransferMsg::NewFileReady => {}
		TransferMsg::DuplicateFile => {
			info!("peer already has {}", file.path.display());
			return Ok(FileOutcome::Delivered);
		}
		TransferMsg::RejectFile => {
			info!("peer rejected {}", file.path.display());
			return Ok(FileOutcome::Rejected);
		}
		TransferMsg::DisconnectRetry => {
			return Err(Error::Disconnected {
				retry: true,
				reason: String::new(),
			});
		}
		TransferMsg::Disconnect => {
			return Err(Error::Disconnected {
				retry: false,
				reason: String::new(),
			});
		}
		other => {
			return Err(Error::Protocol(format!(
				"unexpected reply to NewFile: {:?}",
				other
			)));
		}
	}

	// Stream the blocks, offsets covering the file monotonically.
	let mut offset = 0u64;
	while offset < info.size {
		let want = (u64::from(config.block_size)).min(info.size - offset) as usize;
		let mut data = vec![0u8; want];
		if let Err(e) = read_exact_at(&handle, &mut data, offset) {
			// The file changed under us; the receiver cleans up the
			// placeholder when the session dies.
			return Err(Error::Protocol(format!(
				"short read from {}: {}",
				file.path.display(),
				e
			)));
		}
		split.scatter_send_no_copy(
			channel,
			TransferMsg::FileBlock as u16,
			vec![encode_block_offset(offset), data],
		)?;
		offset += want as u64;
	}
	send_empty(split, channel, TransferMsg::FileComplete)?;

	// Sends on a dead channel are silently dropped, so wait for the
	// transport to drain before treating the file as delivered. A
	// session that dies here requeues the file; the receiver's
	// duplicate suppression absorbs the re-offer if it did land.
	if split.flush_channel(channel).is_err() {
		return Err(Error::SessionClosed);
	}
	debug!("completed {} ({} bytes)", file.path.display(), info.size);
	Ok(FileOutcome::Delivered)
}

fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
	while !buf.is_empty() {
		match file.read_at(buf, offset) {
			Ok(0) => {
				return Err(std::io::Error::new(
					std::io::ErrorKind::UnexpectedEof,
					"file truncated while sending",
				));
			}
			Ok(n) => {
				buf = &mut buf[n..];
				offset += n as u64;
			}
			Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
			Err(e) => return Err(e),
		}
	}
	Ok(())
}
