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

//! The receiver daemon: one state-machine thread per peer that accepts
//! files into hidden placeholders and renames them into place once
//! complete.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use courier_msgq::{MsgQueue, TlsCreds};
use courier_util::{Mutex, Semaphore, StopState};

use crate::config::{DaemonMode, TransferConfig};
use crate::disposition::{check_directory, peer_dir, place_file, Dispositions};
use crate::error::{Error, Result};
use crate::peers::{
	backoff_sleep, monitor_loop, Peer, SessionRegistry, Transfers, BACKOFF_START,
};
use crate::proto::{decode_block, encode_u32, FileInfo, TransferMsg, LOCAL_VERSION};
use crate::session::{
	decode_ident, expect, negotiate_version, recv, resolve_peer, send, send_disconnect,
	send_empty,
};

/// Default bound on simultaneously open incoming files.
pub const DEFAULT_MAX_OPEN_FILES: usize = 64;

/// Receiver daemon configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
	/// Identity, mode, peers, TLS.
	pub transfer: TransferConfig,
	/// Base of the per-peer incoming directories: a peer's files (and
	/// their in-progress placeholders) live in
	/// `<incoming_dir>/<ident>/`.
	pub incoming_dir: PathBuf,
	/// Error placement and the post-receive hook, per peer.
	pub dispositions: Dispositions,
	/// Bound on simultaneously open incoming files across all peers.
	pub max_open_files: usize,
}

/// The destination side of the file transfer system.
pub struct ReceiverDaemon {
	queue: MsgQueue,
	transfers: Arc<Transfers>,
	config: Arc<ReceiverConfig>,
	stop: Arc<StopState>,
	registry: Arc<SessionRegistry>,
	open_files: Arc<Semaphore>,
	completed: Arc<Mutex<Vec<String>>>,
	threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ReceiverDaemon {
	/// Validate the configuration and build the daemon. Nothing runs
	/// until `start`.
	pub fn new(config: ReceiverConfig) -> Result<ReceiverDaemon> {
		config.transfer.validate()?;
		let idents: Vec<String> = config
			.transfer
			.peers
			.iter()
			.map(|p| p.ident.clone())
			.collect();
		check_directory(&config.incoming_dir)?;
		for ident in &idents {
			check_directory(&peer_dir(&config.incoming_dir, ident)?)?;
		}
		config.dispositions.validate(&idents)?;
		if config.max_open_files == 0 {
			return Err(Error::Config(String::from(
				"max open files must be non-zero",
			)));
		}
		let transfers = Arc::new(Transfers::new(&config.transfer.peers, true)?);
		let queue = MsgQueue::create()?;
		if let Some(tls) = &config.transfer.tls {
			queue.set_tls_creds(TlsCreds::new(
				&tls.ca_file,
				&tls.cert_file,
				&tls.key_file,
			)?);
		}
		let open_files = Arc::new(Semaphore::new(config.max_open_files));
		Ok(ReceiverDaemon {
			queue,
			transfers,
			config: Arc::new(config),
			stop: Arc::new(StopState::new()),
			registry: SessionRegistry::new(),
			open_files,
			completed: Arc::new(Mutex::new(vec![])),
			threads: Mutex::new(vec![]),
		})
	}

	/// The peer directory.
	pub fn transfers(&self) -> Arc<Transfers> {
		self.transfers.clone()
	}

	/// Names of completed receives, in completion order.
	pub fn completed_files(&self) -> Vec<String> {
		self.completed.lock().clone()
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

	fn session_env(&self) -> SessionEnv {
		SessionEnv {
			transfers: self.transfers.clone(),
			config: self.config.clone(),
			stop: self.stop.clone(),
			registry: self.registry.clone(),
			open_files: self.open_files.clone(),
			completed: self.completed.clone(),
		}
	}

	fn spawn_monitor(&self, accept_sessions: bool) {
		let queue = self.queue.clone();
		let registry = self.registry.clone();
		let transfers = self.transfers.clone();
		let stop = self.stop.clone();
		let env = self.session_env();
		let handle = thread::Builder::new()
			.name("rcv_monitor".to_string())
			.spawn(move || {
				let session_queue = queue.clone();
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
						spawn_session_thread(&session_queue, channel, None, &env);
					},
				);
			})
			.expect("unable to spawn monitor thread");
		self.threads.lock().push(handle);
	}

	fn spawn_connector(&self, peer: Arc<Peer>) {
		let queue = self.queue.clone();
		let env = self.session_env();
		let name = format!("rcv_{}", peer.ident);
		let handle = thread::Builder::new()
			.name(name)
			.spawn(move || connector_loop(&queue, &peer, &env))
			.expect("unable to spawn connector thread");
		self.threads.lock().push(handle);
	}

	/// Stop every thread and shut the transport down.
	pub fn stop(&self) {
		self.stop.stop();
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

/// Everything a receiver session thread needs.
#[derive(Clone)]
struct SessionEnv {
	transfers: Arc<Transfers>,
	config: Arc<ReceiverConfig>,
	stop: Arc<StopState>,
	registry: Arc<SessionRegistry>,
	open_files: Arc<Semaphore>,
	completed: Arc<Mutex<Vec<String>>>,
}

fn spawn_session_thread(
	queue: &MsgQueue,
	channel: u16,
	expected: Option<Arc<Peer>>,
	env: &SessionEnv,
) {
	let split = match queue.channel_split(channel) {
		Ok(split) => split,
		Err(e) => {
			warn!("unable to split channel {:#06x}: {}", channel, e);
			let _ = queue.channel_kill(channel);
			return;
		}
	};
	env.registry.register(channel, split.clone());

	let queue = queue.clone();
	let env_owned = env.clone();
	let spawned = thread::Builder::new()
		.name(format!("rcv_chan_{:04x}", channel))
		.spawn(move || {
			let result = run_receiver_session(&split, channel, expected, &env_owned);
			if let Err(e) = result {
				warn!("receiver session on {:#06x} ended: {}", channel, e);
			}
			env_owned.registry.remove(channel);
			let _ = queue.channel_kill(channel);
		});
	if let Err(e) = spawned {
		error!("unable to spawn session thread: {}", e);
		env.registry.remove(channel);
	}
}

fn connector_loop(queue: &MsgQueue, peer: &Arc<Peer>, env: &SessionEnv) {
	let mut backoff = BACKOFF_START;
	while !env.stop.is_stopped() && !peer.wants_disconnect() {
		let channel = match connect_peer(queue, peer, env) {
			Ok(channel) => channel,
			Err(e) => {
				warn!("unable to connect to '{}': {}", peer.ident, e);
				backoff = backoff_sleep(&env.stop, backoff);
				continue;
			}
		};
		let split = match queue.channel_split(channel) {
			Ok(split) => split,
			Err(e) => {
				warn!("unable to split channel to '{}': {}", peer.ident, e);
				let _ = queue.channel_kill(channel);
				backoff = backoff_sleep(&env.stop, backoff);
				continue;
			}
		};
		env.registry.register(channel, split.clone());
		env.registry.set_ident(channel, &peer.ident);

		let result = run_receiver_session(&split, channel, Some(peer.clone()), env);
		env.registry.remove(channel);
		let _ = queue.channel_kill(channel);

		match result {
			Ok(()) | Err(Error::SessionClosed) => {
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
				backoff = backoff_sleep(&env.stop, backoff);
			}
		}
	}
	debug!("connector for '{}' exiting", peer.ident);
}

fn connect_peer(queue: &MsgQueue, peer: &Arc<Peer>, env: &SessionEnv) -> Result<u16> {
	let mut last = Error::Config(format!("peer '{}' has no addresses", peer.ident));
	for addr in &peer.addrs {
		let attempt = if env.config.transfer.tls.is_some() {
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

fn run_receiver_session(
	split: &MsgQueue,
	channel: u16,
	expected: Option<Arc<Peer>>,
	env: &SessionEnv,
) -> Result<()> {
	split.set_keepalive(channel, env.config.transfer.keepalive_secs)?;

	let msg = expect(split, TransferMsg::SenderVersion)?;
	let remote_version = crate::proto::decode_u32(msg.payload())?;
	send(
		split,
		channel,
		TransferMsg::ReceiverVersion,
		&encode_u32(LOCAL_VERSION),
	)?;
	let version = match negotiate_version(LOCAL_VERSION, remote_version) {
		Ok(version) => version,
		Err(e) => {
			send_disconnect(split, channel, false, "unsupported protocol version");
			return Err(e);
		}
	};

	let msg = expect(split, TransferMsg::Ident)?;
	let remote_ident = decode_ident(&msg)?;
	let peer = match resolve_peer(&env.transfers, expected.as_ref(), &remote_ident) {
		Ok(peer) => peer,
		Err(e) => {
			send_disconnect(split, channel, false, "unexpected identity");
			return Err(e);
		}
	};
	env.registry.set_ident(channel, &peer.ident);
	send(
		split,
		channel,
		TransferMsg::Ident,
		env.config.transfer.ident.as_bytes(),
	)?;
	if let Err(e) = peer.bind_channel(channel) {
		send_disconnect(split, channel, true, "already connected");
		return Err(e);
	}
	peer.set_remote_version(version);

	let result = (|| {
		expect(split, TransferMsg::Ready)?;
		send_empty(split, channel, TransferMsg::Ready)?;
		info!(
			"receiver session with '{}' ready (version {}, {})",
			peer.ident,
			version,
			split
				.connection_info(channel)
				.unwrap_or_else(|_| String::from("?"))
		);
		file_loop(split, channel, &peer, env)
	})();
	peer.clear_channel(channel);
	result
}

fn file_loop(split: &MsgQueue, channel: u16, peer: &Arc<Peer>, env: &SessionEnv) -> Result<()> {
	// This peer's own incoming directory; files from different peers
	// never share a path.
	let incoming_dir = peer_dir(&env.config.incoming_dir, &peer.ident)?;
	let mut current: Option<IncomingFile> = None;

	let result = loop {
		if env.stop.is_stopped() {
			send_disconnect(split, channel, true, "shutting down");
			break Ok(());
		}
		let (typ, msg) = match recv(split) {
			Ok(received) => received,
			Err(Error::SessionClosed) => break Ok(()),
			Err(e) => break Err(e),
		};
		match typ {
			TransferMsg::NewFile => {
				if current.is_some() {
					send_disconnect(split, channel, true, "protocol violation");
					break Err(Error::Protocol(String::from(
						"NewFile while a transfer is in progress",
					)));
				}
				let info = match FileInfo::decode(msg.payload()) {
					Ok(info) => info,
					Err(e) => {
						warn!("undecodable file announcement: {}", e);
						send_empty(split, channel, TransferMsg::RejectFile)?;
						continue;
					}
				};
				if !filename_ok(&info.name) {
					warn!("rejecting illegal filename {:?}", info.name);
					send_empty(split, channel, TransferMsg::RejectFile)?;
					continue;
				}
				if !peer.filter_accepts(&info.name) {
					info!("filter rejects {} from '{}'", info.name, peer.ident);
					send_empty(split, channel, TransferMsg::RejectFile)?;
					continue;
				}
				let final_path = incoming_dir.join(&info.name);
				if peer.already_completed(&info.name) || final_path.exists() {
					info!("duplicate {} from '{}'", info.name, peer.ident);
					send_empty(split, channel, TransferMsg::DuplicateFile)?;
					continue;
				}
				// Bounded number of open incoming files across every
				// peer; keep waking to observe shutdown.
				loop {
					if env.open_files.acquire_timeout(Duration::from_secs(1)) {
						break;
					}
					if env.stop.is_stopped() {
						send_disconnect(split, channel, true, "shutting down");
						return Ok(());
					}
				}
				match IncomingFile::create(&incoming_dir, &info) {
					Ok(incoming) => {
						debug!(
							"receiving {} ({} bytes) from '{}'",
							info.name, info.size, peer.ident
						);
						current = Some(incoming);
						send_empty(split, channel, TransferMsg::NewFileReady)?;
					}
					Err(e) => {
						env.open_files.release();
						warn!("unable to open placeholder for {}: {}", info.name, e);
						send_empty(split, channel, TransferMsg::RejectFile)?;
					}
				}
			}
			TransferMsg::FileBlock => {
				let incoming = match current.as_mut() {
					Some(incoming) => incoming,
					None => {
						send_disconnect(split, channel, true, "protocol violation");
						break Err(Error::Protocol(String::from(
							"FileBlock outside a transfer",
						)));
					}
				};
				let name = incoming.name().to_string();
				let write_result = decode_block(msg.payload())
					.and_then(|(offset, data)| incoming.write_block(offset, data));
				if let Err(e) = write_result {
					warn!("bad block for {} from '{}': {}", name, peer.ident, e);
					send_empty(split, channel, TransferMsg::RejectFile)?;
					if let Some(placeholder) = current.take().map(IncomingFile::abort) {
						let _ = env
							.config
							.dispositions
							.error(&peer.ident, &placeholder);
					}
					env.open_files.release();
					// A peer that overruns the declared size loses the
					// connection.
					break Err(e);
				}
			}
			TransferMsg::FileComplete => {
				let incoming = match current.take() {
					Some(incoming) => incoming,
					None => {
						send_disconnect(split, channel, true, "protocol violation");
						break Err(Error::Protocol(String::from(
							"FileComplete outside a transfer",
						)));
					}
				};
				let name = incoming.name().to_string();
				match incoming.complete() {
					Ok(placed) => {
						env.open_files.release();
						peer.record_completed(&name);
						env.completed.lock().push(name.clone());
						info!(
							"received {} from '{}' as {}",
							name,
							peer.ident,
							placed.display()
						);
						env.config.dispositions.received(&placed);
					}
					Err(e) => {
						env.open_files.release();
						warn!("unable to complete {}: {}", name, e);
						send_disconnect(
							split,
							channel,
							true,
							"unable to place completed file",
						);
						break Err(e);
					}
				}
			}
			TransferMsg::DisconnectRetry => {
				debug!(
					"'{}' disconnected (retry): {}",
					peer.ident,
					String::from_utf8_lossy(msg.payload())
				);
				break Ok(());
			}
			TransferMsg::Disconnect => {
				info!(
					"'{}' disconnected: {}",
					peer.ident,
					String::from_utf8_lossy(msg.payload())
				);
				peer.set_disconnect();
				break Ok(());
			}
			other => {
				send_disconnect(split, channel, true, "protocol violation");
				break Err(Error::Protocol(format!(
					"unexpected message {:?}",
					other
				)));
			}
		}
	};

	// A transfer cut short leaves no trace: the placeholder is
	// deleted and the sender re-offers the file after reconnecting.
	if let Some(incoming) = current.take() {
		let placeholder = incoming.abort();
		debug!("discarding partial {}", placeholder.display());
		let _ = std::fs::remove_file(&placeholder);
		env.open_files.release();
	}
	result
}

/// Filename sanity independent of the configured filter.
fn filename_ok(name: &str) -> bool {
	!name.is_empty()
		&& name != "."
		&& name != ".."
		&& !name.contains('/')
		&& !name.contains('\0')
}

/// A file being received into a hidden placeholder.
struct IncomingFile {
	file: File,
	placeholder: PathBuf,
	final_path: PathBuf,
	declared: u64,
	written: u64,
}

impl IncomingFile {
	/// Open the hidden placeholder (`.<name>`) for writing.
	fn create(dir: &Path, info: &FileInfo) -> Result<IncomingFile> {
		let placeholder = dir.join(format!(".{}", info.name));
		let file = OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.open(&placeholder)?;
		if info.mode != 0 {
			let perms = std::fs::Permissions::from_mode(info.mode & 0o7777);
			let _ = file.set_permissions(perms);
		}
		Ok(IncomingFile {
			file,
			placeholder,
			final_path: dir.join(&info.name),
			declared: info.size,
			written: 0,
		})
	}

	fn name(&self) -> &str {
		self.final_path
			.file_name()
			.and_then(|n| n.to_str())
			.unwrap_or("?")
	}

	/// Append one block. Blocks must arrive in order and stay within
	/// the declared size.
	fn write_block(&mut self, offset: u64, data: &[u8]) -> Result<()> {
		if offset != self.written {
			return Err(Error::Protocol(format!(
				"block offset {} does not match received byte count {}",
				offset, self.written
			)));
		}
		let end = offset
			.checked_add(data.len() as u64)
			.ok_or_else(|| Error::Protocol(String::from("block offset overflow")))?;
		if end > self.declared {
			return Err(Error::Protocol(format!(
				"block [{}, {}) exceeds declared size {}",
				offset, end, self.declared
			)));
		}
		self.file.write_all_at(data, offset)?;
		self.written = end;
		Ok(())
	}

	/// Flush and atomically rename the placeholder onto the final
	/// path, defusing collisions with a random suffix.
	fn complete(self) -> Result<PathBuf> {
		if self.written != self.declared {
			let _ = std::fs::remove_file(&self.placeholder);
			return Err(Error::Protocol(format!(
				"file complete after {} of {} bytes",
				self.written, self.declared
			)));
		}
		self.file.sync_all()?;
		place_file(&self.placeholder, &self.final_path)
	}

	/// Give up on the transfer; the caller decides what happens to the
	/// returned placeholder path.
	fn abort(self) -> PathBuf {
		self.placeholder
	}
}
