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

//! The user-facing message queue: channel creation, connect and listen,
//! send and receive, channel splitting and shutdown. Several queue
//! handles can share one root; all channel bookkeeping is keyed by id
//! at the root so ids are unique across split queues.

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use courier_util::{Condvar, Mutex, RwLock};

use crate::channel::{ChanState, Channel};
use crate::conn::{Connection, Transport};
use crate::error::{Error, Result};
use crate::intmap::IntMap;
use crate::listener;
use crate::message::{
	channel_payload, decode_channel_payload, Msg, CHANNEL_CONTROL, CTL_CHANNEL_DIED,
	CTL_NEW_CONNECTION, MIN_SYSTEM_TYPE, TYPE_CHANNEL_ANNOUNCE, TYPE_CHANNEL_KILL,
	TYPE_CHANNEL_REPLY, TYPE_KEEPALIVE,
};
use crate::multiqueue::{MqFunction, Multiqueue};
use crate::tls::{self, TlsCreds};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Live-thread accounting for `shutdown_all`.
pub(crate) struct ThreadInfo {
	count: Mutex<u32>,
	cond: Condvar,
}

/// State guarded by the root mutex.
pub(crate) struct RootLocked {
	next_channel: u16,
	pub(crate) listeners: Vec<std::net::TcpListener>,
	pub(crate) listener_handle: Option<thread::JoinHandle<()>>,
	pub(crate) bind_tls: bool,
}

/// Shared state behind every queue handle derived from one create call.
pub(crate) struct Root {
	pub(crate) lock: Mutex<RootLocked>,
	/// Channel id to channel, for every live channel.
	pub(crate) channels: IntMap<Arc<Channel>>,
	/// Channel id to the queue core that owns its inbound subqueue.
	pub(crate) groups: IntMap<Arc<QueueCore>>,
	/// The core of the original queue handle; reader threads allocate
	/// peer-announced channels here.
	pub(crate) primary: RwLock<Option<Arc<QueueCore>>>,
	/// Every live connection, so shutdown can reach connections that
	/// never bound a channel (accepted but not yet announced).
	pub(crate) connections: Mutex<Vec<std::sync::Weak<Connection>>>,
	threads: ThreadInfo,
	pub(crate) shuttingdown: AtomicBool,
	pub(crate) tls: RwLock<Option<Arc<TlsCreds>>>,
}

impl Root {
	fn new() -> Root {
		Root {
			lock: Mutex::new(RootLocked {
				next_channel: 0,
				listeners: vec![],
				listener_handle: None,
				bind_tls: false,
			}),
			channels: IntMap::new(),
			groups: IntMap::new(),
			primary: RwLock::new(None),
			connections: Mutex::new(vec![]),
			threads: ThreadInfo {
				count: Mutex::new(0),
				cond: Condvar::new(),
			},
			shuttingdown: AtomicBool::new(false),
			tls: RwLock::new(None),
		}
	}

	pub(crate) fn thread_started(&self) {
		*self.threads.count.lock() += 1;
	}

	pub(crate) fn thread_ended(&self) {
		let mut count = self.threads.count.lock();
		*count = count.saturating_sub(1);
		self.threads.cond.notify_all();
	}

	fn wait_threads(&self) {
		let mut count = self.threads.count.lock();
		while *count > 0 {
			self.threads.cond.wait(&mut count);
		}
	}

	pub(crate) fn is_shutting_down(&self) -> bool {
		self.shuttingdown.load(Ordering::SeqCst)
	}

	/// Track a connection and drop entries whose connection is gone.
	pub(crate) fn register_connection(&self, conn: &Arc<Connection>) {
		let mut conns = self.connections.lock();
		conns.retain(|weak| weak.upgrade().is_some());
		conns.push(Arc::downgrade(conn));
	}

	fn live_connections(&self) -> Vec<Arc<Connection>> {
		self.connections
			.lock()
			.iter()
			.filter_map(|weak| weak.upgrade())
			.collect()
	}
}

/// Per-handle state: the fan-in multiqueue and the channels whose
/// subqueues feed it.
pub(crate) struct QueueCore {
	pub(crate) group: Multiqueue<Msg>,
	pub(crate) channels: IntMap<Arc<Channel>>,
	pub(crate) shutdown: AtomicBool,
}

impl QueueCore {
	fn new() -> QueueCore {
		QueueCore {
			group: Multiqueue::fair(),
			channels: IntMap::new(),
			shutdown: AtomicBool::new(false),
		}
	}
}

/// A message queue handle. Cheap to clone; clones share the same view.
pub struct MsgQueue {
	root: Arc<Root>,
	core: Arc<QueueCore>,
}

impl Clone for MsgQueue {
	fn clone(&self) -> MsgQueue {
		MsgQueue {
			root: self.root.clone(),
			core: self.core.clone(),
		}
	}
}

/// Allocate a channel id (monotonic, wrapping, skipping the control id
/// and live ids) and register the channel at the root and on `core`.
pub(crate) fn alloc_channel(root: &Arc<Root>, core: &Arc<QueueCore>) -> Result<Arc<Channel>> {
	let subqueue = core.group.create_queue()?;
	let id = {
		let mut state = root.lock.lock();
		let mut id = state.next_channel;
		let mut scanned = 0u32;
		while id == CHANNEL_CONTROL || root.channels.contains(u32::from(id)) {
			id = id.wrapping_add(1);
			scanned += 1;
			if scanned > u32::from(u16::max_value()) {
				return Err(Error::NoFreeChannel);
			}
		}
		state.next_channel = id.wrapping_add(1);
		id
	};
	let chan = Arc::new(Channel::new(id, subqueue));
	root.channels.set(u32::from(id), chan.clone());
	root.groups.set(u32::from(id), core.clone());
	core.channels.set(u32::from(id), chan.clone());
	Ok(chan)
}

/// Bind a channel to a connection and count the reference. Refcounts
/// move only under the root lock.
pub(crate) fn bind_channel(root: &Arc<Root>, chan: &Arc<Channel>, conn: &Arc<Connection>) {
	chan.set_connecting(conn);
	let _guard = root.lock.lock();
	conn.refcount.fetch_add(1, Ordering::SeqCst);
}

/// Deliver an internal notification on the control channel.
pub(crate) fn deliver_control(root: &Arc<Root>, typ: u16, payload: Vec<u8>) {
	if let Some(control) = root.channels.get(u32::from(CHANNEL_CONTROL)) {
		match Msg::new(CHANNEL_CONTROL, typ, payload) {
			Ok(msg) => {
				let _ = control.queue.add(msg);
			}
			Err(e) => debug!("dropping oversized control notification: {}", e),
		}
	}
}

/// Close a channel: mark it dead, notify the control channel if it was
/// connected, unbind it from its connection and, when this was the last
/// bound channel and `cascade` is set, destroy the connection.
pub(crate) fn close_channel(root: &Arc<Root>, chan: &Arc<Channel>, cascade: bool) {
	let prev = match chan.mark_closed() {
		Some(prev) => prev,
		None => return,
	};
	debug!("channel {:#06x} closed (was {:?})", chan.id, prev);
	if prev == ChanState::Connected && chan.id != CHANNEL_CONTROL {
		deliver_control(root, CTL_CHANNEL_DIED, channel_payload(chan.id));
	}
	if let Some(conn) = chan.take_connection() {
		conn.channels.remove(u32::from(chan.id));
		let now_zero = {
			let _guard = root.lock.lock();
			conn.refcount.fetch_sub(1, Ordering::SeqCst) == 1
		};
		if now_zero && cascade {
			Connection::destroy(root, &conn);
		}
	}
}

/// Fully retire a channel: close it, drop it from all maps and refuse
/// further adds on its subqueue. Queued inbound messages stay readable
/// through the owning queue.
pub(crate) fn kill_channel(root: &Arc<Root>, chan: &Arc<Channel>) {
	if chan.state() == ChanState::Connected && chan.id != CHANNEL_CONTROL {
		if let Some(conn) = chan.connection() {
			let kill = Msg::new(
				CHANNEL_CONTROL,
				TYPE_CHANNEL_KILL,
				channel_payload(chan.remote()),
			);
			if let Ok(kill) = kill {
				let _ = conn.outq.push_front(kill);
			}
		}
	}
	close_channel(root, chan, true);
	chan.queue.disable(MqFunction::Add);
	root.channels.remove(u32::from(chan.id));
	if let Some(core) = root.groups.remove(u32::from(chan.id)) {
		core.channels.remove(u32::from(chan.id));
	}
}

/// Retire a channel that never connected (a parked listener-side first
/// channel whose connection died before the announce arrived).
pub(crate) fn discard_channel(root: &Arc<Root>, chan: &Arc<Channel>) {
	let _ = chan.mark_closed();
	root.channels.remove(u32::from(chan.id));
	if let Some(core) = root.groups.remove(u32::from(chan.id)) {
		core.channels.remove(u32::from(chan.id));
	}
	chan.queue.destroy();
}

/// Route one inbound message: system control traffic is consumed here,
/// everything else lands on the target channel's subqueue. Unroutable
/// messages are dropped.
pub(crate) fn dispatch_inbound(
	root: &Arc<Root>,
	conn: &Arc<Connection>,
	msg: Msg,
) -> Result<()> {
	if msg.typ() >= MIN_SYSTEM_TYPE {
		if msg.channel() == CHANNEL_CONTROL {
			return handle_system_control(root, conn, msg);
		}
		trace!(
			"dropping reserved-type message {:#06x} on channel {:#06x}",
			msg.typ(),
			msg.channel()
		);
		return Ok(());
	}
	match root.channels.get(u32::from(msg.channel())) {
		Some(chan) if chan.state() != ChanState::Closed => {
			let _ = chan.queue.add(msg);
		}
		_ => {
			trace!("dropping message for unknown channel {:#06x}", msg.channel());
		}
	}
	Ok(())
}

fn handle_system_control(root: &Arc<Root>, conn: &Arc<Connection>, msg: Msg) -> Result<()> {
	match msg.typ() {
		TYPE_CHANNEL_ANNOUNCE => {
			let rchannel = decode_channel_payload(msg.payload())?;
			// Adopt the pre-created first channel when there is one.
			let parked = conn.first_channel.lock().take();
			let chan = match parked {
				Some(chan) => chan,
				None => {
					let core = root
						.primary
						.read()
						.clone()
						.ok_or(Error::Shutdown)?;
					alloc_channel(root, &core)?
				}
			};
			debug!(
				"channel announce from {}: remote {:#06x} -> local {:#06x}",
				conn.peer_desc(),
				rchannel,
				chan.id
			);
			bind_channel(root, &chan, conn);
			chan.set_connected(rchannel);
			conn.mark_connected();

			// Reply with the (local, remote) pair.
			let mut pair = channel_payload(chan.id);
			pair.extend_from_slice(&channel_payload(rchannel));
			let reply = Msg::new(CHANNEL_CONTROL, TYPE_CHANNEL_REPLY, pair)?;
			conn.outq.push_front(reply)?;

			// Announce the adopted channel to user code.
			let mut info = channel_payload(chan.id);
			info.extend_from_slice(conn.peer_desc().as_bytes());
			deliver_control(root, CTL_NEW_CONNECTION, info);
			Ok(())
		}
		TYPE_CHANNEL_REPLY => {
			let payload = msg.payload();
			if payload.len() < 4 {
				return Err(Error::BadMessage("short channel reply"));
			}
			// Reversed directionality: the peer's local id is our
			// remote id.
			let remote = decode_channel_payload(&payload[0..2])?;
			let local = decode_channel_payload(&payload[2..4])?;
			match root.channels.get(u32::from(local)) {
				Some(chan) => {
					debug!(
						"channel {:#06x} connected to remote {:#06x}",
						local, remote
					);
					conn.mark_connected();
					chan.set_connected(remote);
					Ok(())
				}
				None => {
					debug!("channel reply for unknown channel {:#06x}", local);
					Ok(())
				}
			}
		}
		TYPE_CHANNEL_KILL => {
			let local = decode_channel_payload(msg.payload())?;
			debug!("remote killed channel {:#06x}", local);
			if let Some(chan) = root.channels.get(u32::from(local)) {
				close_channel(root, &chan, true);
			}
			Ok(())
		}
		TYPE_KEEPALIVE => Ok(()),
		other => {
			trace!("ignoring unknown system control type {:#06x}", other);
			Ok(())
		}
	}
}

impl MsgQueue {
	/// Create a new root message queue. The control channel exists and
	/// is connected from the start.
	pub fn create() -> Result<MsgQueue> {
		let root = Arc::new(Root::new());
		let core = Arc::new(QueueCore::new());
		*root.primary.write() = Some(core.clone());

		let subqueue = core.group.create_queue()?;
		let control = Arc::new(Channel::new_control(CHANNEL_CONTROL, subqueue));
		root.channels
			.set(u32::from(CHANNEL_CONTROL), control.clone());
		root.groups.set(u32::from(CHANNEL_CONTROL), core.clone());
		core.channels.set(u32::from(CHANNEL_CONTROL), control);

		Ok(MsgQueue { root, core })
	}

	/// Install TLS credentials on the root. Required before `bind_tls`
	/// or `connect_tls`.
	pub fn set_tls_creds(&self, creds: TlsCreds) {
		*self.root.tls.write() = Some(Arc::new(creds));
	}

	/// Bind the given addresses and start accepting plain TCP
	/// connections.
	pub fn bind_tcp(&self, addrs: &[SocketAddr]) -> Result<()> {
		self.bind(addrs, false)
	}

	/// Bind the given addresses and start accepting TLS connections
	/// with mutual certificate authentication.
	pub fn bind_tls(&self, addrs: &[SocketAddr]) -> Result<()> {
		if self.root.tls.read().is_none() {
			return Err(Error::Tls(String::from("no TLS credentials configured")));
		}
		self.bind(addrs, true)
	}

	fn bind(&self, addrs: &[SocketAddr], use_tls: bool) -> Result<()> {
		let mut state = self.root.lock.lock();
		for addr in addrs {
			let sock = std::net::TcpListener::bind(addr)?;
			sock.set_nonblocking(true)?;
			info!(
				"listening on {} ({})",
				addr,
				if use_tls { "TLS" } else { "TCP" }
			);
			state.listeners.push(sock);
		}
		state.bind_tls = use_tls;
		if state.listener_handle.is_none() {
			let root = self.root.clone();
			self.root.thread_started();
			let handle = thread::Builder::new()
				.name("msgq_listener".to_string())
				.spawn(move || {
					listener::listener_loop(&root);
					root.thread_ended();
				})
				.map_err(|e| {
					self.root.thread_ended();
					Error::Io(e)
				})?;
			state.listener_handle = Some(handle);
		}
		Ok(())
	}

	/// Connect to a listening queue over plain TCP. Returns the local
	/// channel id once the channel handshake completes.
	pub fn connect_tcp(&self, addr: &SocketAddr) -> Result<u16> {
		let sock = TcpStream::connect_timeout(addr, CONNECT_TIMEOUT)?;
		self.finish_connect(sock, *addr, Transport::Tcp, None)
	}

	/// Connect over TLS with mutual certificate authentication. The
	/// peer certificate is checked against `server_name` when given,
	/// else against the address.
	pub fn connect_tls(&self, addr: &SocketAddr, server_name: Option<&str>) -> Result<u16> {
		let creds = self
			.root
			.tls
			.read()
			.clone()
			.ok_or_else(|| Error::Tls(String::from("no TLS credentials configured")))?;
		let mut sock = TcpStream::connect_timeout(addr, CONNECT_TIMEOUT)?;
		sock.set_nonblocking(true)?;
		let name = match server_name {
			Some(name) => name.to_string(),
			None => addr.ip().to_string(),
		};
		let session = tls::client_handshake(&creds, &mut sock, &name, &|| {
			self.root.is_shutting_down()
		})?;
		self.finish_connect(sock, *addr, Transport::Tls, Some(session))
	}

	fn finish_connect(
		&self,
		sock: TcpStream,
		addr: SocketAddr,
		transport: Transport,
		session: Option<tls::TlsSession>,
	) -> Result<u16> {
		if self.root.is_shutting_down() {
			return Err(Error::Shutdown);
		}
		sock.set_nonblocking(true)?;
		let _ = sock.set_nodelay(true);
		let conn = Connection::new(sock, transport, session, Some(addr));
		let chan = alloc_channel(&self.root, &self.core)?;
		bind_channel(&self.root, &chan, &conn);
		Connection::start(&self.root, &conn)?;

		let announce = Msg::new(
			CHANNEL_CONTROL,
			TYPE_CHANNEL_ANNOUNCE,
			channel_payload(chan.id),
		)?;
		conn.outq.push_front(announce)?;

		let remote = chan.wait_connected()?;
		debug!(
			"connected channel {:#06x} (remote {:#06x}) to {}",
			chan.id, remote, addr
		);
		Ok(chan.id)
	}

	/// Open another logical channel on the connection that carries
	/// `existing`.
	pub fn channel_new(&self, existing: u16) -> Result<u16> {
		let base = self
			.root
			.channels
			.get(u32::from(existing))
			.ok_or(Error::UnknownChannel(existing))?;
		let conn = base.connection().ok_or(Error::Closed)?;
		let chan = alloc_channel(&self.root, &self.core)?;
		bind_channel(&self.root, &chan, &conn);
		let announce = Msg::new(
			CHANNEL_CONTROL,
			TYPE_CHANNEL_ANNOUNCE,
			channel_payload(chan.id),
		)?;
		conn.outq.push_front(announce)?;
		let remote = chan.wait_connected()?;
		debug!(
			"new channel {:#06x} (remote {:#06x}) on connection of {:#06x}",
			chan.id, remote, existing
		);
		Ok(chan.id)
	}

	fn send_internal(&self, channel: u16, typ: u16, payload: Vec<u8>) -> Result<()> {
		let chan = self
			.root
			.channels
			.get(u32::from(channel))
			.ok_or(Error::UnknownChannel(channel))?;
		let msg = Msg::new(channel, typ, payload)?;
		match chan.queue.add(msg) {
			Ok(()) | Err(Error::Disabled) => Ok(()),
			Err(e) => Err(e),
		}
	}

	fn send_remote(&self, channel: u16, mut msg: Msg) -> Result<()> {
		let chan = self
			.root
			.channels
			.get(u32::from(channel))
			.ok_or(Error::UnknownChannel(channel))?;
		if chan.state() == ChanState::Closed {
			// Racing against a dying channel is routine; the message
			// is silently dropped.
			return Ok(());
		}
		let conn = match chan.connection() {
			Some(conn) => conn,
			// The only connectionless channel is the control channel:
			// sending to ourselves is an injection.
			None => {
				msg.set_channel(channel);
				return match chan.queue.add(msg) {
					Ok(()) | Err(Error::Disabled) => Ok(()),
					Err(e) => Err(e),
				};
			}
		};
		msg.set_channel(chan.remote());
		match conn.outq.push_front(msg) {
			Ok(()) => Ok(()),
			// A destroyed outbound deque means the connection is going
			// away; equivalent to a closed channel.
			Err(Error::Destroyed) => Ok(()),
			Err(e) => Err(e),
		}
	}

	/// Send a message on a channel. The payload is copied. Sends on a
	/// closed channel are silently dropped; sends on an unknown channel
	/// fail.
	pub fn send_message(&self, channel: u16, typ: u16, payload: &[u8]) -> Result<()> {
		self.send_message_no_copy(channel, typ, payload.to_vec())
	}

	/// Send a message taking ownership of the payload buffer.
	pub fn send_message_no_copy(&self, channel: u16, typ: u16, payload: Vec<u8>) -> Result<()> {
		let msg = Msg::new(channel, typ, payload)?;
		self.send_remote(channel, msg)
	}

	/// Zero-copy scatter send. The segments are consumed exactly once,
	/// whether the send succeeds or the combined size is over the wire
	/// limit.
	pub fn scatter_send_no_copy(
		&self,
		channel: u16,
		typ: u16,
		segments: Vec<Vec<u8>>,
	) -> Result<()> {
		let msg = Msg::scattered(channel, typ, segments)?;
		self.send_remote(channel, msg)
	}

	/// Deliver a message to our own inbound queue as if it had arrived
	/// from the wire.
	pub fn inject_message(&self, channel: u16, typ: u16, payload: &[u8]) -> Result<()> {
		self.send_internal(channel, typ, payload.to_vec())
	}

	/// Blocking receive across every channel on this queue handle.
	pub fn get_message(&self) -> Result<Msg> {
		if self.core.shutdown.load(Ordering::SeqCst) {
			return Err(Error::Shutdown);
		}
		match self.core.group.get() {
			Ok(msg) => Ok(msg),
			Err(Error::Disabled) => Err(Error::Shutdown),
			Err(e) => Err(e),
		}
	}

	/// Put a received message back so the next receive on its channel
	/// returns it again. Used by readers that popped a message meant
	/// for a channel about to be split off.
	pub fn push_back_message(&self, msg: Msg) -> Result<()> {
		let chan = self
			.root
			.channels
			.get(u32::from(msg.channel()))
			.ok_or(Error::UnknownChannel(msg.channel()))?;
		chan.queue.push_back(msg)
	}

	/// Blocking receive restricted to one channel.
	pub fn get_message_from_channel(&self, channel: u16) -> Result<Msg> {
		let chan = self
			.root
			.channels
			.get(u32::from(channel))
			.ok_or(Error::UnknownChannel(channel))?;
		chan.queue.get()
	}

	/// Move a channel onto a fresh queue handle sharing this root. A
	/// blocking `get_message` on the returned queue wakes only for that
	/// channel's traffic.
	pub fn channel_split(&self, channel: u16) -> Result<MsgQueue> {
		let chan = self
			.root
			.channels
			.get(u32::from(channel))
			.ok_or(Error::UnknownChannel(channel))?;
		let core = Arc::new(QueueCore::new());
		chan.queue.move_to(&core.group)?;
		if let Some(old) = self.root.groups.get(u32::from(channel)) {
			old.channels.remove(u32::from(channel));
		}
		core.channels.set(u32::from(channel), chan);
		self.root.groups.set(u32::from(channel), core.clone());
		Ok(MsgQueue {
			root: self.root.clone(),
			core,
		})
	}

	/// Move a channel to another existing queue handle.
	pub fn channel_move(&self, channel: u16, target: &MsgQueue) -> Result<()> {
		let chan = self
			.root
			.channels
			.get(u32::from(channel))
			.ok_or(Error::UnknownChannel(channel))?;
		chan.queue.move_to(&target.core.group)?;
		if let Some(old) = self.root.groups.get(u32::from(channel)) {
			old.channels.remove(u32::from(channel));
		}
		target.core.channels.set(u32::from(channel), chan);
		self.root.groups.set(u32::from(channel), target.core.clone());
		Ok(())
	}

	/// Destroy a channel. A connected channel tells the peer first;
	/// the last channel on a connection takes the connection with it.
	pub fn channel_kill(&self, channel: u16) -> Result<()> {
		let chan = self
			.root
			.channels
			.get(u32::from(channel))
			.ok_or(Error::UnknownChannel(channel))?;
		kill_channel(&self.root, &chan);
		Ok(())
	}

	/// Block until everything queued on the connection carrying
	/// `channel` has been handed to the transport, or the channel dies.
	/// Fire-and-forget senders call this before treating queued traffic
	/// as delivered.
	pub fn flush_channel(&self, channel: u16) -> Result<()> {
		let chan = self
			.root
			.channels
			.get(u32::from(channel))
			.ok_or(Error::UnknownChannel(channel))?;
		loop {
			if chan.state() == ChanState::Closed {
				return Err(Error::Closed);
			}
			let conn = match chan.connection() {
				Some(conn) => conn,
				None => return Ok(()),
			};
			if conn.outq.is_empty() {
				// Drained; report failure if the channel died while
				// the tail was going out.
				if chan.state() == ChanState::Closed {
					return Err(Error::Closed);
				}
				return Ok(());
			}
			thread::sleep(Duration::from_millis(100));
		}
	}

	/// The remote id paired with a local channel.
	pub fn get_remote_channel(&self, channel: u16) -> Result<u16> {
		let chan = self
			.root
			.channels
			.get(u32::from(channel))
			.ok_or(Error::UnknownChannel(channel))?;
		Ok(chan.remote())
	}

	/// Adjust the keepalive of the connection carrying `channel` and
	/// wake its writer so the new interval takes effect immediately.
	pub fn set_keepalive(&self, channel: u16, seconds: u16) -> Result<()> {
		let chan = self
			.root
			.channels
			.get(u32::from(channel))
			.ok_or(Error::UnknownChannel(channel))?;
		if let Some(conn) = chan.connection() {
			conn.set_keepalive(seconds);
		}
		Ok(())
	}

	/// Human-readable description of the transport carrying `channel`:
	/// "TCP", or "TCP, <protocol>, <cipher>" for TLS.
	pub fn connection_info(&self, channel: u16) -> Result<String> {
		let chan = self
			.root
			.channels
			.get(u32::from(channel))
			.ok_or(Error::UnknownChannel(channel))?;
		match chan.connection() {
			Some(conn) => Ok(conn.info_string()),
			None => Ok(String::from("TCP")),
		}
	}

	/// Local TCP port of the connection carrying `channel`.
	pub fn local_port(&self, channel: u16) -> Result<u16> {
		let chan = self
			.root
			.channels
			.get(u32::from(channel))
			.ok_or(Error::UnknownChannel(channel))?;
		let conn = chan.connection().ok_or(Error::Closed)?;
		conn.local_port()
	}

	/// Shut down this queue handle: close its channels and wake every
	/// blocked `get_message` with an error.
	pub fn shutdown(&self) {
		self.core.shutdown.store(true, Ordering::SeqCst);
		for chan in self.core.channels.values() {
			kill_channel(&self.root, &chan);
		}
		self.core.group.shutdown();
	}

	/// Shut down everything derived from this root: every channel,
	/// every split queue, the listener, and wait for all transport
	/// threads to finish. Idempotent.
	pub fn shutdown_all(&self) {
		self.root.shuttingdown.store(true, Ordering::SeqCst);

		// Snapshot the cores before the group map shrinks under us.
		let mut cores: Vec<Arc<QueueCore>> = vec![self.core.clone()];
		for core in self.root.groups.values() {
			if !cores.iter().any(|c| Arc::ptr_eq(c, &core)) {
				cores.push(core);
			}
		}

		for chan in self.root.channels.values() {
			kill_channel(&self.root, &chan);
		}

		// Connections without bound channels (accepted, never
		// announced) are not reachable through the channel map.
		for conn in self.root.live_connections() {
			Connection::destroy(&self.root, &conn);
		}

		// Stop accepting: drop the listening sockets, join the thread.
		let handle = {
			let mut state = self.root.lock.lock();
			state.listeners.clear();
			state.listener_handle.take()
		};
		if let Some(handle) = handle {
			if handle.thread().id() != thread::current().id() {
				let _ = handle.join();
			}
		}

		for core in cores {
			core.shutdown.store(true, Ordering::SeqCst);
			core.group.shutdown();
		}

		self.root.wait_threads();
		debug!("message queue shut down");
	}
}
