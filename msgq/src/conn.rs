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

//! Connections: one byte-stream transport (plain TCP or TLS) with a
//! reader thread, a writer thread, an outbound deque and the partial
//! I/O state needed to resume short reads and writes across poll
//! wakeups.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use courier_util::Mutex;

use crate::deque::Deque;
use crate::error::{Error, Result};
use crate::intmap::IntMap;
use crate::message::{
	self, Msg, MsgHdr, CHANNEL_CONTROL, MSG_HDR_LEN, TYPE_KEEPALIVE, TYPE_WRITER_UNBLOCKER,
};
use crate::netio::{poll_readable, poll_writable, IO_POLL_TIMEOUT_MS};
use crate::queue::{self, Root};
use crate::tls::{TlsFlush, TlsRead, TlsSession};

/// Stagnancy timeout applied when keepalive is disabled.
pub const DEFAULT_STAGNANT_TIMEOUT: Duration = Duration::from_secs(120);

// Connection states.
const CONN_CREATED: u8 = 0;
const CONN_CONNECTED: u8 = 1;
const CONN_CLOSED: u8 = 2;

// Reader/writer thread states.
const TS_BEFORE: u8 = 0;
const TS_RUNNING: u8 = 1;
const TS_SHUTTING_DOWN: u8 = 2;
const TS_ENDED: u8 = 3;

/// Transport flavor of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transport {
	Tcp,
	Tls,
}

/// A connected socket with its reader/writer thread pair.
pub(crate) struct Connection {
	sock: TcpStream,
	peer: Option<SocketAddr>,
	transport: Transport,
	tls: Option<TlsSession>,
	/// Local ids of the channels bound to this connection.
	pub(crate) channels: IntMap<()>,
	/// Number of non-closed channels bound here. Adjusted only under
	/// the root lock; the connection dies when it reaches zero.
	pub(crate) refcount: AtomicU32,
	state: AtomicU8,
	/// Outbound message deque; producers push front, the writer pops
	/// back.
	pub(crate) outq: Deque<Msg>,
	keepalive: AtomicU64,
	last_recv: Mutex<Instant>,
	reader_state: AtomicU8,
	writer_state: AtomicU8,
	reader_handle: Mutex<Option<thread::JoinHandle<()>>>,
	writer_handle: Mutex<Option<thread::JoinHandle<()>>>,
	/// Channel pre-created by the listener, adopted by the first
	/// announce from the peer.
	pub(crate) first_channel: Mutex<Option<Arc<crate::channel::Channel>>>,
	destroying: AtomicBool,
}

impl Connection {
	pub(crate) fn new(
		sock: TcpStream,
		transport: Transport,
		tls: Option<TlsSession>,
		peer: Option<SocketAddr>,
	) -> Arc<Connection> {
		Arc::new(Connection {
			sock,
			peer,
			transport,
			tls,
			channels: IntMap::new(),
			refcount: AtomicU32::new(0),
			state: AtomicU8::new(CONN_CREATED),
			outq: Deque::new(),
			keepalive: AtomicU64::new(0),
			last_recv: Mutex::new(Instant::now()),
			reader_state: AtomicU8::new(TS_BEFORE),
			writer_state: AtomicU8::new(TS_BEFORE),
			reader_handle: Mutex::new(None),
			writer_handle: Mutex::new(None),
			first_channel: Mutex::new(None),
			destroying: AtomicBool::new(false),
		})
	}

	pub(crate) fn mark_connected(&self) {
		self.state.store(CONN_CONNECTED, Ordering::SeqCst);
	}

	pub(crate) fn is_closed(&self) -> bool {
		self.state.load(Ordering::SeqCst) == CONN_CLOSED
	}

	pub(crate) fn keepalive_secs(&self) -> u64 {
		self.keepalive.load(Ordering::SeqCst)
	}

	/// Change the keepalive and nudge the writer so it picks up the new
	/// pop timeout.
	pub(crate) fn set_keepalive(&self, seconds: u16) {
		self.keepalive.store(u64::from(seconds), Ordering::SeqCst);
		let _ = self
			.outq
			.push_front(Msg::empty(CHANNEL_CONTROL, TYPE_WRITER_UNBLOCKER));
	}

	fn touch_recv(&self) {
		*self.last_recv.lock() = Instant::now();
	}

	fn stagnant_timeout(&self) -> Duration {
		let ka = self.keepalive_secs();
		if ka > 0 {
			Duration::from_secs(ka * 2)
		} else {
			DEFAULT_STAGNANT_TIMEOUT
		}
	}

	fn is_stagnant(&self) -> bool {
		self.last_recv.lock().elapsed() > self.stagnant_timeout()
	}

	pub(crate) fn peer_desc(&self) -> String {
		match self.peer {
			Some(addr) => addr.to_string(),
			None => String::from("?"),
		}
	}

	pub(crate) fn local_port(&self) -> Result<u16> {
		Ok(self.sock.local_addr()?.port())
	}

	/// Human-readable transport description for this connection.
	pub(crate) fn info_string(&self) -> String {
		match &self.tls {
			None => String::from("TCP"),
			Some(tls) => {
				let (proto, cipher) = tls.info();
				format!("TCP, {}, {}", proto, cipher)
			}
		}
	}

	fn reader_running(&self) -> bool {
		self.reader_state.load(Ordering::SeqCst) == TS_RUNNING
	}

	fn writer_running(&self) -> bool {
		self.writer_state.load(Ordering::SeqCst) == TS_RUNNING
	}

	/// Spawn the reader and writer threads. The connection is usable
	/// once this returns.
	pub(crate) fn start(root: &Arc<Root>, conn: &Arc<Connection>) -> Result<()> {
		root.register_connection(conn);
		conn.reader_state.store(TS_RUNNING, Ordering::SeqCst);
		conn.writer_state.store(TS_RUNNING, Ordering::SeqCst);

		let r_root = root.clone();
		let r_conn = conn.clone();
		root.thread_started();
		let reader = thread::Builder::new()
			.name("msgq_read".to_string())
			.spawn(move || {
				reader_loop(&r_root, &r_conn);
				r_conn.reader_state.store(TS_ENDED, Ordering::SeqCst);
				r_root.thread_ended();
			})
			.map_err(|e| {
				root.thread_ended();
				Error::Io(e)
			})?;
		*conn.reader_handle.lock() = Some(reader);

		let w_root = root.clone();
		let w_conn = conn.clone();
		root.thread_started();
		let writer = thread::Builder::new()
			.name("msgq_write".to_string())
			.spawn(move || {
				writer_loop(&w_root, &w_conn);
				w_conn.writer_state.store(TS_ENDED, Ordering::SeqCst);
				w_root.thread_ended();
			})
			.map_err(|e| {
				root.thread_ended();
				Error::Io(e)
			})?;
		*conn.writer_handle.lock() = Some(writer);
		Ok(())
	}

	/// Tear the connection down: stop and join both threads (self-join
	/// is replaced by a detach), close every bound channel without
	/// cascading back here, drain the outbound deque and close the
	/// socket. Idempotent; only the first caller does the work.
	pub(crate) fn destroy(root: &Arc<Root>, conn: &Arc<Connection>) {
		if conn.destroying.swap(true, Ordering::SeqCst) {
			return;
		}
		debug!("destroying connection with {}", conn.peer_desc());
		conn.state.store(CONN_CLOSED, Ordering::SeqCst);
		let _ = conn.reader_state.compare_exchange(
			TS_RUNNING,
			TS_SHUTTING_DOWN,
			Ordering::SeqCst,
			Ordering::SeqCst,
		);
		let _ = conn.writer_state.compare_exchange(
			TS_RUNNING,
			TS_SHUTTING_DOWN,
			Ordering::SeqCst,
			Ordering::SeqCst,
		);

		// Wake the writer, then invalidate its queue.
		let _ = conn
			.outq
			.push_front(Msg::empty(CHANNEL_CONTROL, TYPE_WRITER_UNBLOCKER));
		conn.outq.unblock();
		let _ = conn.outq.drain();

		// Close bound channels without triggering a cascaded destroy.
		{
			let parked = conn.first_channel.lock().take();
			if let Some(chan) = parked {
				queue::discard_channel(root, &chan);
			}
		}
		for id in conn.channels.keys() {
			if let Some(chan) = root.channels.get(id) {
				queue::close_channel(root, &chan, false);
			}
		}

		let myself = thread::current().id();
		let reader = conn.reader_handle.lock().take();
		if let Some(handle) = reader {
			if handle.thread().id() != myself {
				let _ = handle.join();
			}
		}
		let writer = conn.writer_handle.lock().take();
		if let Some(handle) = writer {
			if handle.thread().id() != myself {
				let _ = handle.join();
			}
		}

		if let Some(tls) = &conn.tls {
			if let Ok(mut sock) = conn.sock.try_clone() {
				tls.close_notify(&mut sock);
			}
		}
		let _ = conn.sock.shutdown(Shutdown::Both);
	}
}

/// Framing state for inbound messages. Partial header and payload fills
/// persist across poll wakeups so short reads resume at the right byte.
struct ReadBuf {
	hdr: [u8; MSG_HDR_LEN],
	hdr_fill: usize,
	decoded: Option<MsgHdr>,
	payload: Vec<u8>,
	payload_fill: usize,
}

impl ReadBuf {
	fn new() -> ReadBuf {
		ReadBuf {
			hdr: [0; MSG_HDR_LEN],
			hdr_fill: 0,
			decoded: None,
			payload: vec![],
			payload_fill: 0,
		}
	}

	/// Whether an EOF right now would land inside a message.
	fn mid_message(&self) -> bool {
		self.hdr_fill > 0 || self.decoded.is_some()
	}

	/// Consume `data`, appending every completed message to `out`.
	fn feed(&mut self, mut data: &[u8], out: &mut Vec<Msg>) {
		while !data.is_empty() {
			match self.decoded {
				None => {
					let want = MSG_HDR_LEN - self.hdr_fill;
					let take = want.min(data.len());
					self.hdr[self.hdr_fill..self.hdr_fill + take]
						.copy_from_slice(&data[..take]);
					self.hdr_fill += take;
					data = &data[take..];
					if self.hdr_fill == MSG_HDR_LEN {
						let hdr = MsgHdr::decode(&self.hdr);
						self.payload = Vec::with_capacity(usize::from(hdr.size));
						self.payload_fill = 0;
						self.decoded = Some(hdr);
					}
				}
				Some(hdr) => {
					let want = usize::from(hdr.size) - self.payload_fill;
					let take = want.min(data.len());
					self.payload.extend_from_slice(&data[..take]);
					self.payload_fill += take;
					data = &data[take..];
					if self.payload_fill == usize::from(hdr.size) {
						let payload = std::mem::replace(&mut self.payload, vec![]);
						out.push(message::from_wire(hdr, payload));
						self.decoded = None;
						self.hdr_fill = 0;
					}
				}
			}
		}
	}
}

fn reader_loop(root: &Arc<Root>, conn: &Arc<Connection>) {
	let mut sock = match conn.sock.try_clone() {
		Ok(sock) => sock,
		Err(e) => {
			error!("unable to clone socket for reader: {}", e);
			Connection::destroy(root, conn);
			return;
		}
	};
	let fd = sock.as_raw_fd();
	let mut rb = ReadBuf::new();
	let mut scratch = [0u8; 8192];
	let mut msgs: Vec<Msg> = vec![];

	let outcome: Result<()> = loop {
		if !conn.reader_running() || conn.is_closed() || root.is_shutting_down() {
			break Ok(());
		}

		let ready = match poll_readable(fd, IO_POLL_TIMEOUT_MS) {
			Ok(ready) => ready,
			Err(e) => break Err(Error::from_socket(e)),
		};
		if !ready {
			if conn.is_stagnant() {
				info!("connection with {} is stagnant, closing", conn.peer_desc());
				break Err(Error::Closed);
			}
			continue;
		}

		match conn.transport {
			Transport::Tcp => match sock.read(&mut scratch) {
				Ok(0) => {
					break Err(if rb.mid_message() {
						Error::Short
					} else {
						Error::Closed
					});
				}
				Ok(n) => {
					conn.touch_recv();
					rb.feed(&scratch[..n], &mut msgs);
				}
				Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
				Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
				Err(e) => break Err(Error::from_socket(e)),
			},
			Transport::Tls => {
				let tls = match &conn.tls {
					Some(tls) => tls,
					None => break Err(Error::Tls(String::from("missing session"))),
				};
				let mut plain = vec![];
				match tls.read_into(&mut sock, &mut plain) {
					Ok(TlsRead::Eof) => {
						break Err(if rb.mid_message() {
							Error::Short
						} else {
							Error::Closed
						});
					}
					Ok(TlsRead::Progress) => conn.touch_recv(),
					Ok(TlsRead::WouldBlock) => continue,
					Err(e) => break Err(e),
				}
				rb.feed(&plain, &mut msgs);
			}
		}

		let mut failed = None;
		for msg in msgs.drain(..) {
			if let Err(e) = queue::dispatch_inbound(root, conn, msg) {
				failed = Some(e);
				break;
			}
		}
		if let Some(e) = failed {
			break Err(e);
		}
	};

	if let Err(e) = outcome {
		debug!(
			"reader for {} shutting down connection: {}",
			conn.peer_desc(),
			e
		);
		Connection::destroy(root, conn);
	} else {
		trace!("reader for {} exiting", conn.peer_desc());
	}
}

fn writer_loop(root: &Arc<Root>, conn: &Arc<Connection>) {
	let mut sock = match conn.sock.try_clone() {
		Ok(sock) => sock,
		Err(e) => {
			error!("unable to clone socket for writer: {}", e);
			Connection::destroy(root, conn);
			return;
		}
	};

	let outcome: Result<()> = loop {
		if !conn.writer_running() || conn.is_closed() || root.is_shutting_down() {
			break Ok(());
		}

		// Wake at least once per second to observe shutdown even with
		// keepalive disabled.
		let keepalive = conn.keepalive_secs();
		let timeout = if keepalive > 0 {
			Duration::from_secs(keepalive)
		} else {
			Duration::from_secs(1)
		};

		let msg = match conn.outq.pop_back_timed(timeout) {
			Ok(msg) => {
				if msg.typ() == TYPE_WRITER_UNBLOCKER {
					// Sentinel: re-check state and keepalive, write
					// nothing.
					continue;
				}
				msg
			}
			Err(Error::TimedOut) => {
				if keepalive == 0 {
					continue;
				}
				trace!("keepalive to {}", conn.peer_desc());
				Msg::empty(CHANNEL_CONTROL, TYPE_KEEPALIVE)
			}
			Err(Error::Unblocked) | Err(Error::Destroyed) => break Ok(()),
			Err(e) => break Err(e),
		};

		if let Err(e) = write_msg(conn, &mut sock, &msg) {
			break Err(e);
		}
	};

	if let Err(e) = outcome {
		debug!(
			"writer for {} shutting down connection: {}",
			conn.peer_desc(),
			e
		);
		Connection::destroy(root, conn);
	} else {
		trace!("writer for {} exiting", conn.peer_desc());
	}
}

/// Write one message, header first, resuming partial writes across poll
/// wakeups. Once started, a message is finished (or the connection
/// dies) before the next one is considered.
fn write_msg(conn: &Arc<Connection>, sock: &mut TcpStream, msg: &Msg) -> Result<()> {
	let fd = sock.as_raw_fd();
	let hdr = msg.encode_header();

	match conn.transport {
		Transport::Tcp => {
			let nsegs = 1 + msg.segments().len();
			let mut seg = 0usize;
			let mut off = 0usize;
			while seg < nsegs {
				let cur: &[u8] = if seg == 0 {
					&hdr
				} else {
					&msg.segments()[seg - 1]
				};
				if off >= cur.len() {
					seg += 1;
					off = 0;
					continue;
				}
				match sock.write(&cur[off..]) {
					Ok(n) => off += n,
					Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
						if conn.is_closed() || !conn.writer_running() {
							return Err(Error::Closed);
						}
						poll_writable(fd, IO_POLL_TIMEOUT_MS)
							.map_err(Error::from_socket)?;
					}
					Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
					Err(e) => return Err(Error::from_socket(e)),
				}
			}
		}
		Transport::Tls => {
			let tls = match &conn.tls {
				Some(tls) => tls,
				None => return Err(Error::Tls(String::from("missing session"))),
			};
			tls.queue_plaintext(&hdr)?;
			for segment in msg.segments() {
				tls.queue_plaintext(segment)?;
			}
			loop {
				match tls.flush(sock)? {
					TlsFlush::Done => break,
					TlsFlush::NeedsPoll => {
						if conn.is_closed() || !conn.writer_running() {
							return Err(Error::Closed);
						}
						poll_writable(fd, IO_POLL_TIMEOUT_MS)
							.map_err(Error::from_socket)?;
					}
				}
			}
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn readbuf_reassembles_across_fragments() {
		let msg = Msg::new(0x0001, 0x0002, vec![9u8; 10]).unwrap();
		let mut wire = msg.encode_header().to_vec();
		wire.extend_from_slice(msg.payload());

		let mut rb = ReadBuf::new();
		let mut out = vec![];
		// byte-at-a-time delivery
		for byte in &wire {
			rb.feed(std::slice::from_ref(byte), &mut out);
		}
		assert_eq!(out.len(), 1);
		assert_eq!(out[0].channel(), 1);
		assert_eq!(out[0].typ(), 2);
		assert_eq!(out[0].payload(), &[9u8; 10][..]);
		assert!(!rb.mid_message());
	}

	#[test]
	fn readbuf_handles_batched_messages() {
		let mut wire = vec![];
		for i in 0..3u16 {
			let msg = Msg::new(i, 100 + i, vec![i as u8; i as usize]).unwrap();
			wire.extend_from_slice(&msg.encode_header());
			wire.extend_from_slice(msg.payload());
		}
		let mut rb = ReadBuf::new();
		let mut out = vec![];
		rb.feed(&wire, &mut out);
		assert_eq!(out.len(), 3);
		assert_eq!(out[2].payload(), &[2u8, 2]);
	}

	#[test]
	fn readbuf_tracks_mid_message() {
		let msg = Msg::new(1, 1, vec![1, 2, 3, 4]).unwrap();
		let mut wire = msg.encode_header().to_vec();
		wire.extend_from_slice(msg.payload());
		let mut rb = ReadBuf::new();
		let mut out = vec![];
		rb.feed(&wire[..7], &mut out);
		assert!(out.is_empty());
		assert!(rb.mid_message());
		rb.feed(&wire[7..], &mut out);
		assert_eq!(out.len(), 1);
		assert!(!rb.mid_message());
	}
}
