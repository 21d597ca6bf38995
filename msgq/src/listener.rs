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

//! The listener thread: accepts new TCP connections on every bound
//! socket and spawns a connection for each, completing the TLS
//! handshake when the root was bound with `bind_tls`.

use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::conn::{Connection, Transport};
use crate::error::{Error, Result};
use crate::netio::IO_POLL_TIMEOUT_MS;
use crate::queue::{self, Root};
use crate::tls;

/// Accept loop. Exits when the root shuts down or the listening
/// sockets are dropped.
pub(crate) fn listener_loop(root: &Arc<Root>) {
	loop {
		if root.is_shutting_down() {
			break;
		}

		let fds: Vec<RawFd> = {
			let state = root.lock.lock();
			state.listeners.iter().map(|l| l.as_raw_fd()).collect()
		};
		if fds.is_empty() {
			break;
		}

		let mut pfds: Vec<libc::pollfd> = fds
			.iter()
			.map(|fd| libc::pollfd {
				fd: *fd,
				events: libc::POLLIN,
				revents: 0,
			})
			.collect();
		let rv = unsafe {
			libc::poll(
				pfds.as_mut_ptr(),
				pfds.len() as libc::nfds_t,
				IO_POLL_TIMEOUT_MS,
			)
		};
		if rv < 0 {
			let err = std::io::Error::last_os_error();
			if err.kind() == std::io::ErrorKind::Interrupted {
				continue;
			}
			error!("listener poll failed: {}", err);
			break;
		}
		if rv == 0 {
			continue;
		}

		// Collect accepted sockets under the lock, handshake outside.
		let mut accepted: Vec<(TcpStream, SocketAddr)> = vec![];
		{
			let state = root.lock.lock();
			for pfd in &pfds {
				if pfd.revents & libc::POLLIN == 0 {
					continue;
				}
				let sock = state
					.listeners
					.iter()
					.find(|l| l.as_raw_fd() == pfd.fd);
				let sock = match sock {
					Some(sock) => sock,
					// closed by shutdown between poll and lock
					None => continue,
				};
				loop {
					match sock.accept() {
						Ok((stream, addr)) => accepted.push((stream, addr)),
						Err(ref e)
							if e.kind() == std::io::ErrorKind::WouldBlock
								|| e.kind() == std::io::ErrorKind::Interrupted =>
						{
							break;
						}
						Err(e) => {
							// EBADF and friends are benign races with
							// shutdown.
							debug!("accept failed: {}", e);
							break;
						}
					}
				}
			}
		}

		for (stream, addr) in accepted {
			if let Err(e) = handle_accept(root, stream, addr) {
				warn!("unable to set up connection from {}: {}", addr, e);
			}
		}
	}
	trace!("listener exiting");
}

fn handle_accept(root: &Arc<Root>, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
	stream.set_nonblocking(true)?;
	let _ = stream.set_nodelay(true);

	let use_tls = root.lock.lock().bind_tls;
	let (transport, session) = if use_tls {
		let creds = root
			.tls
			.read()
			.clone()
			.ok_or_else(|| Error::Tls(String::from("no TLS credentials configured")))?;
		let session =
			tls::server_handshake(&creds, &mut stream, &addr.to_string(), &|| {
				root.is_shutting_down()
			})?;
		(Transport::Tls, Some(session))
	} else {
		(Transport::Tcp, None)
	};

	let conn = Connection::new(stream, transport, session, Some(addr));
	conn.mark_connected();

	// Park a created channel on the connection; the peer's announce
	// adopts it.
	let core = root.primary.read().clone().ok_or(Error::Shutdown)?;
	let first = queue::alloc_channel(root, &core)?;
	*conn.first_channel.lock() = Some(first);

	Connection::start(root, &conn)?;
	debug!("accepted connection from {}", addr);
	Ok(())
}
