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

//! Poll helpers shared by the connection and TLS code. Every blocking
//! wait in the transport goes through a bounded poll so threads can
//! observe shutdown flags at least once per second.

use std::io;
use std::os::unix::io::RawFd;

/// Timeout of a single poll cycle, in milliseconds.
pub(crate) const IO_POLL_TIMEOUT_MS: i32 = 1000;

fn poll_fd(fd: RawFd, events: libc::c_short, timeout_ms: i32) -> io::Result<bool> {
	let mut pfd = libc::pollfd {
		fd,
		events,
		revents: 0,
	};
	let rv = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
	if rv < 0 {
		let err = io::Error::last_os_error();
		if err.kind() == io::ErrorKind::Interrupted {
			return Ok(false);
		}
		return Err(err);
	}
	if rv == 0 {
		return Ok(false);
	}
	if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
		return Err(io::Error::new(
			io::ErrorKind::Other,
			"poll reported descriptor error",
		));
	}
	Ok(true)
}

/// Wait until `fd` is readable (or hung up, so the read can observe the
/// EOF). Returns `Ok(false)` on timeout or interrupt.
pub(crate) fn poll_readable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
	poll_fd(fd, libc::POLLIN | libc::POLLHUP, timeout_ms)
}

/// Wait until `fd` is writable. Returns `Ok(false)` on timeout or
/// interrupt.
pub(crate) fn poll_writable(fd: RawFd, timeout_ms: i32) -> io::Result<bool> {
	poll_fd(fd, libc::POLLOUT, timeout_ms)
}
