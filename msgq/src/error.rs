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

use std::io;

/// Message queue errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// OS level I/O error that is not one of the recognized retry or
	/// close conditions.
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),
	/// TLS library error.
	#[error("TLS error: {0}")]
	Tls(String),
	/// The peer hung up or the connection was shut down locally.
	#[error("connection closed")]
	Closed,
	/// EOF arrived in the middle of a framed message.
	#[error("short read inside a message")]
	Short,
	/// A read or write was interrupted mid-message and may resume.
	#[error("partial transfer, retry")]
	Partial,
	/// The descriptor polled readable but produced no data.
	#[error("no data available")]
	Empty,
	/// A timed operation ran out of time.
	#[error("timed out")]
	TimedOut,
	/// A blocking queue operation was woken by an unblock request.
	#[error("unblocked")]
	Unblocked,
	/// The queue backing an operation has been destroyed.
	#[error("destroyed")]
	Destroyed,
	/// The message queue is shutting down.
	#[error("message queue shut down")]
	Shutdown,
	/// The multiqueue function (add or remove) is currently disabled.
	#[error("queue function disabled")]
	Disabled,
	/// The named channel does not exist.
	#[error("unknown channel {0:#06x}")]
	UnknownChannel(u16),
	/// Every channel id is in use.
	#[error("no free channel id")]
	NoFreeChannel,
	/// A payload exceeded the 16-bit size limit of the wire format.
	#[error("message size {0} exceeds the wire limit")]
	Oversize(usize),
	/// A malformed frame arrived from the peer.
	#[error("bad message: {0}")]
	BadMessage(&'static str),
}

impl Error {
	/// Translate an I/O error from a socket operation into the message
	/// queue taxonomy: broken connections become `Closed`, everything
	/// else stays an I/O error.
	pub fn from_socket(e: io::Error) -> Error {
		match e.kind() {
			io::ErrorKind::BrokenPipe
			| io::ErrorKind::ConnectionReset
			| io::ErrorKind::ConnectionAborted
			| io::ErrorKind::NotConnected
			| io::ErrorKind::UnexpectedEof => Error::Closed,
			_ => Error::Io(e),
		}
	}
}

/// Convenience result type for message queue operations.
pub type Result<T> = std::result::Result<T, Error>;
