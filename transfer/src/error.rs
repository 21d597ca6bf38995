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

/// Errors of the transfer daemons.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// Transport level failure.
	#[error("message queue error: {0}")]
	Msgq(#[from] courier_msgq::Error),
	/// Filesystem failure.
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),
	/// Invalid daemon or peer configuration.
	#[error("configuration error: {0}")]
	Config(String),
	/// The peer violated the transfer protocol.
	#[error("protocol error: {0}")]
	Protocol(String),
	/// The peer asked us to drop the session.
	#[error("peer disconnected (retry={retry}): {reason}")]
	Disconnected {
		/// Whether the peer allows reconnecting.
		retry: bool,
		/// Optional reason text supplied by the peer.
		reason: String,
	},
	/// The session's channel died.
	#[error("session channel closed")]
	SessionClosed,
}

/// Convenience result type for the transfer crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
	/// Whether reconnecting after this error is worthwhile.
	pub fn retryable(&self) -> bool {
		match self {
			Error::Disconnected { retry, .. } => *retry,
			Error::Config(_) => false,
			_ => true,
		}
	}
}
