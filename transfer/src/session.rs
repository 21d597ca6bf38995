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

//! Session plumbing shared by the sender and receiver state machines:
//! typed send/receive over a split queue, the disconnect handshake,
//! and version negotiation.

use std::sync::Arc;

use courier_msgq::{Msg, MsgQueue};

use crate::error::{Error, Result};
use crate::peers::{Peer, Transfers};
use crate::proto::{TransferMsg, MINIMUM_VERSION};

/// Send a typed message on the session channel.
pub(crate) fn send(queue: &MsgQueue, channel: u16, typ: TransferMsg, payload: &[u8]) -> Result<()> {
	queue.send_message(channel, typ as u16, payload)?;
	Ok(())
}

/// Send a typed message with no payload.
pub(crate) fn send_empty(queue: &MsgQueue, channel: u16, typ: TransferMsg) -> Result<()> {
	send(queue, channel, typ, &[])
}

/// Receive the next message of the session, decoding its type. The
/// queue is a split queue, so only this channel's traffic arrives.
pub(crate) fn recv(queue: &MsgQueue) -> Result<(TransferMsg, Msg)> {
	let msg = match queue.get_message() {
		Ok(msg) => msg,
		Err(courier_msgq::Error::Shutdown) => return Err(Error::SessionClosed),
		Err(e) => return Err(Error::Msgq(e)),
	};
	match TransferMsg::from_wire(msg.typ()) {
		Some(typ) => Ok((typ, msg)),
		None => Err(Error::Protocol(format!(
			"unknown message type {:#06x}",
			msg.typ()
		))),
	}
}

/// Receive and require a specific message type. Disconnect requests
/// from the peer become `Disconnected` errors carrying the reason.
pub(crate) fn expect(queue: &MsgQueue, want: TransferMsg) -> Result<Msg> {
	let (typ, msg) = recv(queue)?;
	if typ == want {
		return Ok(msg);
	}
	match typ {
		TransferMsg::DisconnectRetry => Err(Error::Disconnected {
			retry: true,
			reason: String::from_utf8_lossy(msg.payload()).to_string(),
		}),
		TransferMsg::Disconnect => Err(Error::Disconnected {
			retry: false,
			reason: String::from_utf8_lossy(msg.payload()).to_string(),
		}),
		other => Err(Error::Protocol(format!(
			"expected {:?}, got {:?}",
			want, other
		))),
	}
}

/// Ask the peer to drop the session, logging the reason we give.
pub(crate) fn send_disconnect(queue: &MsgQueue, channel: u16, retry: bool, reason: &str) {
	let typ = if retry {
		TransferMsg::DisconnectRetry
	} else {
		TransferMsg::Disconnect
	};
	info!("disconnecting (retry={}): {}", retry, reason);
	let _ = send(queue, channel, typ, reason.as_bytes());
}

/// Pick the session protocol version, failing when the common subset is
/// below our floor.
pub(crate) fn negotiate_version(local: u32, remote: u32) -> Result<u32> {
	let version = local.min(remote);
	if version < MINIMUM_VERSION {
		return Err(Error::Protocol(format!(
			"peer protocol version {} is below the supported minimum {}",
			remote, MINIMUM_VERSION
		)));
	}
	Ok(version)
}

/// Resolve the remote identity to a configured peer, honoring the
/// expectation the connector side carries.
pub(crate) fn resolve_peer(
	transfers: &Arc<Transfers>,
	expected: Option<&Arc<Peer>>,
	remote_ident: &str,
) -> Result<Arc<Peer>> {
	match expected {
		Some(peer) => {
			if peer.ident == remote_ident {
				Ok(peer.clone())
			} else {
				Err(Error::Protocol(format!(
					"peer identified as '{}', expected '{}'",
					remote_ident, peer.ident
				)))
			}
		}
		None => transfers.get(remote_ident).ok_or_else(|| {
			Error::Protocol(format!("unknown peer identity '{}'", remote_ident))
		}),
	}
}

/// Decode an identity payload.
pub(crate) fn decode_ident(msg: &Msg) -> Result<String> {
	let ident = std::str::from_utf8(msg.payload())
		.map_err(|_| Error::Protocol(String::from("identity is not UTF-8")))?;
	crate::config::check_ident(ident)
		.map_err(|_| Error::Protocol(format!("invalid identity '{}'", ident)))?;
	Ok(ident.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::proto::LOCAL_VERSION;

	#[test]
	fn version_negotiation() {
		assert_eq!(negotiate_version(LOCAL_VERSION, 7).unwrap(), LOCAL_VERSION);
		assert_eq!(negotiate_version(LOCAL_VERSION, 1).unwrap(), 1);
		assert!(negotiate_version(LOCAL_VERSION, 0).is_err());
	}
}
