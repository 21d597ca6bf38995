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

//! Wire message representation. Every message on every channel is a
//! 6 byte header (channel, type, size; all u16, network byte order)
//! followed by up to 65,535 payload bytes.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Size of the fixed message header on the wire.
pub const MSG_HDR_LEN: usize = 6;

/// Largest possible payload.
pub const MAX_PAYLOAD: usize = u16::max_value() as usize;

/// The distinguished control channel, present on every queue.
pub const CHANNEL_CONTROL: u16 = 0xFFFF;

/// Lowest message type reserved for system control traffic. Types at or
/// above this value are consumed by the transport and never surface to
/// user code; user code must never emit them.
pub const MIN_SYSTEM_TYPE: u16 = 0xFFFA;

/// Zero-payload liveness probe inserted by an idle writer.
pub const TYPE_KEEPALIVE: u16 = 0xFFFA;
/// Sentinel used to wake a writer blocked on its outbound deque. Never
/// written to the wire.
pub const TYPE_WRITER_UNBLOCKER: u16 = 0xFFFB;
/// Remote notification that a channel was destroyed.
pub const TYPE_CHANNEL_KILL: u16 = 0xFFFC;
/// Reply to a channel announcement carrying the (remote, local) pair.
pub const TYPE_CHANNEL_REPLY: u16 = 0xFFFD;
/// Announcement of a new channel carrying the announcer's local id.
pub const TYPE_CHANNEL_ANNOUNCE: u16 = 0xFFFE;

/// Control-channel notification: a peer opened a channel to us. The
/// payload is the u16 local channel id followed by the textual peer
/// address.
pub const CTL_NEW_CONNECTION: u16 = 0;
/// Control-channel notification: a connected channel died. The payload
/// is the u16 local channel id.
pub const CTL_CHANNEL_DIED: u16 = 1;

/// An owned message. Outgoing messages may be scattered over several
/// payload segments; received messages always hold a single segment.
#[derive(Debug)]
pub struct Msg {
	channel: u16,
	typ: u16,
	segments: Vec<Vec<u8>>,
	len: u16,
}

impl Msg {
	/// Build a message with a single payload segment.
	pub fn new(channel: u16, typ: u16, payload: Vec<u8>) -> Result<Msg> {
		if payload.len() > MAX_PAYLOAD {
			return Err(Error::Oversize(payload.len()));
		}
		let len = payload.len() as u16;
		let segments = if payload.is_empty() {
			vec![]
		} else {
			vec![payload]
		};
		Ok(Msg {
			channel,
			typ,
			segments,
			len,
		})
	}

	/// Build a zero-payload message.
	pub fn empty(channel: u16, typ: u16) -> Msg {
		Msg {
			channel,
			typ,
			segments: vec![],
			len: 0,
		}
	}

	/// Build a message scattered over multiple payload segments without
	/// copying them. The segments are consumed; if the combined size
	/// exceeds the wire limit they are dropped and an error is returned.
	pub fn scattered(channel: u16, typ: u16, segments: Vec<Vec<u8>>) -> Result<Msg> {
		let total: usize = segments.iter().map(|s| s.len()).sum();
		if total > MAX_PAYLOAD {
			return Err(Error::Oversize(total));
		}
		let segments = segments.into_iter().filter(|s| !s.is_empty()).collect();
		Ok(Msg {
			channel,
			typ,
			segments,
			len: total as u16,
		})
	}

	/// The channel this message belongs to. On received messages this is
	/// the local channel id.
	pub fn channel(&self) -> u16 {
		self.channel
	}

	/// The application message type.
	pub fn typ(&self) -> u16 {
		self.typ
	}

	/// Payload length in bytes.
	pub fn len(&self) -> u16 {
		self.len
	}

	/// Whether the payload is empty.
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// View of the payload. Received messages are always contiguous;
	/// scattered outgoing messages expose only their first segment here.
	pub fn payload(&self) -> &[u8] {
		match self.segments.first() {
			Some(seg) => &seg[..],
			None => &[],
		}
	}

	/// Copy the payload (all segments) into one contiguous vector.
	pub fn to_vec(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(self.len as usize);
		for seg in &self.segments {
			out.extend_from_slice(seg);
		}
		out
	}

	/// Payload segments, header excluded.
	pub(crate) fn segments(&self) -> &[Vec<u8>] {
		&self.segments
	}

	/// Serialize the header into a fresh buffer. The message itself is
	/// never byte-swapped in place, so re-encoding is always safe.
	pub(crate) fn encode_header(&self) -> [u8; MSG_HDR_LEN] {
		let mut hdr = [0u8; MSG_HDR_LEN];
		BigEndian::write_u16(&mut hdr[0..2], self.channel);
		BigEndian::write_u16(&mut hdr[2..4], self.typ);
		BigEndian::write_u16(&mut hdr[4..6], self.len);
		hdr
	}

	/// Rewrite the channel id. Used when the transport readdresses a
	/// message to the remote end's channel id.
	pub(crate) fn set_channel(&mut self, channel: u16) {
		self.channel = channel;
	}
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHdr {
	/// Target channel id.
	pub channel: u16,
	/// Message type.
	pub typ: u16,
	/// Payload size in bytes.
	pub size: u16,
}

impl MsgHdr {
	/// Decode a header from its 6 wire bytes.
	pub fn decode(buf: &[u8; MSG_HDR_LEN]) -> MsgHdr {
		MsgHdr {
			channel: BigEndian::read_u16(&buf[0..2]),
			typ: BigEndian::read_u16(&buf[2..4]),
			size: BigEndian::read_u16(&buf[4..6]),
		}
	}
}

/// Assemble a received message from its decoded header and payload.
pub(crate) fn from_wire(hdr: MsgHdr, payload: Vec<u8>) -> Msg {
	debug_assert_eq!(hdr.size as usize, payload.len());
	let segments = if payload.is_empty() {
		vec![]
	} else {
		vec![payload]
	};
	Msg {
		channel: hdr.channel,
		typ: hdr.typ,
		segments,
		len: hdr.size,
	}
}

/// Encode a u16 channel id payload (network byte order), as carried by
/// the channel handshake and death notifications.
pub fn channel_payload(channel: u16) -> Vec<u8> {
	let mut buf = vec![0u8; 2];
	BigEndian::write_u16(&mut buf, channel);
	buf
}

/// Decode a u16 channel id payload.
pub fn decode_channel_payload(payload: &[u8]) -> Result<u16> {
	if payload.len() < 2 {
		return Err(Error::BadMessage("channel payload too short"));
	}
	Ok(BigEndian::read_u16(&payload[0..2]))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn header_round_trip() {
		let msg = Msg::new(0x0102, 0x0304, vec![1, 2, 3]).unwrap();
		let hdr = msg.encode_header();
		assert_eq!(hdr, [0x01, 0x02, 0x03, 0x04, 0x00, 0x03]);
		let decoded = MsgHdr::decode(&hdr);
		assert_eq!(decoded.channel, 0x0102);
		assert_eq!(decoded.typ, 0x0304);
		assert_eq!(decoded.size, 3);
	}

	#[test]
	fn scattered_accumulates_segments() {
		let msg =
			Msg::scattered(7, 9, vec![vec![1, 2], vec![], vec![3, 4, 5]]).unwrap();
		assert_eq!(msg.len(), 5);
		assert_eq!(msg.to_vec(), vec![1, 2, 3, 4, 5]);
	}

	#[test]
	fn scattered_rejects_oversize() {
		let seg = vec![0u8; 40_000];
		let err = Msg::scattered(1, 1, vec![seg.clone(), seg]).unwrap_err();
		match err {
			Error::Oversize(n) => assert_eq!(n, 80_000),
			e => panic!("unexpected error {:?}", e),
		}
	}

	#[test]
	fn oversize_single_payload_rejected() {
		let err = Msg::new(1, 1, vec![0u8; MAX_PAYLOAD + 1]).unwrap_err();
		assert!(matches!(err, Error::Oversize(_)));
	}

	#[test]
	fn channel_payload_round_trip() {
		let buf = channel_payload(0xBEEF);
		assert_eq!(decode_channel_payload(&buf).unwrap(), 0xBEEF);
	}
}
