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

//! Wire protocol for file transfer sessions. Message type values are
//! the order of the enumeration and are frozen: new messages go at the
//! end, existing ones are never removed or renumbered.

use byteorder::{BigEndian, ByteOrder};
use enum_primitive::FromPrimitive;

use crate::error::{Error, Result};

/// Protocol version spoken by this implementation.
pub const LOCAL_VERSION: u32 = 2;
/// Oldest protocol version we can interoperate with.
pub const MINIMUM_VERSION: u32 = 1;

/// Keepalive interval on transfer channels, in seconds.
pub const KEEPALIVE_TIMEOUT: u16 = 60;

/// Fixed prefix of a `FileBlock` payload (high and low offset words).
pub const BLOCK_OVERHEAD: usize = 8;

// Messages of a transfer session. Directions and payloads:
//   SenderVersion    S->R  u32 protocol version
//   ReceiverVersion  R->S  u32 protocol version
//   Ident            both  identity string
//   Ready            both  empty
//   DisconnectRetry  both  optional reason text; reconnect later
//   Disconnect       both  optional reason text; do not reconnect
//   NewFile          S->R  FileInfo
//   NewFileReady     R->S  empty
//   FileBlock        S->R  u64 offset (split high/low) + raw bytes
//   FileComplete     S->R  empty
//   DuplicateFile    R->S  empty
//   RejectFile       R->S  empty
enum_from_primitive! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub enum TransferMsg {
		SenderVersion = 0,
		ReceiverVersion,
		Ident,
		Ready,
		DisconnectRetry,
		Disconnect,
		NewFile,
		NewFileReady,
		FileBlock,
		FileComplete,
		DuplicateFile,
		RejectFile,
	}
}

impl TransferMsg {
	/// Decode a wire message type value.
	pub fn from_wire(value: u16) -> Option<TransferMsg> {
		TransferMsg::from_u16(value)
	}
}

/// Metadata announcing one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
	/// File size in bytes.
	pub size: u64,
	/// Block size the sender will use.
	pub block_size: u32,
	/// Unix permission bits to apply at the destination.
	pub mode: u32,
	/// Bare filename; never contains a path separator.
	pub name: String,
}

impl FileInfo {
	/// Serialize: four big-endian u32 words (size split high/low,
	/// block size, mode) followed by the filename bytes.
	pub fn encode(&self) -> Result<Vec<u8>> {
		if self.name.is_empty() {
			return Err(Error::Protocol(String::from("empty filename")));
		}
		let mut buf = vec![0u8; 16];
		BigEndian::write_u32(&mut buf[0..4], (self.size >> 32) as u32);
		BigEndian::write_u32(&mut buf[4..8], self.size as u32);
		BigEndian::write_u32(&mut buf[8..12], self.block_size);
		BigEndian::write_u32(&mut buf[12..16], self.mode);
		buf.extend_from_slice(self.name.as_bytes());
		if buf.len() > courier_msgq::MAX_PAYLOAD {
			return Err(Error::Protocol(format!(
				"filename too long: {} bytes",
				self.name.len()
			)));
		}
		Ok(buf)
	}

	/// Decode a `NewFile` payload.
	pub fn decode(payload: &[u8]) -> Result<FileInfo> {
		if payload.len() <= 16 {
			return Err(Error::Protocol(String::from("short file info")));
		}
		let high = BigEndian::read_u32(&payload[0..4]);
		let low = BigEndian::read_u32(&payload[4..8]);
		let block_size = BigEndian::read_u32(&payload[8..12]);
		let mode = BigEndian::read_u32(&payload[12..16]);
		let name = std::str::from_utf8(&payload[16..])
			.map_err(|_| Error::Protocol(String::from("filename is not UTF-8")))?
			.to_string();
		Ok(FileInfo {
			size: (u64::from(high) << 32) | u64::from(low),
			block_size,
			mode,
			name,
		})
	}
}

/// Encode the offset prefix of a `FileBlock` payload.
pub fn encode_block_offset(offset: u64) -> Vec<u8> {
	let mut buf = vec![0u8; BLOCK_OVERHEAD];
	BigEndian::write_u32(&mut buf[0..4], (offset >> 32) as u32);
	BigEndian::write_u32(&mut buf[4..8], offset as u32);
	buf
}

/// Decode a `FileBlock` payload into its offset and data bytes.
pub fn decode_block(payload: &[u8]) -> Result<(u64, &[u8])> {
	if payload.len() < BLOCK_OVERHEAD {
		return Err(Error::Protocol(String::from("short file block")));
	}
	let high = BigEndian::read_u32(&payload[0..4]);
	let low = BigEndian::read_u32(&payload[4..8]);
	Ok((
		(u64::from(high) << 32) | u64::from(low),
		&payload[BLOCK_OVERHEAD..],
	))
}

/// Encode a u32 payload (the version messages).
pub fn encode_u32(value: u32) -> Vec<u8> {
	let mut buf = vec![0u8; 4];
	BigEndian::write_u32(&mut buf, value);
	buf
}

/// Decode a u32 payload.
pub fn decode_u32(payload: &[u8]) -> Result<u32> {
	if payload.len() < 4 {
		return Err(Error::Protocol(String::from("short u32 payload")));
	}
	Ok(BigEndian::read_u32(&payload[0..4]))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn message_values_are_frozen() {
		assert_eq!(TransferMsg::SenderVersion as u16, 0);
		assert_eq!(TransferMsg::ReceiverVersion as u16, 1);
		assert_eq!(TransferMsg::Ident as u16, 2);
		assert_eq!(TransferMsg::Ready as u16, 3);
		assert_eq!(TransferMsg::DisconnectRetry as u16, 4);
		assert_eq!(TransferMsg::Disconnect as u16, 5);
		assert_eq!(TransferMsg::NewFile as u16, 6);
		assert_eq!(TransferMsg::NewFileReady as u16, 7);
		assert_eq!(TransferMsg::FileBlock as u16, 8);
		assert_eq!(TransferMsg::FileComplete as u16, 9);
		assert_eq!(TransferMsg::DuplicateFile as u16, 10);
		assert_eq!(TransferMsg::RejectFile as u16, 11);
		assert_eq!(TransferMsg::from_wire(11), Some(TransferMsg::RejectFile));
		assert_eq!(TransferMsg::from_wire(12), None);
	}

	#[test]
	fn file_info_round_trip() {
		let info = FileInfo {
			size: 0x1_2345_6789,
			block_size: 4096,
			mode: 0o644,
			name: String::from("flows-20240110.bin"),
		};
		let wire = info.encode().unwrap();
		assert_eq!(FileInfo::decode(&wire).unwrap(), info);
	}

	#[test]
	fn file_info_rejects_garbage() {
		assert!(FileInfo::decode(&[0u8; 16]).is_err());
		assert!(FileInfo::decode(b"short").is_err());
		let info = FileInfo {
			size: 1,
			block_size: 1,
			mode: 0,
			name: String::new(),
		};
		assert!(info.encode().is_err());
	}

	#[test]
	fn block_offset_round_trip() {
		let mut payload = encode_block_offset(0xFFFF_FFFF_0001);
		payload.extend_from_slice(b"data");
		let (offset, data) = decode_block(&payload).unwrap();
		assert_eq!(offset, 0xFFFF_FFFF_0001);
		assert_eq!(data, b"data");
	}
}
