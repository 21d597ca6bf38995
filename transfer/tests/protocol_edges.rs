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

//! Protocol boundary tests driven by a hand-rolled sender speaking the
//! wire protocol directly at a real receiver daemon.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use courier_msgq::{
	decode_channel_payload, Msg, MsgQueue, CHANNEL_CONTROL, CTL_CHANNEL_DIED,
};
use courier_transfer::proto::{
	encode_block_offset, encode_u32, FileInfo, TransferMsg, LOCAL_VERSION,
};
use courier_transfer::{
	DaemonMode, Dispositions, PeerConfig, Priority, ReceiverConfig, ReceiverDaemon,
	TransferConfig,
};

fn init_logs() {
	let _ = env_logger::builder().is_test(true).try_init();
}

fn free_addr() -> SocketAddr {
	let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
	let addr = sock.local_addr().unwrap();
	drop(sock);
	addr
}

fn wait_for<F>(what: &str, mut cond: F)
where
	F: FnMut() -> bool,
{
	let deadline = Instant::now() + Duration::from_secs(15);
	while !cond() {
		if Instant::now() > deadline {
			panic!("timed out waiting for {}", what);
		}
		std::thread::sleep(Duration::from_millis(50));
	}
}

struct ReceiverRig {
	_root: tempfile::TempDir,
	/// The incoming directory of the one configured peer, `source1`.
	incoming: PathBuf,
	/// The error directory of that peer.
	errors: PathBuf,
	daemon: ReceiverDaemon,
}

fn start_receiver(addr: SocketAddr) -> ReceiverRig {
	let root = tempfile::tempdir().unwrap();
	let incoming = root.path().join("incoming");
	let errors = root.path().join("errors");
	fs::create_dir(&incoming).unwrap();
	fs::create_dir(&errors).unwrap();
	let daemon = ReceiverDaemon::new(ReceiverConfig {
		transfer: TransferConfig {
			ident: String::from("dest1"),
			mode: DaemonMode::Listen { bind: vec![addr] },
			peers: vec![PeerConfig {
				ident: String::from("source1"),
				addrs: vec![],
				filter: None,
				priority: Priority::Low,
			}],
			tls: None,
			keepalive_secs: 60,
		},
		incoming_dir: incoming.clone(),
		dispositions: Dispositions {
			archive_dir: None,
			error_dir: Some(errors.clone()),
			post_command: None,
		},
		max_open_files: 4,
	})
	.unwrap();
	daemon.start().unwrap();
	ReceiverRig {
		_root: root,
		incoming: incoming.join("source1"),
		errors: errors.join("source1"),
		daemon,
	}
}

/// Next message on `chan`, read from the primary queue so a dying
/// channel is observed instead of blocking forever. `None` means the
/// channel was torn down first.
fn next_on_channel(queue: &MsgQueue, chan: u16) -> Option<Msg> {
	loop {
		let msg = queue.get_message().ok()?;
		if msg.channel() == CHANNEL_CONTROL {
			let died = msg.typ() == CTL_CHANNEL_DIED
				&& decode_channel_payload(msg.payload())
					.map(|c| c == chan)
					.unwrap_or(false);
			if died {
				return None;
			}
			continue;
		}
		if msg.channel() == chan {
			return Some(msg);
		}
	}
}

/// A bare-metal sender: connect and complete the handshake, returning
/// the queue and channel ready for file messages.
fn handshake(addr: &SocketAddr) -> (MsgQueue, u16) {
	let queue = MsgQueue::create().unwrap();
	let chan = queue.connect_tcp(addr).unwrap();

	let send = |typ: TransferMsg, payload: &[u8]| {
		queue.send_message(chan, typ as u16, payload).unwrap();
	};
	let expect = |typ: TransferMsg| {
		let msg = queue.get_message_from_channel(chan).unwrap();
		assert_eq!(msg.typ(), typ as u16, "expected {:?}", typ);
		msg
	};

	send(TransferMsg::SenderVersion, &encode_u32(LOCAL_VERSION));
	expect(TransferMsg::ReceiverVersion);
	send(TransferMsg::Ident, b"source1");
	expect(TransferMsg::Ident);
	send(TransferMsg::Ready, &[]);
	expect(TransferMsg::Ready);
	(queue, chan)
}

#[test]
fn mid_stream_disconnect_deletes_the_placeholder() {
	init_logs();
	let addr = free_addr();
	let rig = start_receiver(addr);
	let (queue, chan) = handshake(&addr);

	let info = FileInfo {
		size: 1_000_000,
		block_size: 4096,
		mode: 0o644,
		name: String::from("big.bin"),
	};
	queue
		.send_message(chan, TransferMsg::NewFile as u16, &info.encode().unwrap())
		.unwrap();
	let reply = queue.get_message_from_channel(chan).unwrap();
	assert_eq!(reply.typ(), TransferMsg::NewFileReady as u16);

	// A couple of blocks, then drop the connection cold.
	for i in 0..2u64 {
		let mut payload = encode_block_offset(i * 4096);
		payload.extend_from_slice(&[7u8; 4096]);
		queue
			.send_message(chan, TransferMsg::FileBlock as u16, &payload)
			.unwrap();
	}
	wait_for("placeholder to appear", || {
		rig.incoming.join(".big.bin").exists()
	});
	queue.shutdown_all();

	wait_for("placeholder cleanup", || {
		!rig.incoming.join(".big.bin").exists()
	});
	assert!(!rig.incoming.join("big.bin").exists());

	rig.daemon.stop();
}

#[test]
fn block_beyond_declared_size_is_rejected() {
	init_logs();
	let addr = free_addr();
	let rig = start_receiver(addr);
	let (queue, chan) = handshake(&addr);

	let info = FileInfo {
		size: 100,
		block_size: 4096,
		mode: 0o644,
		name: String::from("short.bin"),
	};
	queue
		.send_message(chan, TransferMsg::NewFile as u16, &info.encode().unwrap())
		.unwrap();
	let reply = queue.get_message_from_channel(chan).unwrap();
	assert_eq!(reply.typ(), TransferMsg::NewFileReady as u16);

	// 200 bytes at offset 0 overruns the declared 100.
	let mut payload = encode_block_offset(0);
	payload.extend_from_slice(&[1u8; 200]);
	queue
		.send_message(chan, TransferMsg::FileBlock as u16, &payload)
		.unwrap();

	// The rejection may race the connection teardown that follows it.
	if let Some(reply) = next_on_channel(&queue, chan) {
		assert_eq!(reply.typ(), TransferMsg::RejectFile as u16);
	}

	// The offending partial lands in the error directory and the
	// final path never appears.
	wait_for("error disposition", || {
		rig.errors.as_path().read_dir().unwrap().next().is_some()
	});
	assert!(!rig.incoming.join("short.bin").exists());

	queue.shutdown_all();
	rig.daemon.stop();
}

#[test]
fn filename_with_separator_is_rejected() {
	init_logs();
	let addr = free_addr();
	let rig = start_receiver(addr);
	let (queue, chan) = handshake(&addr);

	// FileInfo::encode refuses path separators upstream, so build the
	// payload by hand the way a hostile sender would.
	let mut payload = FileInfo {
		size: 10,
		block_size: 4096,
		mode: 0o644,
		name: String::from("placeholder"),
	}
	.encode()
	.unwrap();
	payload.truncate(16);
	payload.extend_from_slice(b"../escape.bin");
	queue
		.send_message(chan, TransferMsg::NewFile as u16, &payload)
		.unwrap();

	let reply = next_on_channel(&queue, chan).expect("session should stay up");
	assert_eq!(reply.typ(), TransferMsg::RejectFile as u16);
	assert!(!rig.incoming.join("escape.bin").exists());
	assert!(!rig.incoming.join("../escape.bin").exists());

	queue.shutdown_all();
	rig.daemon.stop();
}

#[test]
fn sender_redelivers_after_midstream_disconnect() {
	init_logs();
	let addr = free_addr();

	// A hand-rolled receiver that will drop the first session cold in
	// the middle of the block stream.
	let server = MsgQueue::create().unwrap();
	server.bind_tcp(&[addr]).unwrap();

	let root = tempfile::tempdir().unwrap();
	let spool = root.path().join("spool");
	fs::create_dir(&spool).unwrap();
	let content: Vec<u8> = (0..200_000).map(|i| (i % 241) as u8).collect();
	let source = spool.join("big.bin");
	fs::write(&source, &content).unwrap();

	let sender = courier_transfer::SenderDaemon::new(courier_transfer::SenderConfig {
		transfer: TransferConfig {
			ident: String::from("source1"),
			mode: DaemonMode::Connect,
			peers: vec![PeerConfig {
				ident: String::from("dest1"),
				addrs: vec![addr],
				filter: None,
				priority: Priority::Low,
			}],
			tls: None,
			keepalive_secs: 60,
		},
		block_size: 4096,
		fair: false,
		dispositions: Dispositions::default(),
	})
	.unwrap();
	sender.queue_file("dest1", &source).unwrap();
	sender.start().unwrap();

	let await_session = |server: &MsgQueue| -> u16 {
		loop {
			let msg = server.get_message().unwrap();
			if msg.channel() == CHANNEL_CONTROL
				&& msg.typ() == courier_msgq::CTL_NEW_CONNECTION
			{
				break decode_channel_payload(&msg.to_vec()).unwrap();
			}
		}
	};
	let serve_handshake = |server: &MsgQueue, chan: u16, accept_file: bool| {
		let expect = |typ: TransferMsg| loop {
			let msg = server.get_message().unwrap();
			if msg.channel() == chan {
				assert_eq!(msg.typ(), typ as u16, "expected {:?}", typ);
				break msg;
			}
		};
		expect(TransferMsg::SenderVersion);
		server
			.send_message(
				chan,
				TransferMsg::ReceiverVersion as u16,
				&encode_u32(LOCAL_VERSION),
			)
			.unwrap();
		expect(TransferMsg::Ident);
		server
			.send_message(chan, TransferMsg::Ident as u16, b"dest1")
			.unwrap();
		expect(TransferMsg::Ready);
		server
			.send_message(chan, TransferMsg::Ready as u16, &[])
			.unwrap();
		expect(TransferMsg::NewFile);
		if accept_file {
			server
				.send_message(chan, TransferMsg::NewFileReady as u16, &[])
				.unwrap();
		}
	};

	// First session: the file is offered but the session dies before
	// the receiver accepts it.
	let chan = await_session(&server);
	serve_handshake(&server, chan, false);
	server.channel_kill(chan).unwrap();

	// The sender requeues the file and reconnects; serve the second
	// session to the end and reassemble the bytes.
	let chan = await_session(&server);
	serve_handshake(&server, chan, true);
	let mut received = Vec::with_capacity(content.len());
	loop {
		let msg = server.get_message().unwrap();
		if msg.channel() != chan {
			continue;
		}
		if msg.typ() == TransferMsg::FileComplete as u16 {
			break;
		}
		assert_eq!(msg.typ(), TransferMsg::FileBlock as u16);
		let payload = msg.to_vec();
		let (offset, data) =
			courier_transfer::proto::decode_block(&payload).unwrap();
		assert_eq!(offset as usize, received.len(), "blocks must be in order");
		received.extend_from_slice(data);
	}
	assert_eq!(received, content);

	// With delivery confirmed and no archive configured, the sender
	// deletes its copy.
	wait_for("source disposed", || !source.exists());

	sender.stop();
	server.shutdown_all();
}

#[test]
fn unknown_identity_is_disconnected() {
	init_logs();
	let addr = free_addr();
	let rig = start_receiver(addr);

	let queue = MsgQueue::create().unwrap();
	let chan = queue.connect_tcp(&addr).unwrap();
	queue
		.send_message(
			chan,
			TransferMsg::SenderVersion as u16,
			&encode_u32(LOCAL_VERSION),
		)
		.unwrap();
	let msg = queue.get_message_from_channel(chan).unwrap();
	assert_eq!(msg.typ(), TransferMsg::ReceiverVersion as u16);
	queue
		.send_message(chan, TransferMsg::Ident as u16, b"impostor")
		.unwrap();

	// Either the Disconnect notice arrives or the channel is torn
	// down before it could be flushed.
	if let Some(msg) = next_on_channel(&queue, chan) {
		assert_eq!(msg.typ(), TransferMsg::Disconnect as u16);
	}

	queue.shutdown_all();
	rig.daemon.stop();
}
