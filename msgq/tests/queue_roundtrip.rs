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

//! End to end tests of the message queue over loopback TCP.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use courier_msgq::{
	decode_channel_payload, Error, MsgQueue, CHANNEL_CONTROL, CTL_CHANNEL_DIED,
	CTL_NEW_CONNECTION,
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

/// Wait for the next control notification of the given type, skipping
/// unrelated traffic.
fn await_control(queue: &MsgQueue, wanted: u16) -> (u16, Vec<u8>) {
	loop {
		let msg = queue.get_message().unwrap();
		if msg.channel() == CHANNEL_CONTROL && msg.typ() == wanted {
			let payload = msg.to_vec();
			let channel = decode_channel_payload(&payload).unwrap();
			return (channel, payload);
		}
	}
}

#[test]
fn roundtrip_preserves_order_and_content() {
	init_logs();
	let addr = free_addr();

	let server = MsgQueue::create().unwrap();
	server.bind_tcp(&[addr]).unwrap();

	let client = MsgQueue::create().unwrap();
	let chan = client.connect_tcp(&addr).unwrap();

	let (server_chan, _) = await_control(&server, CTL_NEW_CONNECTION);

	for i in 0..100u32 {
		let payload = format!("message-{:03}", i).into_bytes();
		client.send_message(chan, 7, &payload).unwrap();
	}

	for i in 0..100u32 {
		let msg = server.get_message_from_channel(server_chan).unwrap();
		assert_eq!(msg.channel(), server_chan);
		assert_eq!(msg.typ(), 7);
		assert_eq!(msg.payload(), format!("message-{:03}", i).as_bytes());
	}

	// And the other direction on the same channel.
	for i in 0..10u32 {
		server
			.send_message(server_chan, 8, format!("reply-{}", i).as_bytes())
			.unwrap();
	}
	for i in 0..10u32 {
		let msg = client.get_message_from_channel(chan).unwrap();
		assert_eq!(msg.typ(), 8);
		assert_eq!(msg.payload(), format!("reply-{}", i).as_bytes());
	}

	client.shutdown_all();
	server.shutdown_all();
}

#[test]
fn scatter_send_reassembles_on_the_wire() {
	init_logs();
	let addr = free_addr();

	let server = MsgQueue::create().unwrap();
	server.bind_tcp(&[addr]).unwrap();
	let client = MsgQueue::create().unwrap();
	let chan = client.connect_tcp(&addr).unwrap();
	let (server_chan, _) = await_control(&server, CTL_NEW_CONNECTION);

	client
		.scatter_send_no_copy(
			chan,
			3,
			vec![b"head-".to_vec(), b"middle-".to_vec(), b"tail".to_vec()],
		)
		.unwrap();
	let msg = server.get_message_from_channel(server_chan).unwrap();
	assert_eq!(msg.payload(), b"head-middle-tail");

	// An oversized scatter fails without anything reaching the wire.
	let err = client
		.scatter_send_no_copy(chan, 3, vec![vec![0u8; 40_000], vec![0u8; 40_000]])
		.unwrap_err();
	assert!(matches!(err, Error::Oversize(_)));

	client.shutdown_all();
	server.shutdown_all();
}

#[test]
fn inject_message_loops_back() {
	init_logs();
	let queue = MsgQueue::create().unwrap();
	queue
		.inject_message(CHANNEL_CONTROL, 42, b"local only")
		.unwrap();
	let msg = queue.get_message().unwrap();
	assert_eq!(msg.channel(), CHANNEL_CONTROL);
	assert_eq!(msg.typ(), 42);
	assert_eq!(msg.payload(), b"local only");
	queue.shutdown_all();
}

#[test]
fn channel_split_receives_only_its_traffic() {
	init_logs();
	let addr = free_addr();

	let server = MsgQueue::create().unwrap();
	server.bind_tcp(&[addr]).unwrap();
	let client = MsgQueue::create().unwrap();
	let chan_a = client.connect_tcp(&addr).unwrap();
	let (server_a, _) = await_control(&server, CTL_NEW_CONNECTION);

	// Second logical channel on the same connection.
	let chan_b = client.channel_new(chan_a).unwrap();
	let (server_b, _) = await_control(&server, CTL_NEW_CONNECTION);
	assert_ne!(server_a, server_b);

	let split = server.channel_split(server_b).unwrap();

	client.send_message(chan_a, 1, b"for the main queue").unwrap();
	client.send_message(chan_b, 2, b"for the split queue").unwrap();

	let msg = split.get_message().unwrap();
	assert_eq!(msg.channel(), server_b);
	assert_eq!(msg.payload(), b"for the split queue");

	let msg = server.get_message_from_channel(server_a).unwrap();
	assert_eq!(msg.payload(), b"for the main queue");

	client.shutdown_all();
	server.shutdown_all();
}

#[test]
fn channel_move_returns_traffic_to_the_target_queue() {
	init_logs();
	let addr = free_addr();

	let server = MsgQueue::create().unwrap();
	server.bind_tcp(&[addr]).unwrap();
	let client = MsgQueue::create().unwrap();
	let chan = client.connect_tcp(&addr).unwrap();
	let (server_chan, _) = await_control(&server, CTL_NEW_CONNECTION);

	// Split the channel off, then move it back onto the main queue.
	let split = server.channel_split(server_chan).unwrap();
	client.send_message(chan, 1, b"while split").unwrap();
	let msg = split.get_message().unwrap();
	assert_eq!(msg.payload(), b"while split");

	split.channel_move(server_chan, &server).unwrap();
	client.send_message(chan, 2, b"after move").unwrap();
	let msg = server.get_message_from_channel(server_chan).unwrap();
	assert_eq!(msg.payload(), b"after move");

	client.shutdown_all();
	server.shutdown_all();
}

#[test]
fn channel_kill_notifies_both_sides() {
	init_logs();
	let addr = free_addr();

	let server = MsgQueue::create().unwrap();
	server.bind_tcp(&[addr]).unwrap();
	let client = MsgQueue::create().unwrap();
	let chan = client.connect_tcp(&addr).unwrap();
	let (server_chan, _) = await_control(&server, CTL_NEW_CONNECTION);

	client.channel_kill(chan).unwrap();

	// The killing side observes exactly one local death notification.
	let (died_local, _) = await_control(&client, CTL_CHANNEL_DIED);
	assert_eq!(died_local, chan);

	// The remote side observes the death of its paired channel.
	let (died_remote, _) = await_control(&server, CTL_CHANNEL_DIED);
	assert_eq!(died_remote, server_chan);

	// The killed channel is gone locally; the remotely-closed channel
	// silently drops sends.
	assert!(matches!(
		client.send_message(chan, 1, b"x"),
		Err(Error::UnknownChannel(_))
	));
	server.send_message(server_chan, 1, b"x").unwrap();

	client.shutdown_all();
	server.shutdown_all();
}

#[test]
fn keepalive_holds_an_idle_connection_open() {
	init_logs();
	let addr = free_addr();

	let server = MsgQueue::create().unwrap();
	server.bind_tcp(&[addr]).unwrap();
	let client = MsgQueue::create().unwrap();
	let chan = client.connect_tcp(&addr).unwrap();
	let (server_chan, _) = await_control(&server, CTL_NEW_CONNECTION);

	client.set_keepalive(chan, 1).unwrap();
	server.set_keepalive(server_chan, 1).unwrap();

	// Idle for a few keepalive periods, then prove the channel still
	// works. Keepalives are transport-internal and never surface.
	std::thread::sleep(Duration::from_secs(3));
	client.send_message(chan, 9, b"still here").unwrap();
	let msg = server.get_message_from_channel(server_chan).unwrap();
	assert_eq!(msg.payload(), b"still here");

	client.shutdown_all();
	server.shutdown_all();
}

#[test]
fn connection_info_and_local_port() {
	init_logs();
	let addr = free_addr();

	let server = MsgQueue::create().unwrap();
	server.bind_tcp(&[addr]).unwrap();
	let client = MsgQueue::create().unwrap();
	let chan = client.connect_tcp(&addr).unwrap();

	assert_eq!(client.connection_info(chan).unwrap(), "TCP");
	assert!(client.local_port(chan).unwrap() > 0);
	assert!(client.get_remote_channel(chan).is_ok());

	client.shutdown_all();
	server.shutdown_all();
}

#[test]
fn shutdown_all_returns_promptly_and_wakes_getters() {
	init_logs();
	let addr = free_addr();

	let server = MsgQueue::create().unwrap();
	server.bind_tcp(&[addr]).unwrap();
	let client = MsgQueue::create().unwrap();
	let _chan = client.connect_tcp(&addr).unwrap();
	let (_server_chan, _) = await_control(&server, CTL_NEW_CONNECTION);

	let waiter_queue = server.clone();
	let waiter = std::thread::spawn(move || loop {
		// Control notifications may arrive first; wait for the error.
		if let Err(e) = waiter_queue.get_message() {
			return Err::<(), _>(e);
		}
	});

	std::thread::sleep(Duration::from_millis(100));
	let started = Instant::now();
	server.shutdown_all();
	assert!(
		started.elapsed() < Duration::from_secs(3),
		"shutdown_all took {:?}",
		started.elapsed()
	);

	assert!(matches!(waiter.join().unwrap(), Err(Error::Shutdown)));
	assert!(matches!(server.get_message(), Err(Error::Shutdown)));

	// Idempotent.
	server.shutdown_all();
	client.shutdown_all();
}
