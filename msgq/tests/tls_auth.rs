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

//! Mutual-TLS tests: authenticated round trip, and rejection of a peer
//! whose certificate chain is not signed by the configured CA.

use std::net::SocketAddr;
use std::path::PathBuf;

use courier_msgq::{
	decode_channel_payload, MsgQueue, TlsCreds, CHANNEL_CONTROL, CTL_NEW_CONNECTION,
};

fn init_logs() {
	let _ = env_logger::builder().is_test(true).try_init();
}

fn data(name: &str) -> PathBuf {
	PathBuf::from(env!("CARGO_MANIFEST_DIR"))
		.join("tests/data")
		.join(name)
}

fn trusted_creds() -> TlsCreds {
	TlsCreds::new(&data("ca.pem"), &data("node.pem"), &data("node.key")).unwrap()
}

fn rogue_creds() -> TlsCreds {
	// Certificate signed by a different CA; trusts that CA, so the
	// remote's certificate never verifies either.
	TlsCreds::new(&data("other-ca.pem"), &data("rogue.pem"), &data("rogue.key")).unwrap()
}

fn free_addr() -> SocketAddr {
	let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
	let addr = sock.local_addr().unwrap();
	drop(sock);
	addr
}

#[test]
fn tls_mutual_auth_roundtrip() {
	init_logs();
	let addr = free_addr();

	let server = MsgQueue::create().unwrap();
	server.set_tls_creds(trusted_creds());
	server.bind_tls(&[addr]).unwrap();

	let client = MsgQueue::create().unwrap();
	client.set_tls_creds(trusted_creds());
	let chan = client.connect_tls(&addr, Some("localhost")).unwrap();

	let server_chan = loop {
		let msg = server.get_message().unwrap();
		if msg.channel() == CHANNEL_CONTROL && msg.typ() == CTL_NEW_CONNECTION {
			break decode_channel_payload(&msg.to_vec()).unwrap();
		}
	};

	client.send_message(chan, 5, b"over tls").unwrap();
	let msg = server.get_message_from_channel(server_chan).unwrap();
	assert_eq!(msg.payload(), b"over tls");

	let info = client.connection_info(chan).unwrap();
	assert!(info.starts_with("TCP, "), "unexpected info: {}", info);

	client.shutdown_all();
	server.shutdown_all();
}

#[test]
fn tls_untrusted_peer_is_rejected_repeatedly() {
	init_logs();
	let addr = free_addr();

	let server = MsgQueue::create().unwrap();
	server.set_tls_creds(trusted_creds());
	server.bind_tls(&[addr]).unwrap();

	let client = MsgQueue::create().unwrap();
	client.set_tls_creds(rogue_creds());

	// The connector keeps retrying and keeps failing; no channel is
	// ever created.
	for _ in 0..3 {
		assert!(client.connect_tls(&addr, Some("localhost")).is_err());
	}

	client.shutdown_all();
	server.shutdown_all();
}

#[test]
fn bind_tls_requires_credentials() {
	init_logs();
	let queue = MsgQueue::create().unwrap();
	assert!(queue.bind_tls(&[free_addr()]).is_err());
	queue.shutdown_all();
}
