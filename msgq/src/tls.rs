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

//! Mutual-TLS support for connections. Certificates are PEM files; the
//! server always demands a client certificate and both sides validate
//! the peer chain against the configured CA trust. All waits are
//! bounded polls so handshakes cannot outlive a shutdown request.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::convert::TryFrom;
use std::sync::Arc;
use std::time::{Duration, Instant};

use courier_util::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};

use crate::error::{Error, Result};
use crate::netio::{poll_readable, poll_writable, IO_POLL_TIMEOUT_MS};

/// Give a handshake at most this long before declaring it dead.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// TLS credential paths plus the rustls configs compiled from them.
/// Loading fails fast at configuration time, not at first connect.
pub struct TlsCreds {
	ca_path: PathBuf,
	cert_path: PathBuf,
	client_config: Arc<ClientConfig>,
	server_config: Arc<ServerConfig>,
}

impl std::fmt::Debug for TlsCreds {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TlsCreds")
			.field("ca", &self.ca_path)
			.field("cert", &self.cert_path)
			.finish()
	}
}

/// Load every certificate from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
	let file = File::open(path)
		.map_err(|e| Error::Tls(format!("unable to open {}: {}", path.display(), e)))?;
	let mut reader = BufReader::new(file);
	let certs: std::result::Result<Vec<_>, io::Error> =
		rustls_pemfile::certs(&mut reader).collect();
	let certs =
		certs.map_err(|e| Error::Tls(format!("bad PEM in {}: {}", path.display(), e)))?;
	if certs.is_empty() {
		return Err(Error::Tls(format!(
			"no certificates found in {}",
			path.display()
		)));
	}
	Ok(certs)
}

/// Load the first private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
	let file = File::open(path)
		.map_err(|e| Error::Tls(format!("unable to open {}: {}", path.display(), e)))?;
	let mut reader = BufReader::new(file);
	rustls_pemfile::private_key(&mut reader)
		.map_err(|e| Error::Tls(format!("bad PEM in {}: {}", path.display(), e)))?
		.ok_or_else(|| Error::Tls(format!("no private key found in {}", path.display())))
}

impl TlsCreds {
	/// Build credentials from a CA trust file and a cert/key PEM pair.
	pub fn new(ca_path: &Path, cert_path: &Path, key_path: &Path) -> Result<TlsCreds> {
		let ca_certs = load_certs(ca_path)?;
		let mut roots = RootCertStore::empty();
		for cert in ca_certs {
			roots
				.add(cert)
				.map_err(|e| Error::Tls(format!("bad CA certificate: {}", e)))?;
		}
		let certs = load_certs(cert_path)?;
		let key = load_private_key(key_path)?;

		let client_config = ClientConfig::builder()
			.with_root_certificates(roots.clone())
			.with_client_auth_cert(certs.clone(), key.clone_key())
			.map_err(|e| Error::Tls(format!("bad client credentials: {}", e)))?;

		let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
			.build()
			.map_err(|e| Error::Tls(format!("bad client verifier: {}", e)))?;
		let server_config = ServerConfig::builder()
			.with_client_cert_verifier(verifier)
			.with_single_cert(certs, key)
			.map_err(|e| Error::Tls(format!("bad server credentials: {}", e)))?;

		Ok(TlsCreds {
			ca_path: ca_path.to_path_buf(),
			cert_path: cert_path.to_path_buf(),
			client_config: Arc::new(client_config),
			server_config: Arc::new(server_config),
		})
	}
}

enum Session {
	Client(ClientConnection),
	Server(ServerConnection),
}

macro_rules! with_session {
	($self:expr, $conn:ident, $body:expr) => {
		match $self {
			Session::Client($conn) => $body,
			Session::Server($conn) => $body,
		}
	};
}

impl Session {
	fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
		with_session!(self, c, c.read_tls(rd))
	}

	fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
		with_session!(self, c, c.write_tls(wr))
	}

	fn process_new_packets(&mut self) -> std::result::Result<rustls::IoState, rustls::Error> {
		with_session!(self, c, c.process_new_packets())
	}

	fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		with_session!(self, c, c.reader().read(buf))
	}

	fn queue_plaintext(&mut self, data: &[u8]) -> io::Result<()> {
		with_session!(self, c, c.writer().write_all(data))
	}

	fn wants_read(&self) -> bool {
		with_session!(self, c, c.wants_read())
	}

	fn wants_write(&self) -> bool {
		with_session!(self, c, c.wants_write())
	}

	fn is_handshaking(&self) -> bool {
		with_session!(self, c, c.is_handshaking())
	}

	fn send_close_notify(&mut self) {
		with_session!(self, c, c.send_close_notify())
	}

	fn info(&self) -> (String, String) {
		let proto = with_session!(self, c, c.protocol_version())
			.map(|v| format!("{:?}", v))
			.unwrap_or_else(|| String::from("unknown"));
		let cipher = with_session!(self, c, c.negotiated_cipher_suite())
			.map(|s| format!("{:?}", s.suite()))
			.unwrap_or_else(|| String::from("unknown"));
		(proto, cipher)
	}
}

/// Outcome of draining the session towards the socket.
pub(crate) enum TlsFlush {
	/// All pending records were written.
	Done,
	/// The socket is full; poll for writability and call again.
	NeedsPoll,
}

/// Outcome of pumping the socket into the session.
pub(crate) enum TlsRead {
	/// Some plaintext may have been produced.
	Progress,
	/// The peer closed the stream.
	Eof,
	/// Nothing to read right now.
	WouldBlock,
}

/// A TLS session shared by a connection's reader and writer threads.
/// The lock is held only around rustls buffer operations, never across
/// a poll, so the two threads cannot stall each other for long.
pub(crate) struct TlsSession {
	sess: Mutex<Session>,
}

/// Human-readable reason for a TLS failure, with certificate problems
/// spelled out the way the verifier reported them.
pub(crate) fn tls_error_reason(err: &rustls::Error) -> String {
	use rustls::CertificateError;
	match err {
		rustls::Error::InvalidCertificate(cert_err) => {
			let reason = match cert_err {
				CertificateError::UnknownIssuer => "unknown issuer",
				CertificateError::Expired => "expired",
				CertificateError::NotValidYet => "not yet activated",
				CertificateError::Revoked => "revoked",
				CertificateError::BadSignature => "insecure or invalid signature",
				_ => return format!("certificate invalid: {:?}", cert_err),
			};
			format!("certificate invalid: {}", reason)
		}
		rustls::Error::AlertReceived(alert) => format!("peer alert: {:?}", alert),
		other => format!("{}", other),
	}
}

fn map_tls_error(err: rustls::Error) -> Error {
	Error::Tls(tls_error_reason(&err))
}

fn handshake(
	mut sess: Session,
	sock: &mut TcpStream,
	desc: &str,
	stop: &dyn Fn() -> bool,
) -> Result<TlsSession> {
	let fd = sock.as_raw_fd();
	let started = Instant::now();
	while sess.is_handshaking() {
		if stop() {
			return Err(Error::Shutdown);
		}
		if started.elapsed() > HANDSHAKE_TIMEOUT {
			warn!("TLS handshake with {} timed out", desc);
			return Err(Error::TimedOut);
		}
		if sess.wants_write() {
			match sess.write_tls(sock) {
				Ok(_) => {}
				Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
					poll_writable(fd, IO_POLL_TIMEOUT_MS).map_err(Error::from_socket)?;
				}
				Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
				Err(e) => return Err(Error::from_socket(e)),
			}
			continue;
		}
		if sess.wants_read() {
			// A poll timeout is just a retry, never an EOF.
			if !poll_readable(fd, IO_POLL_TIMEOUT_MS).map_err(Error::from_socket)? {
				continue;
			}
			match sess.read_tls(sock) {
				Ok(0) => {
					warn!("TLS handshake with {}: peer closed the connection", desc);
					return Err(Error::Closed);
				}
				Ok(_) => {
					if let Err(e) = sess.process_new_packets() {
						let reason = tls_error_reason(&e);
						warn!("TLS handshake with {} failed: {}", desc, reason);
						// Push the alert describing the failure out to
						// the peer before giving up.
						let _ = sess.write_tls(sock);
						return Err(Error::Tls(reason));
					}
				}
				Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
				Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
				Err(e) => return Err(Error::from_socket(e)),
			}
		}
	}
	// Flush the tail of the handshake.
	loop {
		if !sess.wants_write() {
			break;
		}
		match sess.write_tls(sock) {
			Ok(_) => {}
			Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
				poll_writable(fd, IO_POLL_TIMEOUT_MS).map_err(Error::from_socket)?;
			}
			Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
			Err(e) => return Err(Error::from_socket(e)),
		}
	}
	debug!("TLS handshake with {} complete", desc);
	Ok(TlsSession {
		sess: Mutex::new(sess),
	})
}

/// Run the client side of the handshake over a connected socket.
pub(crate) fn client_handshake(
	creds: &TlsCreds,
	sock: &mut TcpStream,
	server_name: &str,
	stop: &dyn Fn() -> bool,
) -> Result<TlsSession> {
	let name = ServerName::try_from(server_name.to_string())
		.map_err(|e| Error::Tls(format!("bad server name {}: {}", server_name, e)))?;
	let conn = ClientConnection::new(creds.client_config.clone(), name)
		.map_err(map_tls_error)?;
	handshake(Session::Client(conn), sock, server_name, stop)
}

/// Run the server side of the handshake over an accepted socket.
pub(crate) fn server_handshake(
	creds: &TlsCreds,
	sock: &mut TcpStream,
	peer_desc: &str,
	stop: &dyn Fn() -> bool,
) -> Result<TlsSession> {
	let conn = ServerConnection::new(creds.server_config.clone()).map_err(map_tls_error)?;
	handshake(Session::Server(conn), sock, peer_desc, stop)
}

impl TlsSession {
	/// Pump the socket into the session and drain any plaintext that
	/// became available into `out`.
	pub(crate) fn read_into(&self, sock: &mut TcpStream, out: &mut Vec<u8>) -> Result<TlsRead> {
		let mut sess = self.sess.lock();
		let mut outcome = TlsRead::WouldBlock;
		match sess.read_tls(sock) {
			Ok(0) => return Ok(TlsRead::Eof),
			Ok(_) => {
				sess.process_new_packets().map_err(|e| {
					debug!("TLS record processing failed: {}", tls_error_reason(&e));
					map_tls_error(e)
				})?;
				outcome = TlsRead::Progress;
			}
			Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
			Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
			Err(e) => return Err(Error::from_socket(e)),
		}
		let mut buf = [0u8; 8192];
		loop {
			match sess.read_plaintext(&mut buf) {
				Ok(0) => {
					// Clean close_notify. Deliver anything drained in
					// this pass first; the EOF repeats on the next.
					if out.is_empty() {
						return Ok(TlsRead::Eof);
					}
					break;
				}
				Ok(n) => {
					out.extend_from_slice(&buf[..n]);
					outcome = TlsRead::Progress;
				}
				Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
				Err(e) => return Err(Error::from_socket(e)),
			}
		}
		Ok(outcome)
	}

	/// Buffer plaintext for transmission.
	pub(crate) fn queue_plaintext(&self, data: &[u8]) -> Result<()> {
		let mut sess = self.sess.lock();
		sess.queue_plaintext(data).map_err(Error::from_socket)
	}

	/// Push buffered records to the socket. Returns `NeedsPoll` when the
	/// socket would block; the caller polls without holding the session
	/// lock and retries.
	pub(crate) fn flush(&self, sock: &mut TcpStream) -> Result<TlsFlush> {
		loop {
			let mut sess = self.sess.lock();
			if !sess.wants_write() {
				return Ok(TlsFlush::Done);
			}
			match sess.write_tls(sock) {
				Ok(_) => {}
				Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
					return Ok(TlsFlush::NeedsPoll);
				}
				Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
				Err(e) => return Err(Error::from_socket(e)),
			}
		}
	}

	/// Send the bidirectional shutdown alert, ignoring transient errors.
	pub(crate) fn close_notify(&self, sock: &mut TcpStream) {
		let mut sess = self.sess.lock();
		sess.send_close_notify();
		for _ in 0..4 {
			if !sess.wants_write() {
				break;
			}
			match sess.write_tls(sock) {
				Ok(_) => {}
				Err(ref e)
					if e.kind() == io::ErrorKind::WouldBlock
						|| e.kind() == io::ErrorKind::Interrupted =>
				{
					continue;
				}
				Err(_) => break,
			}
		}
	}

	/// Negotiated protocol and cipher, for connection information
	/// strings.
	pub(crate) fn info(&self) -> (String, String) {
		self.sess.lock().info()
	}
}
