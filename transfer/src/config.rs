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

//! Configuration types for the transfer daemons. Parsing a config file
//! syntax is someone else's job; these are the validated structures the
//! daemons consume.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Which side initiates the TCP connection for this daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonMode {
	/// Bind the given addresses and wait for peers to connect.
	Listen {
		/// Local addresses to bind.
		bind: Vec<SocketAddr>,
	},
	/// Dial out to each configured peer's address list.
	Connect,
}

/// Priority class of a file or peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
	/// Drained before any low priority traffic.
	High,
	/// Drained when nothing high priority is pending.
	Low,
}

/// TLS credential file locations.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsPaths {
	/// CA trust anchors (PEM).
	pub ca_file: PathBuf,
	/// Our certificate chain (PEM).
	pub cert_file: PathBuf,
	/// Our private key (PEM).
	pub key_file: PathBuf,
}

/// One configured remote peer. On-disk state is segregated per peer:
/// the daemons keep an `<ident>/` subdirectory for this peer under
/// each configured incoming, archive and error base directory.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
	/// Unique identity string of the remote. Doubles as the name of
	/// the peer's directory under each base directory, which the
	/// identity rules (no slash, no whitespace) keep safe.
	pub ident: String,
	/// Addresses to dial in `Connect` mode, tried in order.
	#[serde(default)]
	pub addrs: Vec<SocketAddr>,
	/// Receiver side: regex a filename must match to be accepted.
	#[serde(default)]
	pub filter: Option<String>,
	/// Default priority class for this peer's files.
	#[serde(default = "default_priority")]
	pub priority: Priority,
}

fn default_priority() -> Priority {
	Priority::Low
}

/// Configuration shared by both daemon roles.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
	/// Our own identity, exchanged and verified during the handshake.
	pub ident: String,
	/// Connector or listener role.
	pub mode: DaemonMode,
	/// Remote peers.
	pub peers: Vec<PeerConfig>,
	/// TLS credentials; plain TCP when absent.
	#[serde(default)]
	pub tls: Option<TlsPaths>,
	/// Keepalive on transfer channels, seconds.
	#[serde(default = "default_keepalive")]
	pub keepalive_secs: u16,
}

fn default_keepalive() -> u16 {
	crate::proto::KEEPALIVE_TIMEOUT
}

/// Validate an identity string: non-empty, no slash, no whitespace.
pub fn check_ident(ident: &str) -> Result<()> {
	if ident.is_empty() {
		return Err(Error::Config(String::from("identity must not be empty")));
	}
	if ident.contains('/') {
		return Err(Error::Config(format!(
			"identity '{}' must not contain a slash",
			ident
		)));
	}
	if ident.chars().any(char::is_whitespace) {
		return Err(Error::Config(format!(
			"identity '{}' must not contain whitespace",
			ident
		)));
	}
	Ok(())
}

impl TransferConfig {
	/// Validate identities (our own and every peer's, uniqueness
	/// included) and per-mode requirements.
	pub fn validate(&self) -> Result<()> {
		check_ident(&self.ident)?;
		if self.peers.is_empty() {
			return Err(Error::Config(String::from("no peers configured")));
		}
		let mut seen = std::collections::BTreeSet::new();
		for peer in &self.peers {
			check_ident(&peer.ident)?;
			if peer.ident == self.ident {
				return Err(Error::Config(format!(
					"peer identity '{}' collides with our own",
					peer.ident
				)));
			}
			if !seen.insert(peer.ident.clone()) {
				return Err(Error::Config(format!(
					"duplicate peer identity '{}'",
					peer.ident
				)));
			}
			if let DaemonMode::Connect = self.mode {
				if peer.addrs.is_empty() {
					return Err(Error::Config(format!(
						"peer '{}' has no addresses to connect to",
						peer.ident
					)));
				}
			}
		}
		if let DaemonMode::Listen { bind } = &self.mode {
			if bind.is_empty() {
				return Err(Error::Config(String::from("no bind addresses")));
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn base_config() -> TransferConfig {
		TransferConfig {
			ident: String::from("source1"),
			mode: DaemonMode::Connect,
			peers: vec![PeerConfig {
				ident: String::from("dest1"),
				addrs: vec!["127.0.0.1:9999".parse().unwrap()],
				filter: None,
				priority: Priority::Low,
			}],
			tls: None,
			keepalive_secs: 60,
		}
	}

	#[test]
	fn valid_config_passes() {
		base_config().validate().unwrap();
	}

	#[test]
	fn ident_rules() {
		assert!(check_ident("box-a_1").is_ok());
		assert!(check_ident("").is_err());
		assert!(check_ident("a/b").is_err());
		assert!(check_ident("a b").is_err());
		assert!(check_ident("tab\there").is_err());
	}

	#[test]
	fn duplicate_peers_rejected() {
		let mut config = base_config();
		config.peers.push(config.peers[0].clone());
		assert!(config.validate().is_err());
	}

	#[test]
	fn connect_mode_requires_addrs() {
		let mut config = base_config();
		config.peers[0].addrs.clear();
		assert!(config.validate().is_err());
	}

	#[test]
	fn own_ident_cannot_be_a_peer() {
		let mut config = base_config();
		config.peers[0].ident = config.ident.clone();
		assert!(config.validate().is_err());
	}
}
