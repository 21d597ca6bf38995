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

//! Reliable file transfer between a sender daemon and one or more
//! receiver daemons, over courier message queues.
//!
//! A sender pops queued files off per-peer priority queues and streams
//! them as block messages; a receiver writes each file into a hidden
//! placeholder and renames it into place once complete. Both sides
//! verify identity, negotiate a protocol version, suppress duplicates
//! and clean up after partial transfers.

#[macro_use]
extern crate enum_primitive;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

pub mod config;
pub mod disposition;
mod error;
pub mod peers;
pub mod proto;
pub mod receiver;
pub mod sender;
mod session;

pub use crate::config::{DaemonMode, PeerConfig, Priority, TlsPaths, TransferConfig};
pub use crate::disposition::Dispositions;
pub use crate::error::{Error, Result};
pub use crate::peers::{OutgoingFile, Peer, Transfers};
pub use crate::receiver::{ReceiverConfig, ReceiverDaemon, DEFAULT_MAX_OPEN_FILES};
pub use crate::sender::{SenderConfig, SenderDaemon, DEFAULT_BLOCK_SIZE};
