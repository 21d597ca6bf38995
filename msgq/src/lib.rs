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

//! Channelized message queues over TCP and TLS.
//!
//! A message queue multiplexes many logical channels over single
//! connections. Each connection runs a reader and a writer thread;
//! a listener thread accepts inbound connections; user code talks to
//! the [`MsgQueue`] facade. Channels can be split onto derived queue
//! handles so a receiver blocks only on the traffic it cares about.

#[macro_use]
extern crate log;

mod channel;
mod conn;
mod deque;
mod error;
mod intmap;
mod listener;
mod message;
mod multiqueue;
mod netio;
mod queue;
mod tls;

pub use crate::conn::DEFAULT_STAGNANT_TIMEOUT;
pub use crate::deque::Deque;
pub use crate::error::{Error, Result};
pub use crate::intmap::IntMap;
pub use crate::message::{
	channel_payload, decode_channel_payload, Msg, MsgHdr, CHANNEL_CONTROL, CTL_CHANNEL_DIED,
	CTL_NEW_CONNECTION, MAX_PAYLOAD, MIN_SYSTEM_TYPE, MSG_HDR_LEN,
};
pub use crate::multiqueue::{MqFunction, Multiqueue, Subqueue};
pub use crate::queue::MsgQueue;
pub use crate::tls::{load_certs, load_private_key, TlsCreds};
