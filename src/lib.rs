// Copyright 2023 Divy Srivastava <dj.srivastava23@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! _chambercast_ is a self-contained WebSocket relay server.
//!
//! Peers join URL-identified "chambers" over a plain RFC 6455 upgrade
//! (subprotocol `echo`) and every message is relayed to the chamber,
//! tagged with the sender's id. Messages may open with a `T` header item
//! to narrow the target set; peers additionally hear join (`H`), leave
//! (`B`) and truncation (`X`) notifications.
//!
//! The wire endpoint is built directly on TCP: a zero-copy frame parser,
//! a hand-rolled upgrade handshake, and a per-receiver output queue that
//! keeps each sender's multi-frame messages contiguous and truncates
//! instead of buffering without bound.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use chambercast::{ChamberDirectory, Handler, Listener, RelayLimits};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!   let handlers: Vec<Arc<dyn Handler>> = vec![
//!     ChamberDirectory::new("/", Vec::new(), RelayLimits::open()),
//!   ];
//!   let listener = Listener::bind(("0.0.0.0", 8080), handlers).await?;
//!   listener.run(std::future::pending()).await
//! }
//! ```

mod buffer;
mod chamber;
pub mod close;
mod connection;
mod directory;
mod error;
mod frame;
mod handshake;
mod listener;
mod mask;
mod queue;

pub use crate::buffer::OnDemandBuffer;
pub use crate::buffer::PooledBuffer;
pub use crate::chamber::Chamber;
pub use crate::connection::Acceptor;
pub use crate::connection::Connection;
pub use crate::connection::ConnectionDriver;
pub use crate::connection::Handler;
pub use crate::connection::HandlerMatch;
pub use crate::connection::MessagePart;
pub use crate::connection::Reject;
pub use crate::connection::SocketEvents;
pub use crate::directory::ChamberDirectory;
pub use crate::directory::RelayLimits;
pub use crate::directory::PROTOCOL;
pub use crate::error::HandshakeError;
pub use crate::error::WebSocketError;
pub use crate::frame::opcode;
pub use crate::frame::Frame;
pub use crate::frame::FrameHead;
pub use crate::handshake::Headers;
pub use crate::listener::Listener;
pub use crate::mask::unmask;
pub use crate::queue::FrameInfo;
pub use crate::queue::OutputQueue;
