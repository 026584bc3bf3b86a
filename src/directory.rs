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

//! URL routing for chambers: one directory owns every chamber under a
//! base URL prefix, creates them on first accept, and evicts them when
//! the last peer leaves.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use log::debug;
use log::warn;

use crate::chamber::Chamber;
use crate::close;
use crate::connection::Connection;
use crate::connection::Handler;
use crate::connection::HandlerMatch;
use crate::connection::MessagePart;
use crate::connection::Reject;
use crate::connection::SocketEvents;
use crate::error::HandshakeError;
use crate::handshake::Headers;

/// The only subprotocol this relay negotiates.
pub const PROTOCOL: &str = "echo";

/// Tunable capacity bundle carried by each directory and inherited by
/// its chambers and queues.
#[derive(Debug, Clone)]
pub struct RelayLimits {
  pub max_chambers: usize,
  pub max_connections: usize,
  pub max_queue_items: usize,
  pub max_queue_data: usize,
  pub max_header_length: usize,
}

impl RelayLimits {
  pub const fn open() -> Self {
    Self {
      max_chambers: 512,
      max_connections: 64,
      max_queue_items: 1024,
      max_queue_data: 1 << 20,
      max_header_length: 1024,
    }
  }

  /// The two-peer chamber family. With one possible counterpart there is
  /// never a reason to queue behind another sender, so both queue caps
  /// are zero and any cross-sender overlap truncates.
  pub const fn paired() -> Self {
    Self {
      max_connections: 2,
      max_queue_items: 0,
      max_queue_data: 0,
      ..Self::open()
    }
  }
}

impl Default for RelayLimits {
  fn default() -> Self {
    Self::open()
  }
}

/// Maps URLs under a base prefix to chambers.
pub struct ChamberDirectory {
  base_url: String,
  permitted_origins: Vec<String>,
  limits: RelayLimits,
  chambers: Mutex<HashMap<String, Arc<Mutex<Chamber>>>>,
  me: Weak<ChamberDirectory>,
}

impl ChamberDirectory {
  /// `permitted_origins` empty means any origin is allowed.
  pub fn new(
    base_url: impl Into<String>,
    permitted_origins: Vec<String>,
    limits: RelayLimits,
  ) -> Arc<Self> {
    Arc::new_cyclic(|me| Self {
      base_url: base_url.into(),
      permitted_origins,
      limits,
      chambers: Mutex::new(HashMap::new()),
      me: me.clone(),
    })
  }

  pub fn chamber_count(&self) -> usize {
    self.chambers.lock().unwrap().len()
  }

  fn accept(
    self: Arc<Self>,
    url: String,
    conn: Connection,
  ) -> Result<Box<dyn SocketEvents>, Reject> {
    loop {
      let entry = {
        let mut chambers = self.chambers.lock().unwrap();
        match chambers.get(&url) {
          Some(found) => found.clone(),
          None => {
            if chambers.len() >= self.limits.max_chambers {
              return Err(Reject {
                code: close::TRY_AGAIN_LATER,
                reason: "Too many chambers".to_string(),
              });
            }
            let created =
              Arc::new(Mutex::new(Chamber::new(url.clone(), self.limits.clone())));
            chambers.insert(url.clone(), created.clone());
            debug!("chamber {url} created");
            created
          }
        }
      };
      let peer_id = {
        let mut chamber = entry.lock().unwrap();
        if chamber.is_defunct() {
          // Lost the race against eviction; look the URL up again.
          drop(chamber);
          self.evict(&url, &entry);
          continue;
        }
        chamber.add(conn.clone())?
      };
      return Ok(Box::new(ChamberPeer {
        directory: self,
        chamber: entry,
        url,
        peer_id,
      }));
    }
  }

  /// Removes the directory entry for an emptied chamber. Compared by
  /// pointer so a newer chamber under the same URL is left alone.
  fn evict(&self, url: &str, chamber: &Arc<Mutex<Chamber>>) {
    let mut chambers = self.chambers.lock().unwrap();
    if let Some(found) = chambers.get(url) {
      if Arc::ptr_eq(found, chamber) {
        chambers.remove(url);
        debug!("chamber {url} evicted");
      }
    }
  }
}

impl Handler for ChamberDirectory {
  fn test(
    &self,
    url: &str,
    headers: &Headers,
    protocols: &[String],
  ) -> Result<Option<HandlerMatch>, HandshakeError> {
    if !protocols.iter().any(|p| p == PROTOCOL) {
      return Ok(None);
    }
    if !url.starts_with(&self.base_url) {
      return Ok(None);
    }
    if !self.permitted_origins.is_empty() {
      let origin = headers.get("Origin").unwrap_or_default();
      if !self.permitted_origins.iter().any(|o| o == origin) {
        return Err(HandshakeError::OriginNotPermitted(origin.to_string()));
      }
    }
    let Some(directory) = self.me.upgrade() else {
      return Err(HandshakeError::Internal);
    };
    let url = url.to_string();
    Ok(Some(HandlerMatch {
      protocol: PROTOCOL.to_string(),
      acceptor: Box::new(move |conn| directory.accept(url, conn)),
    }))
  }
}

/// Bridges one upgraded connection's events into its chamber, and
/// evicts the chamber's directory entry when the last peer leaves.
struct ChamberPeer {
  directory: Arc<ChamberDirectory>,
  chamber: Arc<Mutex<Chamber>>,
  url: String,
  peer_id: u64,
}

impl SocketEvents for ChamberPeer {
  fn on_message_start(&mut self, _opcode: u8) {
    self.chamber.lock().unwrap().message_start(self.peer_id);
  }

  fn on_message_part(&mut self, part: MessagePart<'_>) {
    self.chamber.lock().unwrap().message_part(self.peer_id, part);
  }

  fn on_error(&mut self, code: u16, message: &str) {
    warn!(
      "peer {} in {}: error {} {}",
      self.peer_id, self.url, code, message
    );
  }

  fn on_close(&mut self) {
    let emptied = self.chamber.lock().unwrap().remove(self.peer_id);
    if emptied {
      self.directory.evict(&self.url, &self.chamber);
    }
  }
}
