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

//! One multicast group: the peers joined to a single URL, the inbound
//! target-header protocol, and the join/leave notification fan-out.
//!
//! Inbound messages open with an optional header segment terminated by
//! `'\n'`: colon-separated items, of which only `T`-items are read as
//! target selectors. Outbound traffic is tagged with single-letter
//! metadata items (`I` own id, `H` joined, `B` left, `F` sender of the
//! following body, `X` truncation).

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use log::debug;
use rand::seq::SliceRandom;

use crate::buffer::OnDemandBuffer;
use crate::close;
use crate::connection::Connection;
use crate::connection::MessagePart;
use crate::connection::Reject;
use crate::directory::RelayLimits;
use crate::queue::FrameInfo;
use crate::queue::OutputQueue;

/// Peers younger than this count as "new" for target selection.
const ESTABLISHED_AFTER: Duration = Duration::from_secs(30);

struct PeerRecord {
  queue: OutputQueue,
  joined_at: Instant,
  header: OnDemandBuffer,
  /// Length of the parsed header segment; 0 while assembling.
  header_len: usize,
  targets: Vec<u64>,
}

/// Target selector parsed out of a message's header segment.
#[derive(Debug, Default)]
struct TargetHeader {
  explicit: Vec<u64>,
  /// Any target token appeared, parsable or not. A garbage-only list
  /// addresses nobody rather than falling back to broadcast.
  listed: bool,
  /// `"*"`: add one server-chosen peer.
  one_more: bool,
  /// `"**"`: everyone including the sender.
  everyone: bool,
  /// Header bytes including the terminating newline.
  consumed: usize,
}

fn parse_target_header(buf: &[u8]) -> Option<TargetHeader> {
  let newline = buf.iter().position(|&b| b == b'\n')?;
  let mut header = TargetHeader {
    consumed: newline + 1,
    ..Default::default()
  };
  for item in buf[..newline].split(|&b| b == b':') {
    let Some((&b'T', rest)) = item.split_first() else {
      continue;
    };
    for token in rest.split(|&b| b == b',') {
      match token {
        b"**" => header.everyone = true,
        b"*" => header.one_more = true,
        _ => {
          header.listed = true;
          if let Some(id) =
            std::str::from_utf8(token).ok().and_then(|t| t.parse().ok())
          {
            header.explicit.push(id);
          }
        }
      }
    }
  }
  Some(header)
}

/// The peers subscribed to one URL.
pub struct Chamber {
  url: String,
  limits: RelayLimits,
  next_id: u64,
  peers: BTreeMap<u64, PeerRecord>,
  defunct: bool,
}

impl Chamber {
  pub fn new(url: impl Into<String>, limits: RelayLimits) -> Self {
    Self {
      url: url.into(),
      limits,
      next_id: 0,
      peers: BTreeMap::new(),
      defunct: false,
    }
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  pub fn len(&self) -> usize {
    self.peers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.peers.is_empty()
  }

  /// Set once the last peer leaves; a defunct chamber never accepts
  /// again, so an evicted directory entry cannot be resurrected.
  pub fn is_defunct(&self) -> bool {
    self.defunct
  }

  /// Admits a connection: existing peers hear `H<id>`, the joiner gets
  /// its welcome (`I<id>` plus one `H` item per present peer).
  pub fn add(&mut self, conn: Connection) -> Result<u64, Reject> {
    if self.peers.len() >= self.limits.max_connections {
      return Err(Reject {
        code: close::TRY_AGAIN_LATER,
        reason: "Chamber is full".to_string(),
      });
    }
    let id = self.next_id;
    self.next_id += 1;

    let hello = format!("H{id}");
    for peer in self.peers.values_mut() {
      peer.queue.add_frame(id, FrameInfo::text(hello.clone()));
    }
    let mut welcome = format!("I{id}");
    for present in self.peers.keys() {
      welcome.push_str(&format!(":H{present}"));
    }

    let mut record = PeerRecord {
      queue: OutputQueue::new(
        conn,
        self.limits.max_queue_items,
        self.limits.max_queue_data,
      ),
      joined_at: Instant::now(),
      header: OnDemandBuffer::new(self.limits.max_header_length),
      header_len: 0,
      targets: Vec::new(),
    };
    record.queue.add_frame(id, FrameInfo::text(welcome));
    self.peers.insert(id, record);
    debug!(
      "chamber {}: peer {} joined, {} present",
      self.url,
      id,
      self.peers.len()
    );
    Ok(id)
  }

  /// Removes a peer: dangling half-messages are flushed with the
  /// truncation marker, then everyone remaining hears `B<id>`. Returns
  /// true when the chamber emptied (and became defunct).
  pub fn remove(&mut self, id: u64) -> bool {
    if self.peers.remove(&id).is_none() {
      return false;
    }
    let bye = format!("B{id}");
    for peer in self.peers.values_mut() {
      peer.queue.close_sender(id);
      peer.queue.add_frame(id, FrameInfo::text(bye.clone()));
    }
    debug!(
      "chamber {}: peer {} left, {} remain",
      self.url,
      id,
      self.peers.len()
    );
    if self.peers.is_empty() {
      self.defunct = true;
      true
    } else {
      false
    }
  }

  /// A new inbound message begins: header assembly starts over.
  pub fn message_start(&mut self, id: u64) {
    if let Some(peer) = self.peers.get_mut(&id) {
      peer.header.clear();
      peer.header_len = 0;
      peer.targets.clear();
    }
  }

  /// Routes one inbound chunk: header bytes assemble until the newline,
  /// everything after streams to the resolved targets as continuations.
  pub fn message_part(&mut self, sender: u64, part: MessagePart<'_>) {
    enum Route {
      Overflow,
      Assembling,
      Opened { header: TargetHeader, buffered: usize },
      Body,
    }

    let route = match self.peers.get_mut(&sender) {
      None => return,
      Some(peer) if peer.header_len > 0 => Route::Body,
      Some(peer) => {
        match peer.header.add_and_test(part.data, parse_target_header) {
          Err(_) => Route::Overflow,
          Ok(None) => Route::Assembling,
          Ok(Some((header, buffered))) => Route::Opened { header, buffered },
        }
      }
    };

    match route {
      Route::Overflow => {
        if let Some(peer) = self.peers.get(&sender) {
          peer
            .queue
            .connection()
            .close(close::HEADER_TOO_LARGE, "Header too large");
        }
        return;
      }
      Route::Assembling => {}
      Route::Opened { header, buffered } => {
        let targets = self.resolve_targets(sender, &header);
        let meta = Bytes::from(format!("F{sender}\n"));
        for &target in &targets {
          if let Some(peer) = self.peers.get_mut(&target) {
            peer.queue.add_frame(
              sender,
              FrameInfo {
                opcode: part.opcode,
                data: meta.clone(),
                continuation: false,
                fin: false,
              },
            );
          }
        }
        let body = Bytes::copy_from_slice(&part.data[header.consumed - buffered..]);
        for &target in &targets {
          if let Some(peer) = self.peers.get_mut(&target) {
            peer.queue.add_frame(
              sender,
              FrameInfo {
                opcode: part.opcode,
                data: body.clone(),
                continuation: true,
                fin: part.fin,
              },
            );
          }
        }
        if let Some(peer) = self.peers.get_mut(&sender) {
          peer.header_len = header.consumed;
          peer.targets = targets;
        }
      }
      Route::Body => {
        let targets = self
          .peers
          .get(&sender)
          .map(|peer| peer.targets.clone())
          .unwrap_or_default();
        let body = Bytes::copy_from_slice(part.data);
        for &target in &targets {
          if let Some(peer) = self.peers.get_mut(&target) {
            peer.queue.add_frame(
              sender,
              FrameInfo {
                opcode: part.opcode,
                data: body.clone(),
                continuation: true,
                fin: part.fin,
              },
            );
          }
        }
      }
    }

    if part.fin {
      if let Some(peer) = self.peers.get_mut(&sender) {
        peer.header_len = 0;
        peer.header.clear();
        peer.targets.clear();
      }
    }
  }

  fn resolve_targets(&self, sender: u64, header: &TargetHeader) -> Vec<u64> {
    if header.everyone {
      return self.peers.keys().copied().collect();
    }
    let mut set: BTreeSet<u64> = header
      .explicit
      .iter()
      .copied()
      .filter(|id| self.peers.contains_key(id))
      .collect();
    if header.one_more {
      let mut exclude = set.clone();
      if !header.explicit.contains(&sender) {
        exclude.insert(sender);
      }
      if let Some(pick) = self.pick_one_target(&exclude) {
        set.insert(pick);
      }
    } else if set.is_empty() && !header.listed {
      return self
        .peers
        .keys()
        .copied()
        .filter(|&id| id != sender)
        .collect();
    }
    set.into_iter().collect()
  }

  /// Picks one recipient: shuffle to break ties uniformly, then prefer
  /// established peers, then unqueued ones, then peers not mid-message.
  fn pick_one_target(&self, exclude: &BTreeSet<u64>) -> Option<u64> {
    let mut candidates: Vec<(u64, &PeerRecord)> = self
      .peers
      .iter()
      .filter(|(id, _)| !exclude.contains(id))
      .map(|(&id, peer)| (id, peer))
      .collect();
    candidates.shuffle(&mut rand::thread_rng());
    candidates.sort_by_key(|(_, peer)| {
      (
        peer.joined_at.elapsed() < ESTABLISHED_AFTER,
        !peer.queue.is_idle(),
        peer.header_len > 0,
      )
    });
    candidates.first().map(|(id, _)| *id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connection::Connection;
  use crate::frame::opcode;
  use crate::frame::Frame;
  use tokio::sync::mpsc::UnboundedReceiver;

  fn part(data: &[u8], fin: bool) -> MessagePart<'_> {
    MessagePart {
      data,
      opcode: opcode::TEXT,
      continuation: false,
      fin,
    }
  }

  fn texts(rx: &mut UnboundedReceiver<Frame>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
      out.push(String::from_utf8(frame.payload.to_vec()).unwrap());
    }
    out
  }

  /// Reassembles frames into logical messages (split on fin).
  fn messages(rx: &mut UnboundedReceiver<Frame>) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    while let Ok(frame) = rx.try_recv() {
      assert_ne!(frame.opcode, opcode::CLOSE);
      current.push_str(&String::from_utf8(frame.payload.to_vec()).unwrap());
      if frame.fin {
        out.push(std::mem::take(&mut current));
      }
    }
    assert!(current.is_empty(), "unterminated message {current:?}");
    out
  }

  fn chamber_with(
    count: usize,
  ) -> (Chamber, Vec<UnboundedReceiver<Frame>>) {
    let mut chamber = Chamber::new("/room", RelayLimits::open());
    let mut rxs: Vec<UnboundedReceiver<Frame>> = Vec::new();
    for i in 0..count {
      let (conn, mut rx) = Connection::test_channel(i as u64);
      chamber.add(conn).unwrap();
      // Swallow the join chatter so tests start clean.
      while rx.try_recv().is_ok() {}
      for earlier in rxs.iter_mut() {
        while earlier.try_recv().is_ok() {}
      }
      rxs.push(rx);
    }
    (chamber, rxs)
  }

  #[test]
  fn join_notifications() {
    let mut chamber = Chamber::new("/room", RelayLimits::open());
    let (conn_a, mut rx_a) = Connection::test_channel(0);
    chamber.add(conn_a).unwrap();
    assert_eq!(texts(&mut rx_a), ["I0"]);

    let (conn_b, mut rx_b) = Connection::test_channel(1);
    chamber.add(conn_b).unwrap();
    assert_eq!(texts(&mut rx_a), ["H1"]);
    assert_eq!(texts(&mut rx_b), ["I1:H0"]);
  }

  #[test]
  fn admission_cap() {
    let limits = RelayLimits {
      max_connections: 2,
      ..RelayLimits::open()
    };
    let mut chamber = Chamber::new("/room", limits);
    for i in 0..2 {
      let (conn, _rx) = Connection::test_channel(i);
      chamber.add(conn).unwrap();
    }
    let (conn, _rx) = Connection::test_channel(9);
    let reject = chamber.add(conn).unwrap_err();
    assert_eq!(reject.code, close::TRY_AGAIN_LATER);
    assert_eq!(reject.reason, "Chamber is full");
  }

  #[test]
  fn ids_are_not_reused() {
    let mut chamber = Chamber::new("/room", RelayLimits::open());
    let (conn, _rx) = Connection::test_channel(0);
    chamber.add(conn).unwrap();
    chamber.remove(0);
    let (conn, mut rx) = Connection::test_channel(1);
    chamber.add(conn).unwrap();
    assert_eq!(texts(&mut rx), ["I1"]);
  }

  #[test]
  fn default_broadcast_excludes_sender() {
    let (mut chamber, mut rxs) = chamber_with(3);
    chamber.message_start(0);
    chamber.message_part(0, part(b"\nhello", true));
    assert!(messages(&mut rxs[0]).is_empty());
    assert_eq!(messages(&mut rxs[1]), ["F0\nhello"]);
    assert_eq!(messages(&mut rxs[2]), ["F0\nhello"]);
  }

  #[test]
  fn targeted_unicast() {
    let (mut chamber, mut rxs) = chamber_with(3);
    chamber.message_start(0);
    chamber.message_part(0, part(b"T2\nhi", true));
    assert!(messages(&mut rxs[0]).is_empty());
    assert!(messages(&mut rxs[1]).is_empty());
    assert_eq!(messages(&mut rxs[2]), ["F0\nhi"]);
  }

  #[test]
  fn broadcast_with_self() {
    let (mut chamber, mut rxs) = chamber_with(3);
    chamber.message_start(0);
    chamber.message_part(0, part(b"T**\nhi", true));
    for rx in rxs.iter_mut() {
      assert_eq!(messages(rx), ["F0\nhi"]);
    }
  }

  #[test]
  fn self_target_must_be_explicit() {
    let (mut chamber, mut rxs) = chamber_with(2);
    chamber.message_start(0);
    chamber.message_part(0, part(b"T0\nme", true));
    assert_eq!(messages(&mut rxs[0]), ["F0\nme"]);
    assert!(messages(&mut rxs[1]).is_empty());
  }

  #[test]
  fn unknown_targets_reach_nobody() {
    let (mut chamber, mut rxs) = chamber_with(2);
    chamber.message_start(0);
    chamber.message_part(0, part(b"T9\nlost", true));
    assert!(messages(&mut rxs[0]).is_empty());
    assert!(messages(&mut rxs[1]).is_empty());
    // Unparsable tokens address nobody rather than everybody.
    chamber.message_start(0);
    chamber.message_part(0, part(b"Tbogus\nlost", true));
    assert!(messages(&mut rxs[1]).is_empty());
  }

  #[test]
  fn star_adds_exactly_one_target() {
    let (mut chamber, mut rxs) = chamber_with(4);
    chamber.message_start(0);
    chamber.message_part(0, part(b"T*\nping", true));
    assert!(messages(&mut rxs[0]).is_empty(), "sender excluded");
    let delivered: usize = rxs
      .iter_mut()
      .skip(1)
      .map(|rx| messages(rx).len())
      .sum();
    assert_eq!(delivered, 1);
  }

  #[test]
  fn star_prefers_established_idle_peers() {
    let (mut chamber, mut rxs) = chamber_with(3);
    // Peer 1 is long-established; peer 2 is fresh.
    chamber.peers.get_mut(&1).unwrap().joined_at =
      Instant::now() - Duration::from_secs(120);
    chamber.message_start(0);
    chamber.message_part(0, part(b"T*\nping", true));
    assert_eq!(messages(&mut rxs[1]), ["F0\nping"]);
    assert!(messages(&mut rxs[2]).is_empty());
  }

  #[test]
  fn star_deprioritises_peers_mid_message() {
    let (mut chamber, mut rxs) = chamber_with(3);
    for id in [1, 2] {
      chamber.peers.get_mut(&id).unwrap().joined_at =
        Instant::now() - Duration::from_secs(120);
    }
    // Peer 2 is mid-way through an inbound message: its header parsed
    // (to a target that does not exist) but the body has not finished.
    chamber.message_start(2);
    chamber.message_part(2, part(b"T9\npending", false));
    chamber.message_start(0);
    chamber.message_part(0, part(b"T*\nping", true));
    assert_eq!(messages(&mut rxs[1]), ["F0\nping"]);
  }

  #[test]
  fn header_split_across_frames() {
    let (mut chamber, mut rxs) = chamber_with(3);
    chamber.message_start(0);
    chamber.message_part(0, part(b"T2", false));
    assert!(messages(&mut rxs[2]).is_empty());
    let tail = MessagePart {
      data: b"\nhi",
      opcode: opcode::TEXT,
      continuation: true,
      fin: true,
    };
    chamber.message_part(0, tail);
    assert_eq!(messages(&mut rxs[2]), ["F0\nhi"]);
    assert!(messages(&mut rxs[1]).is_empty());
  }

  #[test]
  fn body_streams_to_chosen_targets() {
    let (mut chamber, mut rxs) = chamber_with(3);
    chamber.message_start(0);
    chamber.message_part(0, part(b"T1\nfirst ", false));
    let tail = MessagePart {
      data: b"second",
      opcode: opcode::TEXT,
      continuation: true,
      fin: true,
    };
    chamber.message_part(0, tail);
    assert_eq!(messages(&mut rxs[1]), ["F0\nfirst second"]);
    assert!(messages(&mut rxs[2]).is_empty());
  }

  #[test]
  fn header_overflow_closes_with_4000() {
    let limits = RelayLimits {
      max_header_length: 8,
      ..RelayLimits::open()
    };
    let mut chamber = Chamber::new("/room", limits);
    let (conn, mut rx) = Connection::test_channel(0);
    chamber.add(conn).unwrap();
    while rx.try_recv().is_ok() {}

    chamber.message_start(0);
    chamber.message_part(0, part(b"T0,1,2,3,4,5", false));
    let frame = rx.try_recv().unwrap();
    assert_eq!(frame.opcode, opcode::CLOSE);
    assert_eq!(&frame.payload[..2], close::HEADER_TOO_LARGE.to_be_bytes());
    assert_eq!(&frame.payload[2..], b"Header too large");
  }

  #[test]
  fn leave_notifies_and_flushes_half_messages() {
    let (mut chamber, mut rxs) = chamber_with(3);
    chamber.message_start(0);
    chamber.message_part(0, part(b"\nhalf", false));
    assert!(!chamber.remove(0));
    // Peer 1 saw the prefix, the truncation marker, then the goodbye.
    assert_eq!(messages(&mut rxs[1]), ["F0\nhalf", "X", "B0"]);
    assert_eq!(messages(&mut rxs[2]), ["F0\nhalf", "X", "B0"]);
  }

  #[test]
  fn last_leave_marks_defunct() {
    let mut chamber = Chamber::new("/room", RelayLimits::open());
    let (conn, _rx) = Connection::test_channel(0);
    chamber.add(conn).unwrap();
    assert!(chamber.remove(0));
    assert!(chamber.is_defunct());
  }
}
