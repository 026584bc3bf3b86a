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

//! Per-receiver output serialisation: many senders funnel into one
//! socket, one multi-frame message in flight at a time. Overflow turns
//! into truncation instead of blocking ingress, so one slow receiver
//! never stalls its chamber.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::connection::Connection;
use crate::frame::opcode;

/// One relayed frame: the message opcode, whether this frame continues a
/// message, and whether it ends one.
#[derive(Debug, Clone)]
pub struct FrameInfo {
  pub opcode: u8,
  pub data: Bytes,
  pub continuation: bool,
  pub fin: bool,
}

impl FrameInfo {
  /// A self-contained single-frame text message.
  pub fn text(data: impl Into<Bytes>) -> Self {
    Self {
      opcode: opcode::TEXT,
      data: data.into(),
      continuation: false,
      fin: true,
    }
  }
}

/// Fairness queue in front of one receiver's connection.
///
/// Frames from the active sender go straight to the socket; frames from
/// everyone else wait in arrival order. Callers must append each
/// sender's frames in that sender's frame order.
pub struct OutputQueue {
  conn: Connection,
  active_sender: Option<u64>,
  items: VecDeque<(u64, FrameInfo)>,
  queued_bytes: usize,
  max_items: usize,
  max_data: usize,
}

impl OutputQueue {
  pub fn new(conn: Connection, max_items: usize, max_data: usize) -> Self {
    Self {
      conn,
      active_sender: None,
      items: VecDeque::new(),
      queued_bytes: 0,
      max_items,
      max_data,
    }
  }

  pub fn connection(&self) -> &Connection {
    &self.conn
  }

  /// True when nothing is waiting behind the in-flight message.
  pub fn is_idle(&self) -> bool {
    self.items.is_empty()
  }

  /// Routes one frame from `sender`: sent immediately when `sender` owns
  /// the in-flight message (or nothing is in flight), queued otherwise.
  pub fn add_frame(&mut self, sender: u64, info: FrameInfo) {
    match self.active_sender {
      Some(active) if active != sender => {
        self.queued_bytes += info.data.len();
        self.items.push_back((sender, info));
        self.enforce_caps();
      }
      None if info.continuation => {
        // Tail of a message that was already aborted; drop it.
      }
      _ => {
        let fin = info.fin;
        self.active_sender = Some(sender);
        self.send(info);
        if fin {
          self.active_sender = None;
          self.drain();
        }
      }
    }
  }

  /// Drops all influence of `sender`: aborts its in-flight message or
  /// filters its queued frames.
  pub fn remove_sender(&mut self, sender: u64) {
    if self.active_sender == Some(sender) {
      self.abort_current();
    } else {
      let mut removed = 0;
      self.items.retain(|(from, info)| {
        if *from == sender {
          removed += info.data.len();
          false
        } else {
          true
        }
      });
      self.queued_bytes -= removed;
    }
  }

  /// Called when `sender` leaves. A dangling half-message (no `fin` in
  /// sight) is flushed with the truncation marker; a fully queued
  /// message is left to deliver normally.
  pub fn close_sender(&mut self, sender: u64) {
    let dangling = if self.active_sender == Some(sender) {
      !self
        .items
        .iter()
        .any(|(from, info)| *from == sender && info.fin)
    } else {
      match self.items.iter().rev().find(|(from, _)| *from == sender) {
        Some((_, info)) => !info.fin,
        None => false,
      }
    };
    if dangling {
      self.remove_sender(sender);
    }
  }

  /// Abandons the in-flight message: the receiver gets a zero-length
  /// closing continuation followed by a one-frame `"X"` text message,
  /// then queued traffic resumes.
  fn abort_current(&mut self) {
    self
      .conn
      .send_frame(opcode::CONTINUATION, Bytes::new(), true);
    self
      .conn
      .send_frame(opcode::TEXT, Bytes::from_static(b"X"), true);
    self.active_sender = None;
    self.drain();
  }

  fn send(&mut self, info: FrameInfo) {
    let opcode = if info.continuation {
      opcode::CONTINUATION
    } else {
      info.opcode
    };
    self.conn.send_frame(opcode, info.data, info.fin);
  }

  /// Walks the queue in arrival order adopting the first eligible
  /// sender; when an adopted message completes mid-walk, rewinds to the
  /// start so earlier arrivals from other senders go next.
  fn drain(&mut self) {
    'rewind: loop {
      if self.active_sender.is_some() {
        return;
      }
      let mut i = 0;
      while i < self.items.len() {
        let matches = match self.active_sender {
          None => true,
          Some(active) => self.items[i].0 == active,
        };
        if !matches {
          i += 1;
          continue;
        }
        let (sender, info) = self.items.remove(i).unwrap();
        self.queued_bytes -= info.data.len();
        if self.active_sender.is_none() && info.continuation {
          // Orphaned tail of an aborted message.
          continue;
        }
        let fin = info.fin;
        self.active_sender = Some(sender);
        self.send(info);
        if fin {
          self.active_sender = None;
          continue 'rewind;
        }
      }
      return;
    }
  }

  /// Caps are enforced after enqueue; each pass truncates the in-flight
  /// message and resumes the queue, which always shrinks it.
  fn enforce_caps(&mut self) {
    while self.items.len() > self.max_items || self.queued_bytes > self.max_data
    {
      self.abort_current();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connection::Connection;
  use crate::frame::Frame;
  use tokio::sync::mpsc::UnboundedReceiver;

  fn queue(max_items: usize, max_data: usize) -> (OutputQueue, UnboundedReceiver<Frame>) {
    let (conn, rx) = Connection::test_channel(7);
    (OutputQueue::new(conn, max_items, max_data), rx)
  }

  fn info(opcode: u8, data: &'static [u8], continuation: bool, fin: bool) -> FrameInfo {
    FrameInfo {
      opcode,
      data: Bytes::from_static(data),
      continuation,
      fin,
    }
  }

  fn sent(rx: &mut UnboundedReceiver<Frame>) -> Vec<(u8, Vec<u8>, bool)> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
      out.push((frame.opcode, frame.payload.to_vec(), frame.fin));
    }
    out
  }

  #[test]
  fn single_sender_passes_through_in_order() {
    let (mut q, mut rx) = queue(16, 1024);
    q.add_frame(1, info(opcode::TEXT, b"a", false, false));
    q.add_frame(1, info(opcode::TEXT, b"b", true, false));
    q.add_frame(1, info(opcode::TEXT, b"c", true, true));
    assert_eq!(
      sent(&mut rx),
      [
        (opcode::TEXT, b"a".to_vec(), false),
        (opcode::CONTINUATION, b"b".to_vec(), false),
        (opcode::CONTINUATION, b"c".to_vec(), true),
      ]
    );
    assert!(q.is_idle());
  }

  #[test]
  fn other_senders_wait_for_fin() {
    let (mut q, mut rx) = queue(16, 1024);
    q.add_frame(1, info(opcode::TEXT, b"1a", false, false));
    q.add_frame(2, info(opcode::TEXT, b"2a", false, true));
    q.add_frame(1, info(opcode::TEXT, b"1b", true, true));
    assert_eq!(
      sent(&mut rx),
      [
        (opcode::TEXT, b"1a".to_vec(), false),
        (opcode::CONTINUATION, b"1b".to_vec(), true),
        (opcode::TEXT, b"2a".to_vec(), true),
      ]
    );
  }

  #[test]
  fn per_sender_order_is_preserved_for_mixed_senders() {
    let (mut q, mut rx) = queue(16, 1024);
    q.add_frame(1, info(opcode::TEXT, b"1a", false, false));
    q.add_frame(2, info(opcode::TEXT, b"2a", false, false));
    q.add_frame(3, info(opcode::BINARY, b"3a", false, true));
    q.add_frame(2, info(opcode::TEXT, b"2b", true, true));
    q.add_frame(1, info(opcode::TEXT, b"1b", true, true));
    let frames = sent(&mut rx);
    // Sender 1 flows straight through; 2 queued before 3, and its two
    // frames stay contiguous; 3 follows.
    assert_eq!(
      frames,
      [
        (opcode::TEXT, b"1a".to_vec(), false),
        (opcode::CONTINUATION, b"1b".to_vec(), true),
        (opcode::TEXT, b"2a".to_vec(), false),
        (opcode::CONTINUATION, b"2b".to_vec(), true),
        (opcode::BINARY, b"3a".to_vec(), true),
      ]
    );
  }

  #[test]
  fn rewind_lets_earlier_arrivals_go_first() {
    let (mut q, mut rx) = queue(16, 1024);
    q.add_frame(1, info(opcode::TEXT, b"1a", false, false));
    q.add_frame(2, info(opcode::TEXT, b"2a", false, true));
    q.add_frame(3, info(opcode::TEXT, b"3a", false, true));
    q.add_frame(1, info(opcode::TEXT, b"1b", true, true));
    let frames = sent(&mut rx);
    let payloads: Vec<&[u8]> =
      frames.iter().map(|(_, p, _)| p.as_slice()).collect();
    assert_eq!(payloads, [b"1a" as &[u8], b"1b", b"2a", b"3a"]);
  }

  #[test]
  fn dangling_continuation_is_discarded() {
    let (mut q, mut rx) = queue(16, 1024);
    q.add_frame(1, info(opcode::TEXT, b"tail", true, true));
    assert!(sent(&mut rx).is_empty());
  }

  #[test]
  fn overflow_truncates_with_marker() {
    let (mut q, mut rx) = queue(16, 8);
    q.add_frame(1, info(opcode::TEXT, b"start", false, false));
    q.add_frame(2, info(opcode::TEXT, b"0123456789", false, true));
    let frames = sent(&mut rx);
    assert_eq!(
      frames,
      [
        (opcode::TEXT, b"start".to_vec(), false),
        // Truncation marker: empty closing continuation, then "X".
        (opcode::CONTINUATION, Vec::new(), true),
        (opcode::TEXT, b"X".to_vec(), true),
        // The overflowing message itself still goes out.
        (opcode::TEXT, b"0123456789".to_vec(), true),
      ]
    );
    // Later continuations from the aborted sender disappear.
    q.add_frame(1, info(opcode::TEXT, b"late", true, true));
    assert!(sent(&mut rx).is_empty());
    // A fresh message from the same sender flows again.
    q.add_frame(1, info(opcode::TEXT, b"fresh", false, true));
    assert_eq!(sent(&mut rx), [(opcode::TEXT, b"fresh".to_vec(), true)]);
  }

  #[test]
  fn zero_caps_truncate_any_queueing() {
    let (mut q, mut rx) = queue(0, 0);
    q.add_frame(1, info(opcode::TEXT, b"one", false, false));
    q.add_frame(2, info(opcode::TEXT, b"two", false, true));
    let frames = sent(&mut rx);
    assert_eq!(
      frames,
      [
        (opcode::TEXT, b"one".to_vec(), false),
        (opcode::CONTINUATION, Vec::new(), true),
        (opcode::TEXT, b"X".to_vec(), true),
        (opcode::TEXT, b"two".to_vec(), true),
      ]
    );
  }

  #[test]
  fn close_sender_flushes_dangling_half_message() {
    let (mut q, mut rx) = queue(16, 1024);
    q.add_frame(1, info(opcode::TEXT, b"half", false, false));
    q.close_sender(1);
    let frames = sent(&mut rx);
    assert_eq!(
      frames,
      [
        (opcode::TEXT, b"half".to_vec(), false),
        (opcode::CONTINUATION, Vec::new(), true),
        (opcode::TEXT, b"X".to_vec(), true),
      ]
    );
  }

  #[test]
  fn close_sender_keeps_complete_queued_messages() {
    let (mut q, mut rx) = queue(16, 1024);
    q.add_frame(1, info(opcode::TEXT, b"busy", false, false));
    q.add_frame(2, info(opcode::TEXT, b"whole", false, true));
    q.close_sender(2);
    // Sender 2's finished message survives and flushes once 1 fins.
    q.add_frame(1, info(opcode::TEXT, b"done", true, true));
    let payloads: Vec<Vec<u8>> =
      sent(&mut rx).into_iter().map(|(_, p, _)| p).collect();
    assert_eq!(payloads, [b"busy".to_vec(), b"done".to_vec(), b"whole".to_vec()]);
  }

  #[test]
  fn remove_sender_filters_queued_frames() {
    let (mut q, mut rx) = queue(16, 1024);
    q.add_frame(1, info(opcode::TEXT, b"busy", false, false));
    q.add_frame(2, info(opcode::TEXT, b"gone", false, true));
    q.remove_sender(2);
    q.add_frame(1, info(opcode::TEXT, b"done", true, true));
    let payloads: Vec<Vec<u8>> =
      sent(&mut rx).into_iter().map(|(_, p, _)| p).collect();
    assert_eq!(payloads, [b"busy".to_vec(), b"done".to_vec()]);
  }
}
