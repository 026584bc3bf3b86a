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

//! One TCP peer: the upgrade handshake, the post-upgrade frame state
//! machine, and the writer task that serialises outbound frames.
//!
//! The connection splits into a cloneable [`Connection`] handle (held by
//! chambers and queues, all sends are non-blocking channel pushes) and a
//! [`ConnectionDriver`] that owns the socket and runs to completion.

use std::ops::ControlFlow;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use bytes::BytesMut;
use log::debug;
use log::warn;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::buffer::OnDemandBuffer;
use crate::close;
use crate::error::HandshakeError;
use crate::error::WebSocketError;
use crate::frame;
use crate::frame::opcode;
use crate::frame::Frame;
use crate::frame::FrameHead;
use crate::handshake;
use crate::handshake::HandshakeMachine;
use crate::handshake::Headers;
use crate::mask;

const READ_CHUNK: usize = 8192;
/// Payloads up to this size are coalesced with the header into a single
/// write; larger payloads are written separately to skip the copy.
const COALESCE_THRESHOLD: usize = 1024;
/// Control frame payloads are capped by RFC 6455.
const CONTROL_PAYLOAD_MAX: usize = 125;

/// One chunk of a data message, delivered as it is read off the wire.
///
/// `opcode` is the message's opcode (the last non-continuation opcode),
/// `continuation` marks frames after the first, and `fin` marks the last
/// chunk of the last frame.
#[derive(Debug, Clone, Copy)]
pub struct MessagePart<'a> {
  pub data: &'a [u8],
  pub opcode: u8,
  pub continuation: bool,
  pub fin: bool,
}

/// Typed callbacks for the post-upgrade frame stream. Calls for one
/// connection are strictly serial.
pub trait SocketEvents: Send {
  fn on_message_start(&mut self, opcode: u8) {
    let _ = opcode;
  }
  fn on_message_part(&mut self, part: MessagePart<'_>);
  fn on_message_end(&mut self) {}
  fn on_frame_start(&mut self, fin: bool) {
    let _ = fin;
  }
  fn on_frame_end(&mut self) {}
  fn on_ping(&mut self, data: &[u8]) {
    let _ = data;
  }
  fn on_pong(&mut self, data: &[u8]) {
    let _ = data;
  }
  fn on_close_received(&mut self, code: u16, reason: &str) {
    let _ = (code, reason);
  }
  fn on_error(&mut self, code: u16, message: &str) {
    let _ = (code, message);
  }
  /// The socket is gone; the connection will not emit further events.
  fn on_close(&mut self) {}
}

/// A WebSocket-level rejection issued by an acceptor after the upgrade.
#[derive(Debug)]
pub struct Reject {
  pub code: u16,
  pub reason: String,
}

pub type Acceptor =
  Box<dyn FnOnce(Connection) -> Result<Box<dyn SocketEvents>, Reject> + Send>;

/// A successful handler test: the negotiated subprotocol and the
/// acceptor to invoke once the upgrade response has been written.
pub struct HandlerMatch {
  pub protocol: String,
  pub acceptor: Acceptor,
}

impl std::fmt::Debug for HandlerMatch {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HandlerMatch")
      .field("protocol", &self.protocol)
      .finish()
  }
}

impl std::fmt::Debug for dyn SocketEvents {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("dyn SocketEvents")
  }
}

/// Routes upgrade requests. Handlers are tested in registration order;
/// the first non-`None` match wins.
pub trait Handler: Send + Sync {
  fn test(
    &self,
    url: &str,
    headers: &Headers,
    protocols: &[String],
  ) -> Result<Option<HandlerMatch>, HandshakeError>;
}

struct ConnShared {
  id: u64,
  closed: AtomicBool,
  /// Wakes the reader when the connection is closed from outside.
  halt: Notify,
  /// Tells the writer to drain queued frames and stop.
  drain: Notify,
}

/// Cloneable sending half of a connection. All methods are non-blocking;
/// frames are queued to the writer task in call order. Every send after
/// `close` is a no-op.
#[derive(Clone)]
pub struct Connection {
  shared: Arc<ConnShared>,
  frames: mpsc::UnboundedSender<Frame>,
}

impl Connection {
  fn channel(id: u64) -> (Self, mpsc::UnboundedReceiver<Frame>) {
    let (frames, rx) = mpsc::unbounded_channel();
    let conn = Self {
      shared: Arc::new(ConnShared {
        id,
        closed: AtomicBool::new(false),
        halt: Notify::new(),
        drain: Notify::new(),
      }),
      frames,
    };
    (conn, rx)
  }

  /// Process-unique connection id, for logs.
  pub fn id(&self) -> u64 {
    self.shared.id
  }

  pub fn is_closed(&self) -> bool {
    self.shared.closed.load(Ordering::SeqCst)
  }

  pub fn send_frame(&self, opcode: u8, payload: Bytes, fin: bool) {
    if self.is_closed() {
      return;
    }
    let _ = self.frames.send(Frame::new(fin, opcode, payload));
  }

  pub fn send_text(&self, text: &str) {
    self.send_frame(opcode::TEXT, Bytes::copy_from_slice(text.as_bytes()), true);
  }

  pub fn send_binary(&self, data: &[u8]) {
    self.send_frame(opcode::BINARY, Bytes::copy_from_slice(data), true);
  }

  pub fn ping(&self, payload: Bytes) {
    self.send_frame(opcode::PING, payload, true);
  }

  pub fn pong(&self, payload: Bytes) {
    self.send_frame(opcode::PONG, payload, true);
  }

  /// Sends a close frame with a code-prefixed UTF-8 reason and marks the
  /// connection closed. The reader stops and the socket is torn down.
  pub fn close(&self, code: u16, reason: &str) {
    if self.shared.closed.swap(true, Ordering::SeqCst) {
      return;
    }
    let _ = self.frames.send(Frame::close(code, reason.as_bytes()));
    self.shared.halt.notify_one();
  }

  /// Close with a raw payload (empty = "no status present").
  pub(crate) fn close_raw(&self, payload: Bytes) {
    if self.shared.closed.swap(true, Ordering::SeqCst) {
      return;
    }
    let _ = self.frames.send(Frame::close_raw(payload));
    self.shared.halt.notify_one();
  }

  #[cfg(test)]
  pub(crate) fn test_channel(
    id: u64,
  ) -> (Self, mpsc::UnboundedReceiver<Frame>) {
    Self::channel(id)
  }
}

/// Owns the socket for one peer and runs its whole lifecycle: handshake,
/// handler dispatch, frame loop, teardown.
pub struct ConnectionDriver<S> {
  stream: S,
  conn: Connection,
  frames: mpsc::UnboundedReceiver<Frame>,
}

impl<S> ConnectionDriver<S>
where
  S: AsyncRead + AsyncWrite + Send + 'static,
{
  pub fn new(stream: S, id: u64) -> Self {
    let (conn, frames) = Connection::channel(id);
    Self {
      stream,
      conn,
      frames,
    }
  }

  /// The sending handle, for registries that close connections from the
  /// outside (e.g. server shutdown).
  pub fn connection(&self) -> Connection {
    self.conn.clone()
  }

  /// Drives the connection to completion. Returns when the socket is
  /// gone and every queued outbound frame has been written (or the write
  /// side failed, which is swallowed).
  pub async fn run(self, handlers: &[Arc<dyn Handler>]) {
    let ConnectionDriver {
      stream,
      conn,
      frames,
    } = self;
    let shared = conn.shared.clone();
    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut buf = vec![0u8; READ_CHUNK];

    // Handshake: ReadingRequest / ReadingHeaders.
    let mut machine = HandshakeMachine::new();
    let (head, leftover) = loop {
      let read = tokio::select! {
        _ = shared.halt.notified() => return,
        read = rd.read(&mut buf) => read,
      };
      let n = match read {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
      };
      match machine.feed(&buf[..n]) {
        Ok(None) => continue,
        Ok(Some(head)) => {
          let leftover = buf[head.consumed..n].to_vec();
          break (head, leftover);
        }
        Err(err) => {
          debug!("connection {}: handshake failed: {}", shared.id, err);
          let _ = wr
            .write_all(handshake::reject_response(&err).as_bytes())
            .await;
          return;
        }
      }
    };

    // Upgrade: validate, resolve a handler, answer 101.
    let found = handshake::validate(&head.headers).and_then(|request| {
      for handler in handlers {
        if let Some(found) =
          handler.test(&head.path, &head.headers, &request.protocols)?
        {
          return Ok((found, request));
        }
      }
      Err(HandshakeError::NoHandler)
    });
    let (matched, request) = match found {
      Ok(found) => found,
      Err(err) => {
        debug!("connection {}: upgrade rejected: {}", shared.id, err);
        let _ = wr
          .write_all(handshake::reject_response(&err).as_bytes())
          .await;
        return;
      }
    };
    let response = handshake::switching_protocols(
      &handshake::accept_key(&request.key),
      &matched.protocol,
    );
    if wr.write_all(response.as_bytes()).await.is_err() {
      return;
    }

    let writer = tokio::spawn(write_loop(wr, frames, shared.clone()));

    let mut events = match (matched.acceptor)(conn.clone()) {
      Ok(events) => events,
      Err(reject) => {
        debug!(
          "connection {}: rejected after upgrade: {} {}",
          shared.id, reject.code, reject.reason
        );
        conn.close(reject.code, &reject.reason);
        shared.drain.notify_one();
        let _ = writer.await;
        return;
      }
    };
    debug!(
      "connection {}: upgraded, protocol {}",
      shared.id, matched.protocol
    );

    // Frame stream.
    let mut machine = FrameMachine::new();
    let mut result = Ok(ControlFlow::Continue(()));
    if !leftover.is_empty() {
      let mut leftover = leftover;
      result = machine.process(&mut leftover, events.as_mut(), &conn);
    }
    while let Ok(ControlFlow::Continue(())) = result {
      if conn.is_closed() {
        break;
      }
      let read = tokio::select! {
        _ = shared.halt.notified() => break,
        read = rd.read(&mut buf) => read,
      };
      match read {
        Ok(0) => break,
        Err(err) => {
          debug!("connection {}: read failed: {}", shared.id, err);
          break;
        }
        Ok(n) => {
          result = machine.process(&mut buf[..n], events.as_mut(), &conn);
        }
      }
    }

    if let Err(err) = result {
      let code = err.close_code();
      let message = err.to_string();
      warn!("connection {}: {}", shared.id, message);
      events.on_error(code, &message);
      conn.close(code, &message);
    }
    events.on_close();
    drop(events);
    drop(conn);
    shared.drain.notify_one();
    let _ = writer.await;
  }
}

async fn write_loop<W>(
  mut stream: W,
  mut frames: mpsc::UnboundedReceiver<Frame>,
  shared: Arc<ConnShared>,
) where
  W: AsyncWrite + Unpin,
{
  let mut head = BytesMut::with_capacity(
    frame::MAX_HEAD_SIZE + COALESCE_THRESHOLD,
  );
  loop {
    let frame = tokio::select! {
      frame = frames.recv() => frame,
      _ = shared.drain.notified() => {
        while let Ok(frame) = frames.try_recv() {
          if write_frame(&mut stream, &mut head, &frame).await.is_err() {
            break;
          }
        }
        break;
      }
    };
    let Some(frame) = frame else {
      break;
    };
    if write_frame(&mut stream, &mut head, &frame).await.is_err() {
      // A broken write side means the peer is gone; mark closed and let
      // the reader wind down.
      shared.closed.store(true, Ordering::SeqCst);
      shared.halt.notify_one();
      break;
    }
  }
  let _ = stream.shutdown().await;
}

async fn write_frame<W>(
  stream: &mut W,
  scratch: &mut BytesMut,
  frame: &Frame,
) -> std::io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  scratch.clear();
  frame.encode_head(scratch);
  if frame.payload.len() <= COALESCE_THRESHOLD {
    scratch.extend_from_slice(&frame.payload);
    stream.write_all(&scratch[..]).await
  } else {
    stream.write_all(&scratch[..]).await?;
    stream.write_all(&frame.payload).await
  }
}

struct InFrame {
  fin: bool,
  opcode: u8,
  mask: [u8; 4],
  remaining: u64,
  cursor: usize,
}

/// The two-level post-upgrade state machine: between frames, bytes
/// assemble into the 14-byte header buffer; mid-frame, chunks are
/// unmasked in place and streamed out without copying.
struct FrameMachine {
  head_buf: OnDemandBuffer,
  control_buf: OnDemandBuffer,
  current: Option<InFrame>,
  /// Opcode of the open data message; 0 when no message is open.
  last_opcode: u8,
}

impl FrameMachine {
  fn new() -> Self {
    Self {
      head_buf: OnDemandBuffer::new(frame::MAX_HEAD_SIZE),
      control_buf: OnDemandBuffer::new(CONTROL_PAYLOAD_MAX),
      current: None,
      last_opcode: 0,
    }
  }

  /// Feeds one chunk. `Break` means the connection is done (a close
  /// frame completed); protocol violations surface as errors.
  fn process(
    &mut self,
    data: &mut [u8],
    events: &mut dyn SocketEvents,
    conn: &Connection,
  ) -> Result<ControlFlow<()>, WebSocketError> {
    let mut pos = 0;
    loop {
      if self.current.is_some() {
        if self.consume_payload(data, &mut pos, events, conn)?.is_break() {
          return Ok(ControlFlow::Break(()));
        }
        if self.current.is_some() {
          // Payload continues in a later chunk.
          return Ok(ControlFlow::Continue(()));
        }
      } else {
        if pos == data.len() {
          return Ok(ControlFlow::Continue(()));
        }
        match self.head_buf.add_and_test(&data[pos..], frame::parse_head) {
          Err(_) => return Err(WebSocketError::HeaderAssembly),
          Ok(None) => return Ok(ControlFlow::Continue(())),
          Ok(Some((head, buffered))) => {
            pos += head.head_len - buffered;
            self.begin_frame(head, events)?;
          }
        }
      }
    }
  }

  fn begin_frame(
    &mut self,
    head: FrameHead,
    events: &mut dyn SocketEvents,
  ) -> Result<(), WebSocketError> {
    if frame::is_control(head.opcode) {
      if head.length > CONTROL_PAYLOAD_MAX as u64 {
        return Err(WebSocketError::ControlFrameTooLarge);
      }
      if !head.fin {
        return Err(WebSocketError::ControlFrameFragmented);
      }
    }
    let Some(mask) = head.mask else {
      return Err(WebSocketError::UnmaskedFrame);
    };
    if head.rsv != 0 {
      return Err(WebSocketError::ReservedBitsNotZero);
    }
    if head.length >> 63 != 0 {
      return Err(WebSocketError::FrameLengthOutOfRange);
    }
    if !frame::is_control(head.opcode) {
      match head.opcode {
        opcode::CONTINUATION => {
          if self.last_opcode == 0 {
            return Err(WebSocketError::UnexpectedContinuation);
          }
        }
        opcode::TEXT | opcode::BINARY => {
          if self.last_opcode != 0 {
            return Err(WebSocketError::MessageInterleaved);
          }
          self.last_opcode = head.opcode;
          events.on_message_start(head.opcode);
        }
        other => return Err(WebSocketError::ReservedOpcode(other)),
      }
    }
    events.on_frame_start(head.fin);
    self.current = Some(InFrame {
      fin: head.fin,
      opcode: head.opcode,
      mask,
      remaining: head.length,
      cursor: 0,
    });
    Ok(())
  }

  fn consume_payload(
    &mut self,
    data: &mut [u8],
    pos: &mut usize,
    events: &mut dyn SocketEvents,
    conn: &Connection,
  ) -> Result<ControlFlow<()>, WebSocketError> {
    let Some(cur) = self.current.as_mut() else {
      return Ok(ControlFlow::Continue(()));
    };
    let take = cur.remaining.min((data.len() - *pos) as u64) as usize;
    let chunk = &mut data[*pos..*pos + take];
    mask::unmask(chunk, cur.mask, cur.cursor);
    cur.cursor = (cur.cursor + take) & 3;
    cur.remaining -= take as u64;
    *pos += take;
    let done = cur.remaining == 0;
    let fin = cur.fin;
    let op = cur.opcode;

    if frame::is_control(op) {
      self.control_buf.add(chunk);
      if done {
        self.current = None;
        return self.finish_control(op, events, conn);
      }
    } else {
      events.on_message_part(MessagePart {
        data: chunk,
        opcode: self.last_opcode,
        continuation: op == opcode::CONTINUATION,
        fin: fin && done,
      });
      if done {
        self.current = None;
        events.on_frame_end();
        if fin {
          events.on_message_end();
          self.last_opcode = 0;
        }
      }
    }
    Ok(ControlFlow::Continue(()))
  }

  fn finish_control(
    &mut self,
    op: u8,
    events: &mut dyn SocketEvents,
    conn: &Connection,
  ) -> Result<ControlFlow<()>, WebSocketError> {
    events.on_frame_end();
    let payload = self.control_buf.take_vec();
    match op {
      opcode::CLOSE => {
        let (code, reason) = if payload.len() >= 2 {
          (
            u16::from_be_bytes([payload[0], payload[1]]),
            String::from_utf8_lossy(&payload[2..]).into_owned(),
          )
        } else {
          (close::NO_STATUS, String::new())
        };
        events.on_close_received(code, &reason);
        if !conn.is_closed() {
          if code == close::NO_STATUS {
            conn.close_raw(Bytes::new());
          } else {
            conn.close(code, &reason);
          }
        }
        Ok(ControlFlow::Break(()))
      }
      opcode::PING => {
        events.on_ping(&payload);
        conn.pong(Bytes::from(payload));
        Ok(ControlFlow::Continue(()))
      }
      opcode::PONG => {
        events.on_pong(&payload);
        Ok(ControlFlow::Continue(()))
      }
      other => Err(WebSocketError::ReservedOpcode(other)),
    }
  }
}
