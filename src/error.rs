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

use thiserror::Error;

use crate::close;

/// Errors raised before the connection is upgraded. Each maps to an HTTP
/// status; the response body is the `Display` rendering.
#[derive(Debug, Error)]
pub enum HandshakeError {
  #[error("Malformed request line")]
  BadRequestLine,
  #[error("Malformed header line")]
  BadHeaderLine,
  #[error("Header line too long")]
  HeaderLineTooLong,
  #[error("Header value too long")]
  HeaderValueTooLong,
  #[error("Too many headers")]
  TooManyHeaders,
  #[error("Not a WebSocket upgrade request")]
  NotAnUpgrade,
  #[error("Missing Sec-WebSocket-Key")]
  MissingKey,
  #[error("Unsupported WebSocket version")]
  UnsupportedVersion,
  #[error("Origin {0} not permitted")]
  OriginNotPermitted(String),
  #[error("No handler for this request")]
  NoHandler,
  #[error("Internal error")]
  Internal,
}

impl HandshakeError {
  /// HTTP status line pieces for the reject response.
  pub fn status(&self) -> (u16, &'static str) {
    match self {
      HandshakeError::OriginNotPermitted(_) => (403, "Forbidden"),
      HandshakeError::NoHandler => (404, "Not Found"),
      HandshakeError::Internal => (500, "Internal Server Error"),
      _ => (400, "Bad Request"),
    }
  }
}

/// Errors raised on an upgraded connection. Each maps to the close code
/// sent to the peer when the error tears the connection down.
#[derive(Debug, Error)]
pub enum WebSocketError {
  #[error("Control frame payload exceeds 125 bytes")]
  ControlFrameTooLarge,
  #[error("Control frame must not be fragmented")]
  ControlFrameFragmented,
  #[error("Client frame is not masked")]
  UnmaskedFrame,
  #[error("Reserved bits are not zero")]
  ReservedBitsNotZero,
  #[error("Reserved opcode {0}")]
  ReservedOpcode(u8),
  #[error("New message started before the previous message finished")]
  MessageInterleaved,
  #[error("Continuation frame without an open message")]
  UnexpectedContinuation,
  #[error("Frame length out of range")]
  FrameLengthOutOfRange,
  #[error("Frame header could not be assembled")]
  HeaderAssembly,
  #[error("{0}")]
  Io(#[from] std::io::Error),
}

impl WebSocketError {
  pub fn close_code(&self) -> u16 {
    match self {
      WebSocketError::Io(_) => close::INTERNAL_ERROR,
      _ => close::PROTOCOL_ERROR,
    }
  }
}
