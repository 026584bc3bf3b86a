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

//! Server side of the RFC 6455 opening handshake: an incremental parser
//! for the request line and header block, upgrade validation, and the
//! accept-key digest.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::Digest;
use sha1::Sha1;

use crate::error::HandshakeError;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A request or header line, without its CRLF.
pub const MAX_LINE_LENGTH: usize = 1024;
/// A header value after repeated-header concatenation.
pub const MAX_VALUE_LENGTH: usize = 1024;
/// Distinct header names per request.
pub const MAX_HEADER_COUNT: usize = 32;

/// Case-preserving header map. Lookup is case-insensitive; a repeated
/// header concatenates onto the first occurrence with `", "`.
#[derive(Debug, Default)]
pub struct Headers {
  entries: Vec<(String, String)>,
}

impl Headers {
  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .entries
      .iter()
      .find(|(key, _)| key.eq_ignore_ascii_case(name))
      .map(|(_, value)| value.as_str())
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  fn append(&mut self, name: &str, value: &str) -> Result<(), HandshakeError> {
    if let Some((_, existing)) = self
      .entries
      .iter_mut()
      .find(|(key, _)| key.eq_ignore_ascii_case(name))
    {
      if existing.len() + 2 + value.len() > MAX_VALUE_LENGTH {
        return Err(HandshakeError::HeaderValueTooLong);
      }
      existing.push_str(", ");
      existing.push_str(value);
      return Ok(());
    }
    if self.entries.len() == MAX_HEADER_COUNT {
      return Err(HandshakeError::TooManyHeaders);
    }
    if value.len() > MAX_VALUE_LENGTH {
      return Err(HandshakeError::HeaderValueTooLong);
    }
    self.entries.push((name.to_string(), value.to_string()));
    Ok(())
  }
}

/// The parsed request head, plus how many bytes of the final input chunk
/// belonged to it (anything after is already frame data).
#[derive(Debug)]
pub struct RequestHead {
  pub path: String,
  pub headers: Headers,
  pub consumed: usize,
}

#[derive(Debug)]
enum Stage {
  RequestLine,
  HeaderLines,
}

/// Incremental parser for the request head. Feed it chunks as they
/// arrive; it buffers partial lines internally.
#[derive(Debug)]
pub struct HandshakeMachine {
  stage: Stage,
  line: Vec<u8>,
  path: String,
  headers: Headers,
}

impl HandshakeMachine {
  pub fn new() -> Self {
    Self {
      stage: Stage::RequestLine,
      line: Vec::new(),
      path: String::new(),
      headers: Headers::default(),
    }
  }

  /// Consumes `data` line by line. Returns the completed head once the
  /// empty line arrives; `None` means more input is needed.
  pub fn feed(
    &mut self,
    data: &[u8],
  ) -> Result<Option<RequestHead>, HandshakeError> {
    let mut used = 0;
    while let Some(nl) = data[used..].iter().position(|&b| b == b'\n') {
      let mut line = std::mem::take(&mut self.line);
      line.extend_from_slice(&data[used..used + nl]);
      used += nl + 1;
      if line.last() == Some(&b'\r') {
        line.pop();
      }
      if line.len() > MAX_LINE_LENGTH {
        return Err(HandshakeError::HeaderLineTooLong);
      }

      match self.stage {
        Stage::RequestLine => {
          self.path = parse_request_line(&line)?;
          self.stage = Stage::HeaderLines;
        }
        Stage::HeaderLines => {
          if line.is_empty() {
            return Ok(Some(RequestHead {
              path: std::mem::take(&mut self.path),
              headers: std::mem::take(&mut self.headers),
              consumed: used,
            }));
          }
          let (name, value) = split_header_line(&line)?;
          self.headers.append(name, value)?;
        }
      }
    }

    self.line.extend_from_slice(&data[used..]);
    if self.line.len() > MAX_LINE_LENGTH {
      return Err(HandshakeError::HeaderLineTooLong);
    }
    Ok(None)
  }
}

fn path_byte_allowed(b: u8) -> bool {
  b.is_ascii_alphanumeric()
    || matches!(
      b,
      b'_'
        | b'/'
        | b'\\'
        | b'.'
        | b'?'
        | b'&'
        | b'%'
        | b'+'
        | b' '
        | b'-'
        | b'='
        | b'~'
    )
}

fn parse_request_line(line: &[u8]) -> Result<String, HandshakeError> {
  let rest = line
    .strip_prefix(b"GET ")
    .ok_or(HandshakeError::BadRequestLine)?;
  let path = rest
    .strip_suffix(b" HTTP/1.1")
    .ok_or(HandshakeError::BadRequestLine)?;
  if path.is_empty() || !path.iter().all(|&b| path_byte_allowed(b)) {
    return Err(HandshakeError::BadRequestLine);
  }
  std::str::from_utf8(path)
    .map(str::to_string)
    .map_err(|_| HandshakeError::BadRequestLine)
}

fn split_header_line(line: &[u8]) -> Result<(&str, &str), HandshakeError> {
  let line =
    std::str::from_utf8(line).map_err(|_| HandshakeError::BadHeaderLine)?;
  let (name, value) = line
    .split_once(':')
    .ok_or(HandshakeError::BadHeaderLine)?;
  if name.is_empty() {
    return Err(HandshakeError::BadHeaderLine);
  }
  Ok((name, value.trim()))
}

/// The upgrade-relevant fields pulled out of a validated request head.
#[derive(Debug)]
pub struct UpgradeRequest {
  pub key: String,
  pub protocols: Vec<String>,
}

/// Validates the upgrade preconditions: `Connection: Upgrade`,
/// `Upgrade: websocket`, a `Sec-WebSocket-Key`, and version 13 or later.
pub fn validate(headers: &Headers) -> Result<UpgradeRequest, HandshakeError> {
  if headers.get("Connection") != Some("Upgrade")
    || headers.get("Upgrade") != Some("websocket")
  {
    return Err(HandshakeError::NotAnUpgrade);
  }
  let key = headers
    .get("Sec-WebSocket-Key")
    .ok_or(HandshakeError::MissingKey)?
    .to_string();
  let version: u32 = headers
    .get("Sec-WebSocket-Version")
    .and_then(|v| v.trim().parse().ok())
    .ok_or(HandshakeError::UnsupportedVersion)?;
  if version < 13 {
    return Err(HandshakeError::UnsupportedVersion);
  }
  let protocols = headers
    .get("Sec-WebSocket-Protocol")
    .map(|list| {
      list
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
    })
    .unwrap_or_default();
  Ok(UpgradeRequest { key, protocols })
}

/// `base64(SHA1(key + GUID))`.
pub fn accept_key(key: &str) -> String {
  let mut sha = Sha1::new();
  sha.update(key.as_bytes());
  sha.update(GUID.as_bytes());
  BASE64.encode(sha.finalize())
}

/// The `101 Switching Protocols` response with the negotiated protocol.
pub fn switching_protocols(accept: &str, protocol: &str) -> String {
  format!(
    "HTTP/1.1 101 Switching Protocols\r\n\
     Upgrade: websocket\r\n\
     Connection: Upgrade\r\n\
     Sec-WebSocket-Accept: {accept}\r\n\
     Sec-WebSocket-Protocol: {protocol}\r\n\r\n"
  )
}

/// A plain-text HTTP error response; the socket is destroyed after it is
/// written.
pub fn reject_response(err: &HandshakeError) -> String {
  let (code, status) = err.status();
  let message = err.to_string();
  format!(
    "HTTP/1.1 {code} {status}\r\n\
     Content-Type: text/plain; charset=utf-8\r\n\
     Content-Length: {}\r\n\r\n\
     {message}\n",
    message.len() + 1
  )
}
