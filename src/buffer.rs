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

//! Fixed-capacity append buffers backed by a process-wide, size-keyed
//! free pool. Connections use these for the short-lived assembly jobs
//! (frame headers, control payloads, target headers) so steady-state
//! traffic does not allocate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::OnceLock;

/// Free-list bound per distinct capacity.
const MAX_POOLED_PER_SIZE: usize = 64;

static POOL: OnceLock<Mutex<HashMap<usize, Vec<Vec<u8>>>>> = OnceLock::new();

fn pool() -> &'static Mutex<HashMap<usize, Vec<Vec<u8>>>> {
  POOL.get_or_init(Default::default)
}

/// Returned by [`OnDemandBuffer::add_and_test`] when retaining the input
/// would exceed the buffer capacity.
#[derive(Debug, PartialEq, Eq)]
pub struct Overflow;

/// An append-only buffer that never grows past its capacity.
#[derive(Debug)]
pub struct PooledBuffer {
  data: Vec<u8>,
  cap: usize,
}

impl PooledBuffer {
  /// Claims a buffer for `cap`, reusing a pooled allocation when one is
  /// available.
  pub fn take(cap: usize) -> Self {
    let data = pool()
      .lock()
      .unwrap()
      .get_mut(&cap)
      .and_then(Vec::pop)
      .unwrap_or_else(|| Vec::with_capacity(cap));
    Self { data, cap }
  }

  /// Appends at most the remaining capacity; returns the number of bytes
  /// actually copied.
  pub fn add(&mut self, bytes: &[u8]) -> usize {
    let n = bytes.len().min(self.cap - self.data.len());
    self.data.extend_from_slice(&bytes[..n]);
    n
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn as_slice(&self) -> &[u8] {
    &self.data
  }

  /// Returns the allocation to the pool (dropped if the free-list for
  /// this size is full).
  pub fn release(mut self) {
    self.data.clear();
    let mut pool = pool().lock().unwrap();
    let list = pool.entry(self.cap).or_default();
    if list.len() < MAX_POOLED_PER_SIZE {
      list.push(std::mem::take(&mut self.data));
    }
  }
}

/// A buffer slot that claims pooled storage on first write and returns
/// it as soon as the buffered prefix has been consumed. Most messages
/// arrive in one chunk, so most connections never hold storage at all.
#[derive(Debug)]
pub struct OnDemandBuffer {
  cap: usize,
  inner: Option<PooledBuffer>,
}

impl OnDemandBuffer {
  pub fn new(cap: usize) -> Self {
    Self { cap, inner: None }
  }

  pub fn len(&self) -> usize {
    self.inner.as_ref().map_or(0, PooledBuffer::len)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Appends at most the remaining capacity; returns the bytes copied.
  pub fn add(&mut self, bytes: &[u8]) -> usize {
    self
      .inner
      .get_or_insert_with(|| PooledBuffer::take(self.cap))
      .add(bytes)
  }

  /// Releases any claimed storage back to the pool.
  pub fn clear(&mut self) {
    if let Some(buf) = self.inner.take() {
      buf.release();
    }
  }

  /// Copies the buffered bytes out and releases the storage.
  pub fn take_vec(&mut self) -> Vec<u8> {
    let out = self
      .inner
      .as_ref()
      .map_or_else(Vec::new, |buf| buf.as_slice().to_vec());
    self.clear();
    out
  }

  /// The capacity may only change while nothing is buffered.
  pub fn set_capacity(&mut self, cap: usize) {
    debug_assert!(self.is_empty());
    self.cap = cap;
  }

  /// Evaluates `test` over the buffered prefix followed by `data`.
  ///
  /// On success the storage is released and the result is returned along
  /// with the prefix length, so the caller can locate the first
  /// unconsumed byte inside `data`. On "need more" the input is
  /// retained; [`Overflow`] is returned when it does not fit.
  pub fn add_and_test<T>(
    &mut self,
    data: &[u8],
    test: impl FnOnce(&[u8]) -> Option<T>,
  ) -> Result<Option<(T, usize)>, Overflow> {
    match &mut self.inner {
      None => match test(data) {
        Some(found) => Ok(Some((found, 0))),
        None => {
          if self.add(data) < data.len() {
            Err(Overflow)
          } else {
            Ok(None)
          }
        }
      },
      Some(buf) => {
        let prior = buf.len();
        let copied = buf.add(data);
        match test(buf.as_slice()) {
          Some(found) => {
            self.clear();
            Ok(Some((found, prior)))
          }
          None if copied < data.len() => Err(Overflow),
          None => Ok(None),
        }
      }
    }
  }
}

impl Drop for OnDemandBuffer {
  fn drop(&mut self) {
    self.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn add_respects_capacity() {
    let mut buf = PooledBuffer::take(4);
    assert_eq!(buf.add(b"ab"), 2);
    assert_eq!(buf.add(b"cdef"), 2);
    assert_eq!(buf.as_slice(), b"abcd");
    assert_eq!(buf.add(b"x"), 0);
    buf.release();
  }

  #[test]
  fn pool_reuses_allocations() {
    let buf = PooledBuffer::take(9001);
    let ptr = buf.as_slice().as_ptr();
    buf.release();
    let again = PooledBuffer::take(9001);
    assert_eq!(again.as_slice().as_ptr(), ptr);
    assert!(again.is_empty());
    again.release();
  }

  #[test]
  fn on_demand_claims_lazily() {
    let mut buf = OnDemandBuffer::new(16);
    assert!(buf.inner.is_none());
    buf.add(b"abc");
    assert!(buf.inner.is_some());
    assert_eq!(buf.len(), 3);
    buf.clear();
    assert!(buf.inner.is_none());
  }

  #[test]
  fn add_and_test_fast_path_does_not_buffer() {
    let mut buf = OnDemandBuffer::new(16);
    let found = buf
      .add_and_test(b"one\nrest", |b| b.iter().position(|&c| c == b'\n'))
      .unwrap();
    assert_eq!(found, Some((3, 0)));
    assert!(buf.inner.is_none());
  }

  #[test]
  fn add_and_test_buffers_and_resumes() {
    let mut buf = OnDemandBuffer::new(16);
    assert_eq!(
      buf.add_and_test(b"par", |b| b.iter().position(|&c| c == b'\n')),
      Ok(None)
    );
    assert_eq!(buf.len(), 3);
    let found = buf
      .add_and_test(b"tial\ntail", |b| b.iter().position(|&c| c == b'\n'))
      .unwrap();
    // Newline at index 7 of the concatenation, 3 bytes were buffered.
    assert_eq!(found, Some((7, 3)));
    assert!(buf.is_empty());
  }

  #[test]
  fn add_and_test_overflows() {
    let mut buf = OnDemandBuffer::new(4);
    assert_eq!(buf.add_and_test(b"abcde", |_| None::<()>), Err(Overflow));
  }
}
