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

/// Unmasks a payload chunk in place. `offset` is the number of payload
/// bytes already unmasked from the same frame, so a fragmented read can
/// resume mid-mask: byte `i` of `payload` is XORed with
/// `mask[(offset + i) & 3]`.
///
/// XOR masking is an involution, so the same call also masks.
pub fn unmask(payload: &mut [u8], mask: [u8; 4], offset: usize) {
  let rotated = [
    mask[offset & 3],
    mask[(offset + 1) & 3],
    mask[(offset + 2) & 3],
    mask[(offset + 3) & 3],
  ];

  let mut chunks = payload.chunks_exact_mut(4);
  for chunk in &mut chunks {
    chunk[0] ^= rotated[0];
    chunk[1] ^= rotated[1];
    chunk[2] ^= rotated[2];
    chunk[3] ^= rotated[3];
  }
  for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
    *byte ^= rotated[i & 3];
  }
}
