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

//! Close codes used on the wire.

/// Server is going away (graceful shutdown).
pub const SHUTTING_DOWN: u16 = 1001;

/// Protocol violation.
pub const PROTOCOL_ERROR: u16 = 1002;

/// No status code was present in the close frame.
pub const NO_STATUS: u16 = 1005;

/// Unexpected internal condition.
pub const INTERNAL_ERROR: u16 = 1011;

/// Capacity reject: chamber full or too many chambers.
pub const TRY_AGAIN_LATER: u16 = 1013;

/// Application-level reject: the target header segment never terminated.
pub const HEADER_TOO_LARGE: u16 = 4000;
