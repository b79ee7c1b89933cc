// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Frame checksums.
//!
//! The checksum covers the 4-byte little-endian frame length followed by the
//! payload, so a corrupted length is caught as well as a corrupted payload.
//! CRC-32 (IEEE polynomial) is computed with crc32fast.

use crc32fast::Hasher;

use crate::config::ChecksumType;

impl ChecksumType {
    /// Computes the checksum of a frame.
    ///
    /// # Arguments
    /// * `length` - The frame length field as written to disk
    /// * `data` - The payload bytes
    #[inline]
    #[must_use]
    pub fn compute(self, length: u32, data: &[u8]) -> u32 {
        match self {
            Self::None => 0,
            Self::Crc32 => {
                let mut hasher = Hasher::new();
                hasher.update(&length.to_le_bytes());
                hasher.update(data);
                hasher.finalize()
            }
        }
    }

    /// Verifies a stored checksum. Always passes for [`ChecksumType::None`].
    #[inline]
    #[must_use]
    pub fn verify(self, length: u32, data: &[u8], expected: u32) -> bool {
        match self {
            Self::None => true,
            Self::Crc32 => self.compute(length, data) == expected,
        }
    }
}
