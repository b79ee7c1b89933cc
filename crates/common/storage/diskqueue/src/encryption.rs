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

//! AES-128-CTR stream layer for segment files.
//!
//! An encrypted segment stores a random 16-byte IV in plain text right after
//! the segment header, followed by the keystream-XORed data. CTR mode keeps
//! the ciphertext the same length as the plain text and allows seeking to any
//! logical offset, which the reader uses to resume mid-segment.

use std::io::{self, Read, Seek, SeekFrom, Write};

use aes::Aes128;
use ctr::{
    Ctr128BE,
    cipher::{KeyIvInit, StreamCipher, StreamCipherSeek},
};
use rand::RngCore;

use crate::config::EncryptionKey;

/// Size of the initialization vector stored ahead of the encrypted stream.
pub(crate) const IV_SIZE: usize = 16;

type Aes128Ctr = Ctr128BE<Aes128>;

fn cipher(key: &EncryptionKey, iv: &[u8; IV_SIZE]) -> Aes128Ctr {
    Aes128Ctr::new(key.as_bytes().into(), iv.into())
}

/// Encrypts everything written through it.
///
/// Ciphertext the inner writer has not accepted yet stays buffered, so a
/// failed write can be retried without re-applying the keystream.
pub(crate) struct EncryptionWriter<W> {
    inner:   W,
    cipher:  Aes128Ctr,
    pending: Vec<u8>,
    /// Bytes of `pending` already taken by `inner`.
    written: usize,
}

impl<W: Write> EncryptionWriter<W> {
    /// Generates a fresh IV and writes it to `inner`.
    pub(crate) fn new(mut inner: W, key: &EncryptionKey) -> io::Result<Self> {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        inner.write_all(&iv)?;
        Ok(Self {
            inner,
            cipher: cipher(key, &iv),
            pending: Vec::new(),
            written: 0,
        })
    }

    fn write_pending(&mut self) -> io::Result<()> {
        while self.written < self.pending.len() {
            match self.inner.write(&self.pending[self.written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        self.pending.clear();
        self.written = 0;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn get_ref(&self) -> &W { &self.inner }
}

impl<W: Write> Write for EncryptionWriter<W> {
    /// Takes all of `buf` or nothing. Ciphertext reaches the inner writer on
    /// the next write or flush.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_pending()?;
        self.pending.extend_from_slice(buf);
        self.cipher.apply_keystream(&mut self.pending);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.write_pending()?;
        self.inner.flush()
    }
}

/// Decrypts everything read through it.
pub(crate) struct EncryptionReader<R> {
    inner:    R,
    cipher:   Aes128Ctr,
    position: u64,
}

impl<R: Read> EncryptionReader<R> {
    /// Reads the IV from `inner` and positions the reader at logical offset 0.
    pub(crate) fn new(mut inner: R, key: &EncryptionKey) -> io::Result<Self> {
        let mut iv = [0u8; IV_SIZE];
        inner.read_exact(&mut iv)?;
        Ok(Self {
            inner,
            cipher: cipher(key, &iv),
            position: 0,
        })
    }
}

impl<R: Read> Read for EncryptionReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.apply_keystream(&mut buf[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for EncryptionReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "seeking from the end of an encrypted stream",
                ));
            }
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before stream start"))?;

        let delta = i64::try_from(i128::from(target) - i128::from(self.position))
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "seek distance overflow"))?;
        self.inner.seek(SeekFrom::Current(delta))?;
        self.cipher
            .try_seek(target)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        self.position = target;
        Ok(target)
    }
}
