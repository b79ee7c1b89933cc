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

//! zstd stream layer for segment files.
//!
//! A compressed segment holds a single zstd frame. The writer flushes a block
//! at the end of every write batch so the reader can decode every frame the
//! core loop has been told about while the segment is still open.

use std::io::{self, Read, Write};

use zstd::stream::{read::Decoder, write::Encoder};

/// zstd level used for segment data.
const COMPRESSION_LEVEL: i32 = 3;

pub(crate) struct CompressionWriter<W: Write> {
    encoder: Encoder<'static, W>,
}

impl<W: Write> CompressionWriter<W> {
    pub(crate) fn new(inner: W) -> io::Result<Self> {
        Ok(Self {
            encoder: Encoder::new(inner, COMPRESSION_LEVEL)?,
        })
    }

    /// Ends the zstd stream. Nothing may be written afterwards.
    pub(crate) fn finish(&mut self) -> io::Result<()> { self.encoder.do_finish() }

    #[cfg(test)]
    pub(crate) fn get_ref(&self) -> &W { self.encoder.get_ref() }
}

impl<W: Write> Write for CompressionWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> { self.encoder.write(buf) }

    /// Emits a zstd block boundary so everything written so far is decodable.
    fn flush(&mut self) -> io::Result<()> { self.encoder.flush() }
}

pub(crate) struct CompressionReader<R: Read> {
    decoder: Decoder<'static, io::BufReader<R>>,
}

impl<R: Read> CompressionReader<R> {
    pub(crate) fn new(inner: R) -> io::Result<Self> {
        Ok(Self {
            decoder: Decoder::new(inner)?,
        })
    }
}

impl<R: Read> Read for CompressionReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> { self.decoder.read(buf) }
}
