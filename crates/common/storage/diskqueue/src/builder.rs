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

use std::{path::PathBuf, sync::Arc, time::Duration};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    ChecksumType, DiskQueue, EncryptionKey, FlushMode, QueueConfig, Result, ack::AckCallback,
};

pub struct QueueBuilder {
    config: QueueConfig,
    on_ack: Option<AckCallback>,
}

impl QueueBuilder {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config: QueueConfig {
                path: path.into(),
                ..Default::default()
            },
            on_ack: None,
        }
    }

    /// Starts from existing settings, e.g. ones loaded from a config file.
    #[must_use]
    pub fn from_config(config: QueueConfig) -> Self {
        Self {
            config,
            on_ack: None,
        }
    }

    #[must_use]
    pub fn max_buffer_size(mut self, size: u64) -> Self {
        self.config.max_buffer_size = size;
        self
    }

    #[must_use]
    pub fn max_segment_size(mut self, size: u64) -> Self {
        self.config.max_segment_size = size;
        self
    }

    #[must_use]
    pub fn read_ahead_limit(mut self, frames: usize) -> Self {
        self.config.read_ahead_limit = frames;
        self
    }

    #[must_use]
    pub fn write_ahead_limit(mut self, frames: usize) -> Self {
        self.config.write_ahead_limit = frames;
        self
    }

    #[must_use]
    pub fn checksum_type(mut self, checksum: ChecksumType) -> Self {
        self.config.checksum_type = checksum;
        self
    }

    #[must_use]
    pub fn encryption_key(mut self, key: EncryptionKey) -> Self {
        self.config.encryption_key = Some(key);
        self
    }

    #[must_use]
    pub fn use_compression(mut self, enabled: bool) -> Self {
        self.config.use_compression = enabled;
        self
    }

    #[must_use]
    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.config.flush_mode = mode;
        self
    }

    #[must_use]
    pub fn retry_interval(mut self, min: Duration, max: Duration) -> Self {
        self.config.retry_interval = min;
        self.config.max_retry_interval = max;
        self
    }

    /// Registers a callback receiving the number of frames whose
    /// acknowledgment was just persisted.
    #[must_use]
    pub fn on_ack(mut self, callback: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_ack = Some(Arc::new(callback));
        self
    }

    /// Opens the queue.
    ///
    /// # Errors
    ///
    /// See [`DiskQueue::open`].
    pub fn build<E: Serialize + DeserializeOwned>(self) -> Result<DiskQueue<E>> {
        DiskQueue::open(self.config, self.on_ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ENCRYPTION_KEY_SIZE;

    #[test]
    fn test_builder_default_config() {
        let builder = QueueBuilder::new("/tmp/test_queue");
        assert_eq!(builder.config.path, PathBuf::from("/tmp/test_queue"));
        assert_eq!(builder.config.max_segment_size, 100 * 1024 * 1024);
        assert_eq!(builder.config.read_ahead_limit, 512);
        assert!(builder.config.encryption_key.is_none());
        assert!(builder.on_ack.is_none());
    }

    #[test]
    fn test_builder_custom_config() {
        let builder = QueueBuilder::new("/tmp/test_queue")
            .max_buffer_size(0)
            .max_segment_size(4096)
            .write_ahead_limit(16)
            .checksum_type(ChecksumType::None)
            .encryption_key(EncryptionKey::new([1; ENCRYPTION_KEY_SIZE]))
            .use_compression(true)
            .flush_mode(FlushMode::Async)
            .retry_interval(Duration::from_millis(10), Duration::from_millis(100))
            .on_ack(|_| {});

        assert_eq!(builder.config.byte_limit(), None);
        assert_eq!(builder.config.max_segment_size, 4096);
        assert_eq!(builder.config.write_ahead_limit, 16);
        assert_eq!(builder.config.checksum_type, ChecksumType::None);
        assert!(builder.config.encryption_key.is_some());
        assert!(builder.config.use_compression);
        assert_eq!(builder.config.flush_mode, FlushMode::Async);
        assert_eq!(builder.config.max_retry_interval, Duration::from_millis(100));
        assert!(builder.on_ack.is_some());
        assert!(builder.config.validate().is_ok());
    }

    #[test]
    fn test_build_rejects_invalid_settings() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let result = QueueBuilder::new(temp_dir.path())
            .max_buffer_size(10)
            .max_segment_size(100)
            .build::<String>();
        assert!(matches!(result, Err(crate::QueueError::InvalidSettings { .. })));
    }
}
