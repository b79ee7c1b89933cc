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

//! Event payload encoding.
//!
//! Events are stored as bincode with the standard configuration. The format
//! carries no schema, so the event type must stay compatible across restarts.

use bincode::config;
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use snafu::ResultExt;

use crate::{
    Result,
    error::{DecodeEventSnafu, EncodeEventSnafu},
    frame::FrameId,
};

pub(crate) fn encode_event<E: Serialize>(event: &E) -> Result<Bytes> {
    let bytes = bincode::serde::encode_to_vec(event, config::standard()).context(EncodeEventSnafu)?;
    Ok(Bytes::from(bytes))
}

pub(crate) fn decode_event<E: DeserializeOwned>(frame_id: FrameId, data: &[u8]) -> Result<E> {
    let (event, _) = bincode::serde::decode_from_slice(data, config::standard())
        .context(DecodeEventSnafu { frame_id })?;
    Ok(event)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::QueueError;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct LogEvent {
        host:    String,
        message: String,
        level:   u8,
    }

    #[test]
    fn test_event_round_trip() {
        let event = LogEvent {
            host:    "web-01".to_string(),
            message: "请求完成 ✓".to_string(),
            level:   3,
        };
        let encoded = encode_event(&event).unwrap();
        let decoded: LogEvent = decode_event(0, &encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_truncated_payload_reports_frame() {
        let encoded = encode_event(&"a fairly long message".to_string()).unwrap();
        let result: Result<String> = decode_event(42, &encoded[..4]);
        assert!(matches!(result, Err(QueueError::DecodeEvent { frame_id: 42, .. })));
    }
}
