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

//! Background thread that removes fully acknowledged segment files.

use std::{fs, io, path::PathBuf};

use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, info};

use crate::{
    QueueError,
    segment::{SegmentId, segment_path},
};

#[derive(Debug, Default)]
pub(crate) struct DeleterLoopRequest {
    pub segments: Vec<SegmentId>,
}

#[derive(Debug, Default)]
pub(crate) struct DeleterLoopResponse {
    /// Segments whose files are gone, including ones that were already
    /// missing.
    pub deleted: Vec<SegmentId>,
    pub errors:  Vec<QueueError>,
}

pub(crate) struct DeleterLoop {
    dir:       PathBuf,
    requests:  Receiver<DeleterLoopRequest>,
    responses: Sender<DeleterLoopResponse>,
}

impl DeleterLoop {
    pub(crate) const fn new(
        dir: PathBuf,
        requests: Receiver<DeleterLoopRequest>,
        responses: Sender<DeleterLoopResponse>,
    ) -> Self {
        Self {
            dir,
            requests,
            responses,
        }
    }

    pub(crate) fn run(self) {
        info!("Deleter loop starting");
        while let Ok(request) = self.requests.recv() {
            if self.responses.send(self.process_request(&request)).is_err() {
                break;
            }
        }
        info!("Deleter loop stopped");
    }

    pub(crate) fn process_request(&self, request: &DeleterLoopRequest) -> DeleterLoopResponse {
        let mut response = DeleterLoopResponse::default();
        for &segment_id in &request.segments {
            let path = segment_path(&self.dir, segment_id);
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(segment_id, path = ?path, "Segment deleted");
                    response.deleted.push(segment_id);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    response.deleted.push(segment_id);
                }
                Err(source) => response.errors.push(QueueError::FileIo { path, source }),
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use crossbeam::channel::unbounded;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_missing_files_count_as_deleted() {
        let temp_dir = TempDir::new().unwrap();
        File::create(segment_path(temp_dir.path(), 1)).unwrap();

        let (_req_tx, req_rx) = unbounded();
        let (resp_tx, _resp_rx) = unbounded();
        let deleter = DeleterLoop::new(temp_dir.path().to_path_buf(), req_rx, resp_tx);

        let response = deleter.process_request(&DeleterLoopRequest {
            segments: vec![1, 2],
        });
        assert_eq!(response.deleted, vec![1, 2]);
        assert!(response.errors.is_empty());
        assert!(!segment_path(temp_dir.path(), 1).exists());
    }

    #[test]
    fn test_failed_removal_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        // A non-empty directory cannot be removed with remove_file.
        let blocker = segment_path(temp_dir.path(), 3);
        fs::create_dir(&blocker).unwrap();
        File::create(blocker.join("inner")).unwrap();

        let (_req_tx, req_rx) = unbounded();
        let (resp_tx, _resp_rx) = unbounded();
        let deleter = DeleterLoop::new(temp_dir.path().to_path_buf(), req_rx, resp_tx);

        let response = deleter.process_request(&DeleterLoopRequest { segments: vec![3] });
        assert!(response.deleted.is_empty());
        assert_eq!(response.errors.len(), 1);
    }
}
