//! Upload status tracking
//!
//! The distribution API has no endpoint for upload progress, so pushers
//! record it client-side through a [`StatusTracker`].

use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::{ResolveError, Result};

/// Progress of an upload keyed by its reference
#[derive(Debug, Clone, Default)]
pub struct Status {
    /// Reference the upload commits to
    pub reference: String,
    /// Bytes written so far
    pub offset: u64,
    /// Expected total, zero when unknown
    pub total: u64,
}

/// Records and serves upload progress for pushers
pub trait StatusTracker: Send + Sync {
    /// Returns the tracked status for a reference, not-found when nothing
    /// was recorded
    fn get_status(&self, reference: &str) -> Result<Status>;
    /// Records the status for a reference
    fn set_status(&self, reference: &str, status: Status);
}

/// A process-local [`StatusTracker`]
#[derive(Default)]
pub struct MemoryTracker {
    statuses: Mutex<HashMap<String, Status>>,
}

impl StatusTracker for MemoryTracker {
    fn get_status(&self, reference: &str) -> Result<Status> {
        self.statuses
            .lock()
            .expect("tracker lock poisoned")
            .get(reference)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(format!("status for ref {}", reference)))
    }

    fn set_status(&self, reference: &str, status: Status) {
        self.statuses
            .lock()
            .expect("tracker lock poisoned")
            .insert(reference.to_string(), status);
    }
}
