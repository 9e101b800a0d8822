// =============================================================================
// Backfill Job Store
// =============================================================================
//
// Tracks historical backfill runs. The single-active-job rule is enforced
// here: creating a job while another is pending or running is a conflict.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::CoordinatorError;
use crate::types::{BackfillJob, BackfillStatus, FeedKind};

#[derive(Default)]
pub struct BackfillJobStore {
    jobs: RwLock<HashMap<String, BackfillJob>>,
}

impl BackfillJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new pending job. Fails with a conflict when another job is
    /// still active — callers surface this as HTTP 409.
    pub fn create(
        &self,
        source: &str,
        subject: &str,
        kind: FeedKind,
        granularity: &str,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
    ) -> Result<BackfillJob, CoordinatorError> {
        let mut jobs = self.jobs.write();
        if let Some(active) = jobs.values().find(|j| j.status.is_active()) {
            return Err(CoordinatorError::Conflict(format!(
                "backfill job {} is already {}",
                active.id, active.status
            )));
        }

        let now = Utc::now();
        let job = BackfillJob {
            id: Uuid::new_v4().to_string(),
            source: source.to_string(),
            subject: subject.to_string(),
            kind,
            granularity: granularity.to_string(),
            start_ts,
            end_ts,
            cursor_ts: start_ts,
            records_written: 0,
            pages_fetched: 0,
            status: BackfillStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        };
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    pub fn get(&self, job_id: &str) -> Option<BackfillJob> {
        self.jobs.read().get(job_id).cloned()
    }

    /// Jobs newest-first, optionally filtered by status.
    pub fn find(&self, status: Option<BackfillStatus>, limit: usize) -> Vec<BackfillJob> {
        let jobs = self.jobs.read();
        let mut rows: Vec<BackfillJob> = jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        rows.sort_by_key(|j| std::cmp::Reverse(j.created_at));
        rows.truncate(limit);
        rows
    }

    /// The job currently occupying the single active slot, if any.
    pub fn get_running(&self) -> Option<BackfillJob> {
        self.jobs
            .read()
            .values()
            .find(|j| j.status.is_active())
            .cloned()
    }

    pub fn update_progress(
        &self,
        job_id: &str,
        cursor_ts: DateTime<Utc>,
        records_written: u64,
        pages_fetched: u64,
    ) {
        let mut jobs = self.jobs.write();
        if let Some(job) = jobs.get_mut(job_id) {
            job.cursor_ts = cursor_ts;
            job.records_written = records_written;
            job.pages_fetched = pages_fetched;
            job.updated_at = Utc::now();
        }
    }

    pub fn set_status(&self, job_id: &str, status: BackfillStatus, error: Option<String>) {
        let mut jobs = self.jobs.write();
        if let Some(job) = jobs.get_mut(job_id) {
            job.status = status;
            job.error = error;
            job.updated_at = Utc::now();
        }
    }

    pub fn rollback(&self) {}
}

// =============================================================================
// Tests
// =============================================================================
