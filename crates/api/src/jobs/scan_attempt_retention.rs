//! Deletes scan attempts older than the retention window.

use chrono::Duration;
use std::sync::Arc;
use tracing::info;

use domain::services::AccessControl;

use super::scheduler::{Job, JobFrequency};

pub struct ScanAttemptRetentionJob {
    access: Arc<AccessControl>,
    retention_days: i64,
}

impl ScanAttemptRetentionJob {
    pub fn new(access: Arc<AccessControl>, retention_days: i64) -> Self {
        Self {
            access,
            retention_days,
        }
    }
}

#[async_trait::async_trait]
impl Job for ScanAttemptRetentionJob {
    fn name(&self) -> &'static str {
        "scan_attempt_retention"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Hourly
    }

    async fn execute(&self) -> Result<(), String> {
        let cutoff = self.access.now() - Duration::days(self.retention_days);
        let deleted = self
            .access
            .purge_scan_attempts(cutoff)
            .await
            .map_err(|e| format!("Failed to purge scan attempts: {}", e))?;

        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "Purged expired scan attempts");
        }
        Ok(())
    }
}
