//! Records attendance for granted scans whose attendance write failed.

use std::sync::Arc;
use tracing::info;

use domain::services::AccessControl;

use super::scheduler::{Job, JobFrequency};

pub struct AttendanceBackfillJob {
    access: Arc<AccessControl>,
    batch_size: i64,
}

impl AttendanceBackfillJob {
    pub fn new(access: Arc<AccessControl>, batch_size: i64) -> Self {
        Self { access, batch_size }
    }
}

#[async_trait::async_trait]
impl Job for AttendanceBackfillJob {
    fn name(&self) -> &'static str {
        "attendance_backfill"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Minutes(1)
    }

    async fn execute(&self) -> Result<(), String> {
        let summary = self
            .access
            .backfill_attendance(self.batch_size)
            .await
            .map_err(|e| format!("Failed to find unrecorded attendance: {}", e))?;

        if summary.processed > 0 {
            info!(
                processed = summary.processed,
                failed = summary.failed,
                "Backfilled attendance"
            );
        }
        if summary.failed > 0 && summary.failed == summary.processed {
            return Err(format!("all {} attendance writes failed", summary.failed));
        }
        Ok(())
    }
}
