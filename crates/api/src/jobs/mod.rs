//! Background jobs.

mod anchor_retry;
mod attendance_backfill;
mod pool_metrics;
mod scan_attempt_retention;
mod scheduler;

pub use anchor_retry::AnchorRetryJob;
pub use attendance_backfill::AttendanceBackfillJob;
pub use pool_metrics::PoolMetricsJob;
pub use scan_attempt_retention::ScanAttemptRetentionJob;
pub use scheduler::{Job, JobFrequency, JobScheduler};

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use uuid::Uuid;

    use domain::services::{
        AccessControl, AccessControlSettings, Collaborators, InMemoryAccessCodeStore,
        InMemoryAttendanceRecorder, InMemoryScanAttemptLog, IntegrityAnchor, IntegrityPolicy,
        IssueOptions, ManualClock, StaticRegistrationDirectory,
    };

    pub fn access_control(
        anchor: Option<Arc<dyn IntegrityAnchor>>,
    ) -> (Arc<AccessControl>, Arc<InMemoryAccessCodeStore>) {
        let store = Arc::new(InMemoryAccessCodeStore::new());
        let registrations = Arc::new(StaticRegistrationDirectory::new());
        registrations.approve(123, 7, None);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
        ));
        let access = AccessControl::new(
            Collaborators {
                store: store.clone(),
                attempts: Arc::new(InMemoryScanAttemptLog::new()),
                registrations,
                attendance: Arc::new(InMemoryAttendanceRecorder::new()),
                anchor,
                clock,
            },
            AccessControlSettings {
                integrity: IntegrityPolicy {
                    timeout: std::time::Duration::from_millis(50),
                    scan_budget: std::time::Duration::from_millis(50),
                    max_attempts: 1,
                    initial_backoff: std::time::Duration::from_millis(1),
                },
                ..Default::default()
            },
        );
        (Arc::new(access), store)
    }

    pub async fn approve_and_issue(access: &AccessControl, registration_id: i64) -> Uuid {
        access
            .issue(registration_id, IssueOptions::default())
            .await
            .unwrap()
            .code
            .id
    }
}
