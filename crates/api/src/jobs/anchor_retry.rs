//! Anchors active codes that were issued while the anchor service was away.

use std::sync::Arc;
use tracing::info;

use domain::services::AccessControl;

use super::scheduler::{Job, JobFrequency};

pub struct AnchorRetryJob {
    access: Arc<AccessControl>,
    batch_size: i64,
}

impl AnchorRetryJob {
    pub fn new(access: Arc<AccessControl>, batch_size: i64) -> Self {
        Self { access, batch_size }
    }
}

#[async_trait::async_trait]
impl Job for AnchorRetryJob {
    fn name(&self) -> &'static str {
        "anchor_retry"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Minutes(1)
    }

    async fn execute(&self) -> Result<(), String> {
        if !self.access.anchoring_enabled() {
            return Ok(());
        }

        let summary = self
            .access
            .anchor_pending(self.batch_size)
            .await
            .map_err(|e| format!("Failed to list unanchored codes: {}", e))?;

        if summary.processed > 0 {
            info!(
                processed = summary.processed,
                failed = summary.failed,
                "Anchored pending access codes"
            );
        }
        Ok(())
    }
}
