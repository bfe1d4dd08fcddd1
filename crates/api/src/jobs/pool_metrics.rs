//! Periodic gauges for the connection pool and the scan rate limiter.

use sqlx::PgPool;
use std::sync::Arc;

use crate::middleware::RateLimiterState;

use super::scheduler::{Job, JobFrequency};

pub struct PoolMetricsJob {
    pool: PgPool,
    rate_limiter: Arc<RateLimiterState>,
}

impl PoolMetricsJob {
    pub fn new(pool: PgPool, rate_limiter: Arc<RateLimiterState>) -> Self {
        Self { pool, rate_limiter }
    }
}

#[async_trait::async_trait]
impl Job for PoolMetricsJob {
    fn name(&self) -> &'static str {
        "pool_metrics"
    }

    fn frequency(&self) -> JobFrequency {
        JobFrequency::Seconds(15)
    }

    async fn execute(&self) -> Result<(), String> {
        persistence::metrics::record_pool_metrics(&self.pool);
        self.rate_limiter.prune();
        metrics::gauge!("scan_rate_limiter_tracked_access_points")
            .set(self.rate_limiter.tracked_access_points() as f64);
        Ok(())
    }
}
