use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::join_all;

use crate::models::{DueFaculty, RunStats};
use crate::pipeline::{FacultyPipeline, PipelineOutcome};

/// Sleep abstraction so pacing is testable without real wall-clock delays.
#[async_trait]
pub trait Sleep: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleep;

#[async_trait]
impl Sleep for TokioSleep {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Pacing policy for a dispatch run.
///
/// `batch_size` bounds simultaneous workers; `stagger` spaces launches
/// inside a batch so the generation API does not see a thundering herd;
/// `inter_batch_delay` separates consecutive batches.
#[derive(Debug, Clone)]
pub struct Pacing {
    pub batch_size: usize,
    pub stagger: Duration,
    pub inter_batch_delay: Duration,
}

/// Fans the due-set out to the per-faculty pipeline in bounded, paced
/// batches and aggregates terminal outcomes.
pub struct Dispatcher {
    pipeline: Arc<FacultyPipeline>,
    pacing: Pacing,
    sleep: Arc<dyn Sleep>,
}

impl Dispatcher {
    pub fn new(pipeline: Arc<FacultyPipeline>, pacing: Pacing, sleep: Arc<dyn Sleep>) -> Self {
        Self {
            pipeline,
            pacing,
            sleep,
        }
    }

    /// Process `due` in consecutive batches, in selection order. A worker
    /// panic is caught, logged, and counted as `failed`; it never aborts
    /// its batch.
    pub async fn dispatch(&self, due: Vec<DueFaculty>, today: NaiveDate) -> RunStats {
        let mut stats = RunStats::default();
        if due.is_empty() {
            return stats;
        }

        let batch_size = self.pacing.batch_size.max(1);
        let total_batches = due.len().div_ceil(batch_size);
        tracing::info!(
            faculty = due.len(),
            batch_size,
            total_batches,
            "dispatching due faculty"
        );

        for (batch_index, batch) in due.chunks(batch_size).enumerate() {
            if batch_index > 0 {
                tracing::debug!(
                    delay_secs = self.pacing.inter_batch_delay.as_secs(),
                    "waiting before next batch"
                );
                self.sleep.sleep(self.pacing.inter_batch_delay).await;
            }
            tracing::info!(
                batch = batch_index + 1,
                total_batches,
                size = batch.len(),
                "processing batch"
            );

            let handles: Vec<_> = batch
                .iter()
                .enumerate()
                .map(|(position, record)| {
                    let pipeline = Arc::clone(&self.pipeline);
                    let sleep = Arc::clone(&self.sleep);
                    let stagger = self.pacing.stagger;
                    let profile = record.profile.clone();
                    tokio::spawn(async move {
                        if position > 0 {
                            sleep.sleep(stagger * position as u32).await;
                        }
                        pipeline.process(&profile, today).await
                    })
                })
                .collect();

            for (result, record) in join_all(handles).await.into_iter().zip(batch) {
                stats.processed += 1;
                match result {
                    Ok(PipelineOutcome::Sent { .. }) => stats.sent += 1,
                    Ok(PipelineOutcome::Skipped) => stats.skipped += 1,
                    Ok(PipelineOutcome::Failed { .. }) => stats.failed += 1,
                    Err(error) => {
                        tracing::error!(
                            email = %record.profile.email,
                            %error,
                            "pipeline worker panicked"
                        );
                        stats.failed += 1;
                    }
                }
            }
        }

        stats
    }
}
