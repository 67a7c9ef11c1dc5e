//! Many independent runs against one shared reference.

use std::sync::Arc;

use burn::tensor::backend::AutodiffBackend;
use rayon::prelude::*;
use tracing::{info, info_span};
use voxreg_core::Volume;

use crate::error::{RegistrationError, Result};
use crate::pipeline::{Orchestrator, Pipeline, RunInputs, RunOptions, RunReport};

/// Immutable fixed-side data shared by every job of a batch.
#[derive(Debug, Clone)]
pub struct ReferenceData<B: AutodiffBackend> {
    pub fixed: Volume<B>,
    pub fixed_mask: Option<Volume<B>>,
    pub fixed_labels: Option<Volume<B>>,
}

impl<B: AutodiffBackend> ReferenceData<B> {
    pub fn new(fixed: Volume<B>) -> Self {
        Self {
            fixed,
            fixed_mask: None,
            fixed_labels: None,
        }
    }

    pub fn with_mask(mut self, mask: Volume<B>) -> Self {
        self.fixed_mask = Some(mask);
        self
    }

    pub fn with_labels(mut self, labels: Volume<B>) -> Self {
        self.fixed_labels = Some(labels);
        self
    }
}

/// One moving volume (and optional labels) to register.
#[derive(Debug, Clone)]
pub struct BatchJob<B: AutodiffBackend> {
    pub id: String,
    pub moving: Volume<B>,
    pub labels: Option<Volume<B>>,
}

impl<B: AutodiffBackend> BatchJob<B> {
    pub fn new(id: impl Into<String>, moving: Volume<B>) -> Self {
        Self {
            id: id.into(),
            moving,
            labels: None,
        }
    }

    pub fn with_labels(mut self, labels: Volume<B>) -> Self {
        self.labels = Some(labels);
        self
    }
}

#[derive(Debug, Clone)]
pub struct BatchResult<B: AutodiffBackend> {
    pub id: String,
    pub report: RunReport<B>,
}

/// Runs jobs on a bounded thread pool.
///
/// Each job gets its own child cancellation token, so cancelling or timing
/// out one job leaves the others running. Cancelling the token in the
/// options passed to [`BatchRunner::run`] stops every job.
#[derive(Debug)]
pub struct BatchRunner {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl BatchRunner {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(RegistrationError::invalid_configuration("batch needs at least one worker"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("registration-worker-{}", i))
            .build()
            .map_err(|e| RegistrationError::invalid_configuration(format!("failed to build worker pool: {}", e)))?;
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every job; results come back in job order.
    pub fn run<B>(
        &self,
        pipeline: &Pipeline,
        reference: Arc<ReferenceData<B>>,
        jobs: Vec<BatchJob<B>>,
        options: &RunOptions,
    ) -> Vec<BatchResult<B>>
    where
        B: AutodiffBackend,
        Volume<B>: Send + Sync,
    {
        info!(jobs = jobs.len(), workers = self.workers, "batch starting");
        self.pool.install(|| {
            jobs.into_par_iter()
                .map(|job| {
                    let _span = info_span!("batch_job", id = %job.id).entered();
                    let job_options = options.clone().with_cancel(options.cancel.child());
                    let inputs = RunInputs::new(&reference.fixed, &job.moving)
                        .with_labels(job.labels.as_ref())
                        .with_fixed_labels(reference.fixed_labels.as_ref())
                        .with_mask(reference.fixed_mask.as_ref());
                    let report = Orchestrator::run_inputs(pipeline, &inputs, &job_options);
                    info!(id = %job.id, status = ?report.status, "job finished");
                    BatchResult { id: job.id, report }
                })
                .collect()
        })
    }
}
