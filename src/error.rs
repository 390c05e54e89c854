use thiserror::Error;

use crate::config::ConfigError;
use crate::partition::PartitionError;
use crate::store::StoreError;
use crate::task::TaskError;
use crate::types::TaskNo;

/// Everything that can stop a run.
#[derive(Debug, Error)]
pub enum RiskError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("task {} failed: {source}", task_no.0)]
    Task { task_no: TaskNo, source: TaskError },
    #[error("task {} panicked: {message}", task_no.0)]
    WorkerPanicked { task_no: TaskNo, message: String },
    #[error("No GMFs were generated, perhaps they were all below the minimum_intensity threshold")]
    NoGmfs,
    #[error("cannot build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
