//! Pre-dispatch guards on the size of a run.

use tracing::warn;

use crate::config::ConfigError;

/// Estimated bytes of event-loss data each task ships back to the reducer.
pub fn bytes_per_task(bytes_per_row: u64, num_events: u64, num_loss_types: u64, num_tasks: u32) -> u64 {
    let total = u128::from(bytes_per_row) * u128::from(num_events) * u128::from(num_loss_types);
    let per_task = total / u128::from(num_tasks.max(1));
    u64::try_from(per_task).unwrap_or(u64::MAX)
}

/// Reject a run whose per-task event-loss payload would exceed `ceiling`.
///
/// Returns the estimate when it fits.
pub fn check_capacity(
    bytes_per_row: u64,
    num_events: u64,
    num_loss_types: u64,
    num_tasks: u32,
    ceiling: u64,
) -> Result<u64, ConfigError> {
    let per_task = bytes_per_task(bytes_per_row, num_events, num_loss_types, num_tasks);
    if per_task > ceiling {
        return Err(ConfigError::CapacityExceeded { num_tasks, bytes_per_task: per_task, ceiling });
    }
    Ok(per_task)
}

/// Warn when an aggregated run would evaluate more than `max_potential_gmfs`
/// asset-events with no minimum loss to prune them. Returns whether it warned.
pub fn warn_if_large(
    num_events: u64,
    num_assets: u64,
    max_potential_gmfs: u64,
    aggregating: bool,
    has_minimum_asset_loss: bool,
) -> bool {
    let potential = u128::from(num_events) * u128::from(num_assets);
    let large = aggregating && !has_minimum_asset_loss && potential > u128::from(max_potential_gmfs);
    if large {
        warn!(
            num_events,
            num_assets,
            potential = potential as f64,
            "The calculation is really big; consider setting minimum_asset_loss"
        );
    }
    large
}
