use std::collections::{BTreeMap, HashSet};

use crate::store::{ColumnData, StoreError};

/// One row of the event loss table, first value column only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventLoss {
    pub event_id: u32,
    pub agg_id: u16,
    pub loss_id: u8,
    pub loss: f64,
}

/// Rows from the columns of a stored event loss table
/// (`event_id`, `agg_id`, `loss_id`, then the value columns).
pub fn event_losses(columns: &[ColumnData]) -> Result<Vec<EventLoss>, StoreError> {
    let [ColumnData::U32(eids), ColumnData::U16(kids), ColumnData::U8(lids), ColumnData::F64(values), ..] =
        columns
    else {
        return Err(StoreError::MalformedRow {
            table: "agg_loss_table".to_string(),
            line: 0,
            detail: "expected event_id, agg_id, loss_id and a value column".to_string(),
        });
    };
    Ok((0..eids.len())
        .map(|i| EventLoss { event_id: eids[i], agg_id: kids[i], loss_id: lids[i], loss: values[i] })
        .collect())
}

/// Distribution statistics for a continuous metric.
#[derive(Debug, Clone, PartialEq)]
pub struct DistStats {
    pub n: usize,
    pub min: f64,
    pub p5: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

pub fn percentile_stats(values: &mut [f64]) -> Option<DistStats> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();

    let interp = |p: f64| -> f64 {
        let h = p * (n - 1) as f64;
        let lo = h.floor() as usize;
        let hi = (lo + 1).min(n - 1);
        let frac = h - lo as f64;
        values[lo] * (1.0 - frac) + values[hi] * frac
    };

    let mean = values.iter().sum::<f64>() / n as f64;
    let variance = if n > 1 {
        values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64
    } else {
        0.0
    };

    Some(DistStats {
        n,
        min: values[0],
        p5: interp(0.05),
        p25: interp(0.25),
        p50: interp(0.50),
        p75: interp(0.75),
        p95: interp(0.95),
        max: values[n - 1],
        mean,
        std_dev: variance.sqrt(),
    })
}

/// Per-event loss distribution of one aggregation key and loss type.
/// Events without a row for the key do not count.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyDist {
    pub agg_id: u16,
    pub loss_id: u8,
    pub loss: DistStats,
}

/// Sorted by key, then loss type.
pub fn key_distributions(rows: &[EventLoss]) -> Vec<KeyDist> {
    let mut groups: BTreeMap<(u16, u8), Vec<f64>> = BTreeMap::new();
    for row in rows {
        groups.entry((row.agg_id, row.loss_id)).or_default().push(row.loss);
    }
    groups
        .into_iter()
        .filter_map(|((agg_id, loss_id), mut losses)| {
            percentile_stats(&mut losses).map(|loss| KeyDist { agg_id, loss_id, loss })
        })
        .collect()
}

/// Largest total-key losses for one loss type, descending.
pub fn top_events(rows: &[EventLoss], num_keys: u16, loss_id: u8, n: usize) -> Vec<(u32, f64)> {
    let mut totals: Vec<(u32, f64)> = rows
        .iter()
        .filter(|r| r.agg_id == num_keys && r.loss_id == loss_id)
        .map(|r| (r.event_id, r.loss))
        .collect();
    totals.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
    totals.truncate(n);
    totals
}

/// An inconsistency found in a stored event loss table.
#[derive(Debug, Clone, PartialEq)]
pub enum TableViolation {
    /// More than one row for the same `(event, key, loss type)`.
    DuplicateRow { event_id: u32, agg_id: u16, loss_id: u8 },
    /// A key outside `0..=K`.
    KeyOutOfRange { event_id: u32, agg_id: u16 },
    /// Explicit-key rows without a total row.
    MissingTotal { event_id: u32, loss_id: u8 },
    /// Total row differs from the sum of the explicit keys.
    TotalMismatch { event_id: u32, loss_id: u8, total: f64, sum: f64 },
    NegativeLoss { event_id: u32, agg_id: u16, loss: f64 },
}

impl std::fmt::Display for TableViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateRow { event_id, agg_id, loss_id } => {
                write!(f, "DuplicateRow event={event_id} key={agg_id} loss_type={loss_id}")
            }
            Self::KeyOutOfRange { event_id, agg_id } => {
                write!(f, "KeyOutOfRange event={event_id} key={agg_id}")
            }
            Self::MissingTotal { event_id, loss_id } => {
                write!(f, "MissingTotal event={event_id} loss_type={loss_id}")
            }
            Self::TotalMismatch { event_id, loss_id, total, sum } => {
                write!(f, "TotalMismatch event={event_id} loss_type={loss_id}: total={total} sum={sum}")
            }
            Self::NegativeLoss { event_id, agg_id, loss } => {
                write!(f, "NegativeLoss event={event_id} key={agg_id}: {loss}")
            }
        }
    }
}

/// Check the structural invariants of an event loss table with `num_keys`
/// explicit keys: unique rows, keys in range, and a total row equal to the
/// sum of the explicit keys (relative tolerance `rtol`).
pub fn verify_table(rows: &[EventLoss], num_keys: u16, rtol: f64) -> Vec<TableViolation> {
    let mut violations = Vec::new();
    let mut seen = HashSet::new();
    // (event, loss type) -> (sum of explicit keys, total)
    let mut sums: BTreeMap<(u32, u8), (f64, Option<f64>)> = BTreeMap::new();

    for row in rows {
        if !seen.insert((row.event_id, row.agg_id, row.loss_id)) {
            violations.push(TableViolation::DuplicateRow {
                event_id: row.event_id,
                agg_id: row.agg_id,
                loss_id: row.loss_id,
            });
            continue;
        }
        if row.agg_id > num_keys {
            violations.push(TableViolation::KeyOutOfRange { event_id: row.event_id, agg_id: row.agg_id });
            continue;
        }
        if row.loss < 0.0 {
            violations.push(TableViolation::NegativeLoss {
                event_id: row.event_id,
                agg_id: row.agg_id,
                loss: row.loss,
            });
        }
        let entry = sums.entry((row.event_id, row.loss_id)).or_insert((0.0, None));
        if row.agg_id == num_keys {
            entry.1 = Some(row.loss);
        } else {
            entry.0 += row.loss;
        }
    }

    for ((event_id, loss_id), (sum, total)) in sums {
        match total {
            None => violations.push(TableViolation::MissingTotal { event_id, loss_id }),
            Some(total) if num_keys > 0 && (total - sum).abs() > 1e-8 + rtol * sum.abs() => {
                violations.push(TableViolation::TotalMismatch { event_id, loss_id, total, sum });
            }
            Some(_) => {}
        }
    }
    violations
}
