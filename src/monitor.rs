//! Timing record carried by each task, and the reducer's merged view of it.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::TaskNo;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OpStats {
    pub calls: u32,
    pub secs: f64,
}

/// Diagnostics reported by a finished task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_no: TaskNo,
    /// Rayon worker index; `u32::MAX` when run outside the pool.
    pub worker_id: u32,
    pub row_count: u64,
    pub byte_count: u64,
    pub elapsed_secs: f64,
    pub ops: BTreeMap<String, OpStats>,
}

pub struct Monitor {
    task_no: TaskNo,
    started: Instant,
    ops: BTreeMap<String, OpStats>,
}

impl Monitor {
    pub fn new(task_no: TaskNo) -> Self {
        Monitor { task_no, started: Instant::now(), ops: BTreeMap::new() }
    }

    pub fn task_no(&self) -> TaskNo {
        self.task_no
    }

    /// Run `f`, charging its wall time to `op`.
    pub fn measure<T>(&mut self, op: &str, f: impl FnOnce() -> T) -> T {
        let t0 = Instant::now();
        let out = f();
        let stats = self.ops.entry(op.to_string()).or_default();
        stats.calls += 1;
        stats.secs += t0.elapsed().as_secs_f64();
        out
    }

    pub fn task_info(&self, row_count: u64, byte_count: u64) -> TaskInfo {
        let info = TaskInfo {
            task_no: self.task_no,
            worker_id: rayon::current_thread_index().map_or(u32::MAX, |i| i as u32),
            row_count,
            byte_count,
            elapsed_secs: self.started.elapsed().as_secs_f64(),
            ops: self.ops.clone(),
        };
        debug!(
            task_no = info.task_no.0,
            worker_id = info.worker_id,
            rows = row_count,
            elapsed_ms = info.elapsed_secs * 1e3,
            "task done"
        );
        info
    }
}

/// Per-operation totals over every task of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformanceReport {
    pub tasks: u32,
    pub rows: u64,
    pub bytes: u64,
    pub slowest: Option<(TaskNo, f64)>,
    pub ops: BTreeMap<String, OpStats>,
}

impl PerformanceReport {
    pub fn add(&mut self, info: &TaskInfo) {
        self.tasks += 1;
        self.rows += info.row_count;
        self.bytes += info.byte_count;
        if self.slowest.is_none_or(|(_, s)| info.elapsed_secs > s) {
            self.slowest = Some((info.task_no, info.elapsed_secs));
        }
        for (op, stats) in &info.ops {
            let total = self.ops.entry(op.clone()).or_default();
            total.calls += stats.calls;
            total.secs += stats.secs;
        }
    }

    pub fn log(&self) {
        info!(tasks = self.tasks, rows = self.rows, bytes = self.bytes, "task totals");
        if let Some((task_no, secs)) = self.slowest {
            info!(task_no = task_no.0, elapsed_ms = secs * 1e3, "slowest task");
        }
        for (op, stats) in &self.ops {
            info!(op = op.as_str(), calls = stats.calls, secs = stats.secs, "operation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measure_counts_calls() {
        let mut mon = Monitor::new(TaskNo(3));
        let x = mon.measure("computing risk", || 2 + 2);
        mon.measure("computing risk", || ());
        mon.measure("aggregating losses", || ());
        assert_eq!(x, 4);
        let info = mon.task_info(10, 80);
        assert_eq!(info.task_no, TaskNo(3));
        assert_eq!(info.worker_id, u32::MAX);
        assert_eq!(info.ops["computing risk"].calls, 2);
        assert_eq!(info.ops.len(), 2);
    }

    #[test]
    fn report_merges_tasks() {
        let mut report = PerformanceReport::default();
        let mut a = Monitor::new(TaskNo(0));
        a.measure("computing risk", || ());
        let mut b = Monitor::new(TaskNo(1));
        b.measure("computing risk", || ());
        report.add(&a.task_info(3, 30));
        report.add(&b.task_info(4, 40));
        assert_eq!(report.tasks, 2);
        assert_eq!(report.rows, 7);
        assert_eq!(report.bytes, 70);
        assert_eq!(report.ops["computing risk"].calls, 2);
        assert!(report.slowest.is_some());
    }
}
