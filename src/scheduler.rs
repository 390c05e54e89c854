//! Bounded worker pool feeding a single reducer.
//!
//! Tasks run on a rayon pool and report over an mpsc channel; the calling
//! thread is the only consumer. A task may spawn sub-tasks on the same pool,
//! whose outputs reach the same reducer.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread;

use rayon::{Scope, ThreadPool, ThreadPoolBuilder};
use tracing::{debug, warn};

use crate::error::RiskError;
use crate::task::TaskError;
use crate::types::TaskNo;

enum Message<O> {
    Output(TaskNo, O),
    Done(TaskNo),
    Failed(TaskNo, TaskError),
    Panicked(TaskNo, String),
    Skipped(TaskNo),
}

/// Given to each running task to send outputs and spawn sub-tasks.
pub struct TaskHandle<'a, U, O> {
    task_no: TaskNo,
    tx: &'a Sender<Message<O>>,
    spawn: &'a dyn Fn(U),
}

impl<U, O> TaskHandle<'_, U, O> {
    pub fn task_no(&self) -> TaskNo {
        self.task_no
    }

    pub fn emit(&self, output: O) {
        // The receiver outlives every sender.
        let _ = self.tx.send(Message::Output(self.task_no, output));
    }

    /// Queue `unit` as a new task on the same pool.
    pub fn spawn(&self, unit: U) {
        (self.spawn)(unit)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Tasks numbered, sub-tasks included.
    pub tasks: u32,
    pub completed: u32,
    /// Tasks dropped because an earlier task failed.
    pub skipped: u32,
    pub outputs: u64,
}

struct Dispatch<'s, W> {
    work: &'s W,
    abort: &'s AtomicBool,
    next_no: &'s AtomicU32,
}

impl<W> Clone for Dispatch<'_, W> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<W> Copy for Dispatch<'_, W> {}

impl<W> Dispatch<'_, W> {
    fn next_task_no(&self) -> TaskNo {
        TaskNo(self.next_no.fetch_add(1, Ordering::SeqCst))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return s.to_string();
    }
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(_) => "unknown panic payload".to_string(),
    }
}

fn spawn_unit<'s, U, O, W>(scope: &Scope<'s>, d: Dispatch<'s, W>, tx: Sender<Message<O>>, unit: U)
where
    U: Send + 's,
    O: Send + 's,
    W: Fn(&TaskHandle<'_, U, O>, U) -> Result<(), TaskError> + Sync + 's,
{
    let task_no = d.next_task_no();
    scope.spawn(move |scope| {
        if d.abort.load(Ordering::SeqCst) {
            let _ = tx.send(Message::Skipped(task_no));
            return;
        }
        let spawn_sub = |sub: U| spawn_unit(scope, d, tx.clone(), sub);
        let handle = TaskHandle { task_no, tx: &tx, spawn: &spawn_sub };
        let message = match panic::catch_unwind(AssertUnwindSafe(|| (d.work)(&handle, unit))) {
            Ok(Ok(())) => Message::Done(task_no),
            Ok(Err(err)) => {
                d.abort.store(true, Ordering::SeqCst);
                Message::Failed(task_no, err)
            }
            Err(payload) => {
                d.abort.store(true, Ordering::SeqCst);
                Message::Panicked(task_no, panic_message(payload))
            }
        };
        let _ = tx.send(message);
    });
}

pub struct Scheduler {
    pool: ThreadPool,
}

impl Scheduler {
    /// `num_workers == 0` lets rayon pick the thread count.
    pub fn new(num_workers: usize) -> Result<Self, RiskError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|i| format!("ebrisk-worker-{i}"))
            .build()?;
        Ok(Scheduler { pool })
    }

    pub fn num_workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `work` on every unit and feed each output to `reduce` on the
    /// calling thread, in arrival order.
    ///
    /// The first task failure, panic or reducer error stops dispatch: tasks
    /// not yet started are skipped, outputs still in flight are dropped, and
    /// that first error is returned.
    pub fn run<U, O, W, R>(&self, units: Vec<U>, work: W, mut reduce: R) -> Result<RunSummary, RiskError>
    where
        U: Send,
        O: Send,
        W: Fn(&TaskHandle<'_, U, O>, U) -> Result<(), TaskError> + Sync,
        R: FnMut(TaskNo, O) -> Result<(), RiskError>,
    {
        let (tx, rx) = mpsc::channel::<Message<O>>();
        let abort = AtomicBool::new(false);
        let next_no = AtomicU32::new(0);
        let dispatch = Dispatch { work: &work, abort: &abort, next_no: &next_no };
        let pool = &self.pool;

        let mut summary = RunSummary::default();
        let mut first_error: Option<RiskError> = None;

        thread::scope(|s| {
            s.spawn(move || {
                pool.scope(|scope| {
                    for unit in units {
                        spawn_unit(scope, dispatch, tx.clone(), unit);
                    }
                });
                drop(tx);
            });

            for message in &rx {
                match message {
                    Message::Output(task_no, output) => {
                        summary.outputs += 1;
                        if first_error.is_some() {
                            continue;
                        }
                        if let Err(err) = reduce(task_no, output) {
                            abort.store(true, Ordering::SeqCst);
                            first_error = Some(err);
                        }
                    }
                    Message::Done(_) => summary.completed += 1,
                    Message::Skipped(_) => summary.skipped += 1,
                    Message::Failed(task_no, source) => {
                        warn!(task_no = task_no.0, error = %source, "task failed");
                        first_error.get_or_insert(RiskError::Task { task_no, source });
                    }
                    Message::Panicked(task_no, message) => {
                        warn!(task_no = task_no.0, message = message.as_str(), "task panicked");
                        first_error.get_or_insert(RiskError::WorkerPanicked { task_no, message });
                    }
                }
            }
        });

        summary.tasks = next_no.load(Ordering::SeqCst);
        debug!(
            tasks = summary.tasks,
            completed = summary.completed,
            skipped = summary.skipped,
            outputs = summary.outputs,
            "all tasks reported"
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}
