//! Background work: a fixed pool of workers fed by a crossbeam channel, plus
//! a ticker thread that enqueues the periodic passes.
//!
//! Reply-less tasks are deduplicated while queued, so a slow flush of one
//! table is never stacked up behind copies of itself.

pub mod archive;
pub mod cleanup;
pub mod flush;
pub mod index;
pub mod merge;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use crossbeam::channel::{bounded, never, select, tick, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use crate::core::context::EngineContext;
use crate::core::error::{Error, ErrorKind, Result};

pub type Reply = Sender<Result<()>>;

pub enum Task {
    Flush { table: String, reply: Option<Reply> },
    FlushAll { reply: Option<Reply> },
    Merge { table: String },
    BuildIndex { table: String },
    Archive,
    Cleanup,
}

impl Task {
    fn dedup_key(&self) -> Option<TaskKey> {
        match self {
            Task::Flush { table, reply: None } => Some(TaskKey::Flush(table.clone())),
            Task::Merge { table } => Some(TaskKey::Merge(table.clone())),
            Task::BuildIndex { table } => Some(TaskKey::BuildIndex(table.clone())),
            Task::Archive => Some(TaskKey::Archive),
            Task::Cleanup => Some(TaskKey::Cleanup),
            Task::Flush { reply: Some(_), .. } | Task::FlushAll { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TaskKey {
    Flush(String),
    Merge(String),
    BuildIndex(String),
    Archive,
    Cleanup,
}

struct Queue {
    sender: Sender<Task>,
    queued: Mutex<HashSet<TaskKey>>,
    shutdown: AtomicBool,
}

impl Queue {
    fn submit(&self, task: Task) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::not_ready());
        }
        if let Some(key) = task.dedup_key() {
            if !self.queued.lock().insert(key) {
                return Ok(());
            }
        }
        self.sender
            .send(task)
            .map_err(|_| Error::new(ErrorKind::Internal, "task channel closed".to_string()))
    }

    fn dequeued(&self, task: &Task) {
        if let Some(key) = task.dedup_key() {
            self.queued.lock().remove(&key);
        }
    }
}

pub struct Scheduler {
    queue: Arc<Queue>,
    /// Dropped on shutdown; the disconnect wakes every thread.
    stop: Mutex<Option<Sender<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn start(ctx: Arc<EngineContext>) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let queue = Arc::new(Queue {
            sender,
            queued: Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
        });

        let threads = ctx.config.worker_threads.max(1);
        let mut handles = Vec::with_capacity(threads + 1);
        for n in 0..threads {
            let ctx = Arc::clone(&ctx);
            let queue = Arc::clone(&queue);
            let receiver = receiver.clone();
            let stop = stop_rx.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("vexis-worker-{}", n))
                    .spawn(move || worker_loop(&ctx, &queue, &receiver, &stop))?,
            );
        }

        let ticker = {
            let ctx = Arc::clone(&ctx);
            let queue = Arc::clone(&queue);
            thread::Builder::new()
                .name("vexis-ticker".to_string())
                .spawn(move || ticker_loop(&ctx, &queue, &stop_rx))?
        };
        handles.push(ticker);

        info!(workers = threads, "started background workers");
        Ok(Scheduler {
            queue,
            stop: Mutex::new(Some(stop_tx)),
            handles: Mutex::new(handles),
        })
    }

    /// Enqueue without waiting.
    pub fn submit(&self, task: Task) -> Result<()> {
        self.queue.submit(task)
    }

    /// Flush one table (or all) on a worker and wait for the outcome.
    pub fn flush_and_wait(&self, table: Option<&str>) -> Result<()> {
        let (reply, outcome) = bounded(1);
        let task = match table {
            Some(table) => Task::Flush { table: table.to_string(), reply: Some(reply) },
            None => Task::FlushAll { reply: Some(reply) },
        };
        self.submit(task)?;
        // Reply dropped unanswered means the workers shut down first
        outcome.recv().map_err(|_| Error::not_ready())?
    }

    /// Stop accepting tasks, wake every thread and join them. Tasks still
    /// queued are dropped; their waiters see `NotReady`.
    pub fn shutdown(&self) {
        self.queue.shutdown.store(true, Ordering::Release);
        self.stop.lock().take();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("background thread panicked");
            }
        }
        info!("stopped background workers");
    }
}

fn worker_loop(ctx: &EngineContext, queue: &Queue, tasks: &Receiver<Task>, stop: &Receiver<()>) {
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(tasks) -> task => {
                let Ok(task) = task else { break };
                if queue.shutdown.load(Ordering::Acquire) {
                    break;
                }
                queue.dequeued(&task);
                run(ctx, task);
            }
        }
    }
}

fn run(ctx: &EngineContext, task: Task) {
    match task {
        Task::Flush { table, reply } => {
            let result = flush::flush_table(ctx, &table);
            match reply {
                Some(reply) => {
                    let _ = reply.send(result);
                }
                None => {
                    if let Err(e) = result {
                        ctx.record_flush_failure(&table, e);
                    }
                }
            }
        }
        Task::FlushAll { reply } => {
            let result = flush::flush_all(ctx);
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
        Task::Merge { table } => {
            if let Err(e) = merge::merge_table(ctx, &table) {
                warn!(table = %table, error = %e, "merge pass failed");
            }
        }
        Task::BuildIndex { table } => {
            if let Err(e) = index::build_indexes(ctx, &table) {
                warn!(table = %table, error = %e, "index pass failed");
            }
        }
        Task::Archive => {
            if let Err(e) = archive::run_archive(ctx) {
                warn!(error = %e, "archive pass failed");
            }
        }
        Task::Cleanup => {
            if let Err(e) = cleanup::run_cleanup(ctx) {
                warn!(error = %e, "cleanup pass failed");
            }
        }
    }
}

fn ticker(interval: Duration) -> Receiver<std::time::Instant> {
    if interval.is_zero() { never() } else { tick(interval) }
}

fn ticker_loop(ctx: &EngineContext, queue: &Queue, stop: &Receiver<()>) {
    let flush_tick = ticker(Duration::from_millis(ctx.config.auto_flush_interval_ms));
    let merge_tick = ticker(Duration::from_millis(ctx.config.merge_interval_ms));
    let archive_tick = ticker(Duration::from_secs(ctx.config.archive_interval_secs));

    let submit = |task: Task| {
        if let Err(e) = queue.submit(task) {
            debug!(error = %e, "periodic task not queued");
        }
    };

    loop {
        select! {
            recv(stop) -> _ => break,
            recv(flush_tick) -> _ => {
                for table in ctx.memtables.pending_tables() {
                    submit(Task::Flush { table, reply: None });
                }
            }
            recv(merge_tick) -> _ => {
                for table in ctx.meta.all_tables() {
                    submit(Task::Merge { table: table.name.clone() });
                    submit(Task::BuildIndex { table: table.name });
                }
                submit(Task::Cleanup);
            }
            recv(archive_tick) -> _ => submit(Task::Archive),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_less_tasks_are_deduplicated_while_queued() {
        let (sender, receiver) = unbounded();
        let queue = Queue {
            sender,
            queued: Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
        };

        queue.submit(Task::Merge { table: "t".to_string() }).unwrap();
        queue.submit(Task::Merge { table: "t".to_string() }).unwrap();
        queue.submit(Task::Merge { table: "u".to_string() }).unwrap();
        assert_eq!(receiver.len(), 2);

        let task = receiver.recv().unwrap();
        queue.dequeued(&task);
        queue.submit(Task::Merge { table: "t".to_string() }).unwrap();
        assert_eq!(receiver.len(), 2);
    }

    #[test]
    fn tasks_with_replies_are_never_merged() {
        let (sender, receiver) = unbounded();
        let queue = Queue {
            sender,
            queued: Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
        };
        let (reply, _outcome) = bounded(1);
        queue.submit(Task::Flush { table: "t".to_string(), reply: Some(reply.clone()) }).unwrap();
        queue.submit(Task::Flush { table: "t".to_string(), reply: Some(reply) }).unwrap();
        assert_eq!(receiver.len(), 2);

        queue.shutdown.store(true, Ordering::Release);
        assert!(queue.submit(Task::Archive).unwrap_err().is(ErrorKind::NotReady));
    }
}
