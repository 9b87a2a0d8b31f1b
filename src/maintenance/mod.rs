//! # Maintenance
//!
//! Periodic prioritizer and bounded work queue for range upkeep.
//!
//! Every tick the scheduler gathers [`MaintenanceData`] from each live
//! range (skipping busy ones), scores the candidates — splits first,
//! then cache flushes, then memory-pressure flushes informed by the
//! recent bytes-loaded counter — and enqueues the winners on a bounded
//! queue drained by worker threads. A full queue sheds tasks; the next
//! tick re-evaluates.

#[cfg(test)]
mod tests;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Instant,
};

use crossbeam::channel::{Receiver, Sender, bounded};
use tracing::{debug, info, warn};

use crate::context::ServerConfig;
use crate::range::{MaintenanceData, Range};

// ------------------------------------------------------------------------------------------------
// Tasks
// ------------------------------------------------------------------------------------------------

/// One unit of maintenance work.
pub enum MaintenanceTask {
    /// Drive the range's split machine.
    Split {
        /// Target range.
        range: Arc<Range>,
    },

    /// Compact the range (`major` merges every store).
    Compact {
        /// Target range.
        range: Arc<Range>,
        /// Full merge instead of a flush.
        major: bool,
    },

    /// Flush caches under memory pressure (a minor compaction).
    Flush {
        /// Target range.
        range: Arc<Range>,
    },
}

impl MaintenanceTask {
    fn run(self) {
        let (name, result) = match self {
            Self::Split { range } => (range.name(), range.split()),
            Self::Compact { range, major } => (range.name(), range.compact(major)),
            Self::Flush { range } => (range.name(), range.compact(false)),
        };
        if let Err(e) = result {
            warn!(range = %name, error = %e, "maintenance task failed");
        }
    }
}

impl std::fmt::Debug for MaintenanceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Split { range } => write!(f, "Split({})", range.name()),
            Self::Compact { range, major } => write!(f, "Compact({}, major={major})", range.name()),
            Self::Flush { range } => write!(f, "Flush({})", range.name()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Queue
// ------------------------------------------------------------------------------------------------

/// Bounded task queue drained by worker threads.
pub struct MaintenanceQueue {
    sender: Sender<MaintenanceTask>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for MaintenanceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceQueue")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl MaintenanceQueue {
    /// Starts `workers` threads over a queue of `depth` slots.
    pub fn new(workers: usize, depth: usize) -> Self {
        let (sender, receiver) = bounded(depth.max(1));
        let workers = (0..workers.max(1))
            .map(|index| {
                let receiver: Receiver<MaintenanceTask> = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("maintenance-{index}"))
                    .spawn(move || {
                        for task in receiver {
                            debug!(?task, "maintenance task starting");
                            task.run();
                        }
                    })
                    .expect("spawning maintenance worker")
            })
            .collect();

        Self { sender, workers }
    }

    /// Enqueues a task; returns `false` when the queue is full (the
    /// next tick will retry).
    pub fn enqueue(&self, task: MaintenanceTask) -> bool {
        match self.sender.try_send(task) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "maintenance queue full, shedding task");
                false
            }
        }
    }

    /// Stops the workers after the queue drains.
    pub fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Stats
// ------------------------------------------------------------------------------------------------

/// Load signal feeding the prioritizer: bytes accepted by the server
/// since the last tick.
#[derive(Debug, Default)]
pub struct Stats {
    bytes_loaded: AtomicU64,
}

impl Stats {
    /// Records bytes accepted by the write path.
    pub fn update_stats_bytes_loaded(&self, n: u64) {
        self.bytes_loaded.fetch_add(n, Ordering::Relaxed);
    }

    /// Drains the counter (called once per tick).
    fn take_bytes_loaded(&self) -> u64 {
        self.bytes_loaded.swap(0, Ordering::Relaxed)
    }
}

// ------------------------------------------------------------------------------------------------
// Scheduler
// ------------------------------------------------------------------------------------------------

struct SchedulerInner {
    last_tick: Option<Instant>,
    scheduling_needed: bool,
}

/// Periodic maintenance prioritizer.
pub struct MaintenanceScheduler {
    queue: MaintenanceQueue,
    stats: Stats,
    inner: Mutex<SchedulerInner>,
    config: ServerConfig,
    stopped: AtomicBool,
}

impl std::fmt::Debug for MaintenanceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceScheduler").finish_non_exhaustive()
    }
}

/// A scored task candidate; lower `priority` runs first.
struct Candidate {
    priority: u8,
    score: u64,
    task: MaintenanceTask,
}

impl MaintenanceScheduler {
    /// Creates the scheduler and starts its worker pool.
    pub fn new(config: ServerConfig) -> Self {
        let queue = MaintenanceQueue::new(config.maintenance_workers, config.maintenance_queue_depth);
        Self {
            queue,
            stats: Stats::default(),
            inner: Mutex::new(SchedulerInner {
                last_tick: None,
                scheduling_needed: false,
            }),
            config,
            stopped: AtomicBool::new(false),
        }
    }

    /// Records accepted write bytes, informing flush pressure.
    pub fn update_stats_bytes_loaded(&self, n: u64) {
        self.stats.update_stats_bytes_loaded(n);
    }

    /// Forces the next [`MaintenanceScheduler::schedule`] call to run
    /// regardless of the interval.
    pub fn need_scheduling(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.scheduling_needed = true;
        }
    }

    /// One scheduling pass over the live ranges.
    ///
    /// Returns the number of tasks enqueued; `0` may simply mean the
    /// interval has not elapsed.
    pub fn schedule(&self, ranges: &[Arc<Range>]) -> usize {
        {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(_) => return 0,
            };

            let due = match inner.last_tick {
                None => true,
                Some(last) => last.elapsed() >= self.config.maintenance_interval,
            };
            if !due && !inner.scheduling_needed {
                return 0;
            }
            inner.last_tick = Some(Instant::now());
            inner.scheduling_needed = false;
        }

        let bytes_loaded = self.stats.take_bytes_loaded();
        let mut candidates = Vec::new();

        for range in ranges {
            let data = range.get_maintenance_data();
            if data.busy {
                continue;
            }
            if let Some(candidate) = self.prioritize(range, &data, bytes_loaded) {
                candidates.push(candidate);
            }
        }

        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.score.cmp(&a.score))
        });

        let mut enqueued = 0usize;
        for candidate in candidates {
            if !self.queue.enqueue(candidate.task) {
                break;
            }
            enqueued += 1;
        }

        if enqueued > 0 {
            info!(enqueued, bytes_loaded, "maintenance scheduled");
        }
        enqueued
    }

    /// Scores one range. Splits dominate, then over-limit caches, then
    /// memory-pressure flushes when the server is absorbing writes.
    fn prioritize(
        &self,
        range: &Arc<Range>,
        data: &MaintenanceData,
        bytes_loaded: u64,
    ) -> Option<Candidate> {
        if data.needs_split {
            return Some(Candidate {
                priority: 0,
                score: data.disk_usage.saturating_mul(100) / data.soft_limit.max(1),
                task: MaintenanceTask::Split {
                    range: Arc::clone(range),
                },
            });
        }

        if data.compaction_needed {
            return Some(Candidate {
                priority: 1,
                score: data.memory_usage,
                task: MaintenanceTask::Compact {
                    range: Arc::clone(range),
                    major: false,
                },
            });
        }

        // Absorbing writes and carrying a nontrivial cache: flush the
        // heaviest ranges early so the commit log stays prunable.
        if bytes_loaded > 0
            && data.memory_usage >= (self.config.access_group_max_mem as u64) / 2
        {
            return Some(Candidate {
                priority: 2,
                score: data.memory_usage,
                task: MaintenanceTask::Flush {
                    range: Arc::clone(range),
                },
            });
        }

        None
    }

    /// Spawns a background loop calling [`MaintenanceScheduler::schedule`]
    /// on the configured interval until [`MaintenanceScheduler::stop`].
    pub fn start<F>(self: &Arc<Self>, ranges: F) -> JoinHandle<()>
    where
        F: Fn() -> Vec<Arc<Range>> + Send + 'static,
    {
        let scheduler = Arc::clone(self);
        std::thread::Builder::new()
            .name("maintenance-scheduler".into())
            .spawn(move || {
                while !scheduler.stopped.load(Ordering::Acquire) {
                    scheduler.schedule(&ranges());
                    std::thread::sleep(scheduler.config.maintenance_interval.min(
                        std::time::Duration::from_millis(250),
                    ));
                }
            })
            .expect("spawning maintenance scheduler")
    }

    /// Stops the background loop (workers keep draining the queue until
    /// the scheduler is dropped or shut down).
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Stops the loop and joins the worker pool.
    pub fn shutdown(self) {
        self.stop();
        self.queue.shutdown();
    }
}
