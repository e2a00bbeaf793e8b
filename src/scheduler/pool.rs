//! Fixed worker-thread pool (§4.F): each worker owns a set of partition
//! slots and cooperatively steps one cell per slot per pass, using a
//! `Mutex`-guarded queue plus a `Condvar` for idle wakeup, generalized
//! from one shared task queue to per-worker partition slots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, trace};

use crate::external::OwnershipOracle;
use crate::observability::metrics;
use crate::partition::PartitionState;
use crate::scheduler::suspend::SuspendState;

/// Default idle wait between polls of a worker's slots (§4.F step 2).
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(250);

struct WorkerSlots {
    partitions: Mutex<Vec<Arc<PartitionState>>>,
    wake: Condvar,
}

pub struct AsyncPool {
    workers: Vec<WorkerSlots>,
    running: AtomicBool,
    suspend: SuspendState,
    oracle: Arc<dyn OwnershipOracle>,
}

impl AsyncPool {
    /// Spawns `num_workers` threads and returns the shared handle used to
    /// add partitions and to suspend/resume the pool.
    pub fn start(num_workers: usize, oracle: Arc<dyn OwnershipOracle>) -> Arc<AsyncPool> {
        let pool = Arc::new(AsyncPool {
            workers: (0..num_workers)
                .map(|_| WorkerSlots { partitions: Mutex::new(Vec::new()), wake: Condvar::new() })
                .collect(),
            running: AtomicBool::new(true),
            suspend: SuspendState::new(num_workers),
            oracle,
        });
        for worker_id in 0..num_workers {
            let pool = pool.clone();
            thread::spawn(move || AsyncPool::worker_loop(pool, worker_id));
        }
        pool
    }

    pub fn stop(&self) {
        info!("stopping async pool");
        self.running.store(false, Ordering::SeqCst);
        for worker in &self.workers {
            worker.wake.notify_all();
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Raises the suspend flag and blocks until every worker has
    /// acknowledged idle (§4.F "Suspend/Resume"). Required around schema
    /// changes, partition map changes, and table initialization.
    pub fn suspend(&self) {
        metrics::SUSPEND_TOTAL.inc();
        self.suspend.suspend();
        metrics::WORKERS_SUSPENDED.set(self.suspend.suspended_worker_count() as f64);
        for worker in &self.workers {
            worker.wake.notify_all();
        }
    }

    pub fn resume(&self) {
        self.suspend.resume();
        metrics::WORKERS_SUSPENDED.set(self.suspend.suspended_worker_count() as f64);
        for worker in &self.workers {
            worker.wake.notify_all();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend.is_suspended()
    }

    /// Places a new partition on the worker with the fewest slots, ties
    /// broken by lowest worker id (§4.F "least-busy placement"). Rebalancing
    /// on removal is not performed.
    pub fn add_partition(&self, partition: Arc<PartitionState>) -> usize {
        let worker_id = self
            .workers
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| w.partitions.lock().unwrap().len())
            .map(|(id, _)| id)
            .expect("pool has at least one worker");
        debug!("placing partition {} on worker {}", partition.id(), worker_id);
        self.workers[worker_id].partitions.lock().unwrap().push(partition);
        self.workers[worker_id].wake.notify_all();
        worker_id
    }

    pub fn worker_slot_count(&self, worker_id: usize) -> usize {
        self.workers[worker_id].partitions.lock().unwrap().len()
    }

    fn worker_loop(pool: Arc<AsyncPool>, worker_id: usize) {
        info!("worker {worker_id} starting");
        while pool.running.load(Ordering::SeqCst) {
            if pool.suspend.is_suspended() {
                pool.suspend.park_worker();
                continue;
            }
            let want_more = pool.run_slots_once(worker_id);
            if !want_more && pool.running.load(Ordering::SeqCst) {
                let worker = &pool.workers[worker_id];
                let guard = worker.partitions.lock().unwrap();
                let _ = worker.wake.wait_timeout(guard, DEFAULT_POLL_TIMEOUT).unwrap();
            }
        }
        info!("worker {worker_id} stopped");
    }

    /// Runs one step on every slot assigned to `worker_id`, sweeping
    /// partitions marked for deletion that have drained their cell queue.
    /// Returns true if any slot has more runnable work (§4.F step 3).
    fn run_slots_once(&self, worker_id: usize) -> bool {
        let mut partitions = self.workers[worker_id].partitions.lock().unwrap();
        partitions.retain(|p| {
            let drain = p.is_marked_for_deletion() && p.pending_cells() == 0;
            if drain {
                debug!("partition {} freed on worker {}", p.id(), worker_id);
            }
            !drain
        });
        let mut want_more = false;
        for partition in partitions.iter() {
            if !self.oracle.owns(partition.id()) {
                partition.mark_for_deletion();
            }
            if partition.pending_cells() == 0 {
                continue;
            }
            trace!("worker {} running partition {}", worker_id, partition.id());
            let more = partition.run_one();
            metrics::CELLS_RUN_TOTAL.inc();
            want_more |= more;
        }
        want_more
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::StaticPartitionMap;
    use crate::scheduler::cell::{Cell, CellStatus};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct OnceCell(Arc<AtomicUsize>);
    impl Cell for OnceCell {
        fn run(&mut self) -> CellStatus {
            self.0.fetch_add(1, Ordering::SeqCst);
            CellStatus::Done
        }
    }

    #[test]
    fn least_busy_placement_spreads_partitions() {
        let oracle = Arc::new(StaticPartitionMap::new([0, 1, 2]));
        let pool = AsyncPool::start(2, oracle);
        pool.add_partition(Arc::new(PartitionState::new(0)));
        pool.add_partition(Arc::new(PartitionState::new(1)));
        pool.add_partition(Arc::new(PartitionState::new(2)));
        let counts: Vec<usize> = (0..2).map(|w| pool.worker_slot_count(w)).collect();
        assert_eq!(counts.iter().sum::<usize>(), 3);
        assert!(counts.iter().all(|&c| c <= 2));
        pool.stop();
    }

    #[test]
    fn enqueued_cell_runs_without_manual_stepping() {
        let oracle = Arc::new(StaticPartitionMap::new([0]));
        let pool = AsyncPool::start(1, oracle);
        let partition = Arc::new(PartitionState::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        partition.enqueue(Box::new(OnceCell(runs.clone())));
        pool.add_partition(partition);

        let start = Instant::now();
        while runs.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        pool.stop();
    }

    #[test]
    fn suspend_blocks_until_all_workers_park_then_resume_unblocks() {
        let oracle = Arc::new(StaticPartitionMap::new([]));
        let pool = AsyncPool::start(2, oracle);
        pool.suspend();
        assert!(pool.is_suspended());
        pool.resume();
        assert!(!pool.is_suspended());
        pool.stop();
    }
}
