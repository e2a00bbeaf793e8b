//! Global suspend/resume handshake (§4.F, §5). Required around schema
//! changes, partition map changes, and table initialization: while
//! suspended, no cell's `run()` may be entered on any worker.

use std::sync::{Condvar, Mutex};

struct SuspendInner {
    /// Raised for the duration of a suspended region.
    suspended: bool,
    /// Recursion depth: `resume` only clears `suspended` when this reaches 0.
    depth: usize,
    /// Workers currently parked in the suspended region.
    acknowledged: usize,
    worker_count: usize,
}

pub struct SuspendState {
    inner: Mutex<SuspendInner>,
    cv: Condvar,
}

impl SuspendState {
    pub fn new(worker_count: usize) -> SuspendState {
        SuspendState {
            inner: Mutex::new(SuspendInner { suspended: false, depth: 0, acknowledged: 0, worker_count }),
            cv: Condvar::new(),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.lock().unwrap().suspended
    }

    pub fn suspended_worker_count(&self) -> usize {
        self.inner.lock().unwrap().acknowledged
    }

    /// Raises the suspend flag, wakes all workers, and blocks until every
    /// worker has acknowledged idle. Reentrant: nested calls just bump the
    /// recursion depth.
    pub fn suspend(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.depth += 1;
        if !inner.suspended {
            inner.suspended = true;
        }
        self.cv.notify_all();
        while inner.acknowledged < inner.worker_count {
            inner = self.cv.wait(inner).unwrap();
        }
    }

    /// Decrements the recursion depth; when it reaches zero, clears the
    /// suspend flag and releases parked workers.
    pub fn resume(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.depth > 0 {
            inner.depth -= 1;
        }
        if inner.depth == 0 {
            inner.suspended = false;
            self.cv.notify_all();
        }
    }

    /// Called by a worker when it observes the suspend flag: blocks until
    /// the flag clears, then returns.
    pub fn park_worker(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.suspended {
            return;
        }
        inner.acknowledged += 1;
        self.cv.notify_all();
        while inner.suspended {
            inner = self.cv.wait(inner).unwrap();
        }
        inner.acknowledged -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn resume_releases_parked_workers() {
        let state = Arc::new(SuspendState::new(2));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let state = state.clone();
            let runs = runs.clone();
            handles.push(thread::spawn(move || {
                state.park_worker();
                runs.fetch_add(1, Ordering::SeqCst);
            }));
        }

        state.suspend();
        assert_eq!(state.suspended_worker_count(), 2);
        state.resume();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(!state.is_suspended());
    }

    #[test]
    fn nested_suspend_requires_matching_resumes() {
        let state = SuspendState::new(0);
        state.suspend();
        state.suspend();
        state.resume();
        assert!(state.is_suspended());
        state.resume();
        assert!(!state.is_suspended());
    }

    #[test]
    fn park_worker_returns_immediately_when_not_suspended() {
        let state = SuspendState::new(1);
        let start = std::time::Instant::now();
        state.park_worker();
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
