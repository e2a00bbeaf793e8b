//! Shuttle (§4.G): fans one logical query into N per-partition cells and
//! merges their replies into a single result. Built on a `Mutex`-guarded
//! accumulator plus a `Condvar`, applying the same "exactly one reply"
//! discipline as `scheduler::shared_sender::SharedSender<T>`, generalized
//! from a single sender to an N-way commutative/associative merge.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::errors::{Error, Result};

struct Inner<R> {
    remaining: usize,
    merged: Option<R>,
    first_error: Option<Error>,
    done: bool,
}

/// Generic over the reply type `R`; `merge` must be commutative and
/// associative (result tallies add, distinct-count bitmaps union, min/max
/// fold) so replies can be combined in arrival order.
pub struct Shuttle<R> {
    inner: Mutex<Inner<R>>,
    cv: Condvar,
    merge: Box<dyn Fn(R, R) -> R + Send + Sync>,
}

impl<R: Send + 'static> Shuttle<R> {
    pub fn new(expected_cells: usize, merge: impl Fn(R, R) -> R + Send + Sync + 'static) -> Shuttle<R> {
        Shuttle {
            inner: Mutex::new(Inner {
                remaining: expected_cells,
                merged: None,
                first_error: None,
                done: expected_cells == 0,
            }),
            cv: Condvar::new(),
            merge: Box::new(merge),
        }
    }

    /// Record one cell's reply. Exactly one call per cell is expected;
    /// calling this more than `expected_cells` times is a caller bug (a
    /// cell that calls `suicide` without replying, or replies twice).
    ///
    /// A `partition_migrated` reply completes the shuttle immediately
    /// without waiting on the remaining cells beyond their own termination.
    pub fn reply(&self, result: Result<R>) {
        let mut inner = self.inner.lock().unwrap();
        match result {
            Ok(value) => {
                inner.merged = Some(match inner.merged.take() {
                    Some(acc) => (self.merge)(acc, value),
                    None => value,
                });
                inner.remaining = inner.remaining.saturating_sub(1);
            }
            Err(err) => {
                let migrated = matches!(err, Error::PartitionMigrated);
                if inner.first_error.is_none() {
                    inner.first_error = Some(err);
                }
                inner.remaining = inner.remaining.saturating_sub(1);
                if migrated {
                    inner.done = true;
                }
            }
        }
        if inner.remaining == 0 {
            inner.done = true;
        }
        if inner.done {
            self.cv.notify_all();
        }
    }

    /// Blocks until every expected cell has replied, a `partition_migrated`
    /// reply arrives, or `timeout` elapses — whichever comes first.
    pub fn wait(&self, timeout: Duration) -> Result<R> {
        let inner = self.inner.lock().unwrap();
        let (mut inner, wait_result) =
            self.cv.wait_timeout_while(inner, timeout, |i| !i.done).unwrap();
        if wait_result.timed_out() && !inner.done {
            return Err(Error::Timeout);
        }
        if let Some(err) = inner.first_error.take() {
            return Err(err);
        }
        inner
            .merged
            .take()
            .ok_or_else(|| Error::QueryRuntime("shuttle completed with no replies".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn merges_replies_commutatively() {
        let shuttle = Arc::new(Shuttle::new(3, |a: i64, b: i64| a + b));
        shuttle.reply(Ok(10));
        shuttle.reply(Ok(20));
        shuttle.reply(Ok(5));
        assert_eq!(shuttle.wait(Duration::from_secs(1)).unwrap(), 35);
    }

    #[test]
    fn partition_migrated_completes_immediately() {
        let shuttle = Shuttle::<i64>::new(4, |a, b| a + b);
        shuttle.reply(Ok(1));
        shuttle.reply(Err(Error::PartitionMigrated));
        let result = shuttle.wait(Duration::from_secs(1));
        assert_eq!(result, Err(Error::PartitionMigrated));
    }

    #[test]
    fn timeout_surfaces_when_not_all_cells_reply() {
        let shuttle = Shuttle::<i64>::new(2, |a, b| a + b);
        shuttle.reply(Ok(1));
        assert_eq!(shuttle.wait(Duration::from_millis(20)), Err(Error::Timeout));
    }

    #[test]
    fn concurrent_replies_from_multiple_threads() {
        let shuttle = Arc::new(Shuttle::new(8, |a: i64, b: i64| a + b));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let shuttle = shuttle.clone();
                thread::spawn(move || shuttle.reply(Ok(i)))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(shuttle.wait(Duration::from_secs(1)).unwrap(), 28);
    }
}
