use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::Result;
use crossbeam::channel::{bounded, Receiver};
use itertools::Itertools;
use log::{debug, trace, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::NnError;

/// Fixed set of worker threads shared by everything a graph context runs:
/// deferred gradient suppliers and the branches of every batch, nested ones
/// included. A thread waiting on nested branches steals queued work instead
/// of blocking, so the thread count never grows past `threads`.
pub struct WorkerPool {
    pool: ThreadPool,
}

/// The receiving end of a task spawned on a `WorkerPool`, blocks on `join`
pub struct TaskHandle<T> {
    recv: Receiver<Result<T>>,
}

fn run_caught<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let msg = super::panic_message(&*payload);
        warn!("worker task panicked: {msg}");
        Err(NnError::WorkerFailure(msg).into())
    })
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("graph-worker-{i}"))
            .build()
            .expect("unable to spawn graph worker threads");
        debug!("started worker pool with {threads} threads");
        WorkerPool { pool }
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn spawn<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (send, recv) = bounded(1);
        self.pool.spawn(move || {
            // the handle may have been dropped, nobody is waiting then
            let _ = send.send(run_caught(f));
        });
        TaskHandle { recv }
    }

    /// Maps `f` over `items` on the pool. Every item is tagged with its index
    /// before dispatch and the results are sorted back into input order, so
    /// the output never depends on completion order. The first error (in index
    /// order) fails the whole map. A single item, or a single thread, runs on
    /// the caller.
    pub fn map_indexed<I, O, F>(&self, items: Vec<I>, f: F) -> Result<Vec<O>>
    where
        I: Send,
        O: Send,
        F: Fn(usize, I) -> Result<O> + Sync,
    {
        let n = items.len();
        let tagged: Vec<(usize, Result<O>)> = if n <= 1 || self.threads() <= 1 {
            items.into_iter().enumerate().map(|(i, x)| (i, run_caught(|| f(i, x)))).collect()
        } else {
            self.pool.install(|| {
                items.into_par_iter().enumerate().map(|(i, x)| (i, run_caught(|| f(i, x)))).collect()
            })
        };
        trace!("mapped {n} tasks on {} threads", self.threads());
        tagged.into_iter().sorted_by_key(|(i, _)| *i).map(|(_, r)| r).collect()
    }
}

impl<T> TaskHandle<T> {
    pub fn ready(value: Result<T>) -> Self {
        let (send, recv) = bounded(1);
        let _ = send.send(value);
        TaskHandle { recv }
    }

    pub fn join(self) -> Result<T> {
        match self.recv.recv() {
            Ok(result) => result,
            Err(_) => Err(NnError::WorkerFailure("task dropped before completing".to_string()).into()),
        }
    }

    pub fn is_finished(&self) -> bool {
        !self.recv.is_empty()
    }
}

#[test]
fn test_pool_spawn_join() {
    let pool = WorkerPool::new(3);
    assert_eq!(pool.threads(), 3);
    let handles: Vec<_> = (0..16usize).map(|i| pool.spawn(move || Ok(i * i))).collect();
    let results: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results, (0..16).map(|i| i * i).collect::<Vec<_>>());
}

#[test]
fn test_pool_failures() {
    let pool = WorkerPool::new(2);
    let err = pool.spawn(|| -> Result<()> { Err(anyhow::Error::msg("boom")) }).join().unwrap_err();
    assert_eq!(err.to_string(), "boom");

    let err = pool.spawn(|| -> Result<()> { panic!("worker blew up") }).join().unwrap_err();
    assert_eq!(
        err.downcast_ref::<NnError>(),
        Some(&NnError::WorkerFailure("worker blew up".to_string()))
    );

    // workers survive a panicking job
    assert_eq!(pool.spawn(|| Ok(7)).join().unwrap(), 7);
    assert_eq!(TaskHandle::ready(Ok(1)).join().unwrap(), 1);
}

#[test]
fn test_map_order_preserved() {
    use std::time::Duration;
    let items: Vec<u64> = (0..24).collect();
    for threads in [1, 2, 5, 32] {
        let pool = WorkerPool::new(threads);
        let out = pool
            .map_indexed(items.clone(), |i, x| {
                // later items finish first
                std::thread::sleep(Duration::from_micros((24 - x) * 50));
                Ok((i, x * 2))
            })
            .unwrap();
        let expected: Vec<(usize, u64)> = items.iter().map(|x| (*x as usize, x * 2)).collect();
        assert_eq!(out, expected);
    }
}

#[test]
fn test_map_first_error_fails_all() {
    let pool = WorkerPool::new(4);
    let err = pool
        .map_indexed((0..10).collect(), |_, x: i32| {
            if x % 3 == 2 {
                Err(anyhow::Error::msg(format!("bad {x}")))
            } else {
                Ok(x)
            }
        })
        .unwrap_err();
    assert_eq!(err.to_string(), "bad 2");

    for threads in [1, 3] {
        let pool = WorkerPool::new(threads);
        let err = pool
            .map_indexed(vec![1, 2, 3], |_, x: i32| -> Result<i32> {
                if x == 2 {
                    panic!("branch {x} panicked");
                }
                Ok(x)
            })
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<NnError>(),
            Some(&NnError::WorkerFailure("branch 2 panicked".to_string()))
        );
    }
}

#[test]
fn test_nested_maps_stay_on_pool() {
    let pool = WorkerPool::new(2);
    let names = std::sync::Mutex::new(std::collections::HashSet::new());
    let out = pool
        .map_indexed((0..4).collect(), |_, x: usize| {
            // nested maps on a saturated pool must not deadlock
            pool.map_indexed((0..4).collect(), |_, y: usize| {
                let name = std::thread::current().name().map(str::to_string);
                names.lock().unwrap().insert(name);
                Ok(x * 10 + y)
            })
        })
        .unwrap();
    assert_eq!(out[3], vec![30, 31, 32, 33]);
    let names = names.into_inner().unwrap();
    assert!(names.len() <= 2);
    assert!(names.iter().all(|n| n.as_deref().map_or(false, |n| n.starts_with("graph-worker-"))));
}

#[test]
fn test_map_empty() {
    let out: Vec<i32> = WorkerPool::new(4).map_indexed(Vec::<i32>::new(), |_, x| Ok(x)).unwrap();
    assert!(out.is_empty());
}
