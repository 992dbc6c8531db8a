// vim: tw=80
//! Background task queue for metaslab preloading

use futures::future;
use std::{
    mem,
    sync::Mutex,
};
use tokio::{
    runtime::{Builder, Runtime},
    task::JoinHandle,
};
use tracing::warn;
use crate::types::*;

/// Runs blocking jobs on a bounded pool of threads.
///
/// Jobs may not be cancelled, but their completion may be awaited.
#[derive(Debug)]
pub(crate) struct Taskq {
    /// Only `None` while being dropped
    rt: Option<Runtime>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Taskq {
    pub fn new(threads: usize) -> Result<Self> {
        let rt = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name("spalloc-taskq")
            .build()?;
        Ok(Taskq {
            rt: Some(rt),
            handles: Mutex::new(Vec::new())
        })
    }

    pub fn dispatch<F>(&self, f: F)
        where F: FnOnce() + Send + 'static
    {
        if let Some(rt) = self.rt.as_ref() {
            let mut handles = self.handles.lock().unwrap();
            handles.retain(|h| !h.is_finished());
            handles.push(rt.spawn_blocking(f));
        }
    }

    /// Block until every job dispatched so far has finished
    pub fn wait(&self) {
        let handles = mem::take(&mut *self.handles.lock().unwrap());
        if let Some(rt) = self.rt.as_ref() {
            let results = rt.block_on(future::join_all(handles));
            for r in results {
                if let Err(e) = r {
                    warn!(error = %e, "background task failed");
                }
            }
        }
    }
}

impl Drop for Taskq {
    fn drop(&mut self) {
        // The last reference to the pool may be dropped by one of our own
        // jobs, where a blocking shutdown isn't allowed.
        if let Some(rt) = self.rt.take() {
            rt.shutdown_background();
        }
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
use pretty_assertions::assert_eq;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering}
};
use super::*;

#[test]
fn wait_for_all() {
    let tq = Taskq::new(2).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..16 {
        let count = count.clone();
        tq.dispatch(move || {
            count.fetch_add(1, Ordering::Relaxed);
        });
    }
    tq.wait();
    assert_eq!(count.load(Ordering::Relaxed), 16);
}

#[test]
fn wait_when_idle() {
    let tq = Taskq::new(1).unwrap();
    tq.wait();
}
}
// LCOV_EXCL_STOP
