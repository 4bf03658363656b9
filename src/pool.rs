//! Bounded loader worker pool with caller-runs backpressure.
//!
//! The pool never queues beyond its worker count: a job is only accepted
//! when an idle worker was reserved for it first. Rejected submissions are
//! handed back to the caller, which either runs the job on its own thread
//! (`load_all`/`reload_all`) or drops it (prefetch).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Proof that an idle worker was set aside for one job.
pub(crate) struct Reservation {
  _priv: (),
}

pub(crate) struct LoaderPool {
  tx: Sender<Job>,
  idle: Arc<AtomicUsize>,
  // Workers exit when the sender side is dropped with the pool.
  _workers: Vec<JoinHandle<()>>,
}

impl LoaderPool {
  pub(crate) fn new(threads: usize, label: &str) -> Self {
    debug_assert!(threads > 0);
    let (tx, rx): (Sender<Job>, Receiver<Job>) = crossbeam_channel::unbounded();
    let idle = Arc::new(AtomicUsize::new(threads));
    let mut workers = Vec::with_capacity(threads);
    for index in 0..threads {
      let rx = rx.clone();
      let idle = idle.clone();
      let handle = thread::Builder::new()
        .name(format!("{}-{}", label, index))
        .spawn(move || {
          while let Ok(job) = rx.recv() {
            // A panicking job must not kill the worker or strand its
            // reservation.
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
            idle.fetch_add(1, Ordering::Release);
          }
        })
        .expect("failed to spawn loader pool worker");
      workers.push(handle);
    }
    Self {
      tx,
      idle,
      _workers: workers,
    }
  }

  /// Claims an idle worker. `None` means the pool is saturated and the
  /// caller must apply its backpressure strategy.
  pub(crate) fn reserve(&self) -> Option<Reservation> {
    let mut idle = self.idle.load(Ordering::Acquire);
    loop {
      if idle == 0 {
        return None;
      }
      match self.idle.compare_exchange_weak(
        idle,
        idle - 1,
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return Some(Reservation { _priv: () }),
        Err(current) => idle = current,
      }
    }
  }

  /// Hands a job to the reserved worker. The queue holds at most one job
  /// per reservation, so delivery is immediate once the worker polls.
  pub(crate) fn dispatch(&self, _reservation: Reservation, job: Job) {
    // Send only fails when the pool is being torn down; the job is dropped
    // with it.
    let _ = self.tx.send(job);
  }
}
