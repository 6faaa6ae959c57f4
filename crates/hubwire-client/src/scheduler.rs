//! Delayed-work scheduler backing the keepalive and handshake timers.
//!
//! A single dispatcher task owns the list of `(work, ready_at)` pairs. It
//! wakes when new work arrives or the earliest deadline passes, and hands
//! each ready item to the first free worker of a small fixed pool. The
//! dispatcher never runs work itself, so a slow or stuck work item can
//! never delay dispatching.
//!
//! Panics escaping a work item are caught at the worker boundary and
//! logged; they terminate neither the worker nor the dispatcher.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

/// A unit of scheduled work.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// How long the dispatcher backs off when every worker is busy.
const DISPATCH_RETRY: Duration = Duration::from_millis(15);

/// Worker pool size.
const WORKER_COUNT: usize = 2;

struct Worker {
    slot: mpsc::Sender<Work>,
    busy: Arc<AtomicBool>,
}

struct Inner {
    queue: Mutex<Vec<(Work, Instant)>>,
    notify: Notify,
    closed: AtomicBool,
    workers: Vec<Worker>,
}

impl Inner {
    /// Split out the work whose deadline has passed; report the earliest
    /// deadline that remains.
    fn take_ready(&self, now: Instant) -> (Vec<Work>, Option<Instant>) {
        let mut queue = self.queue.lock();
        let mut ready = Vec::new();
        let mut remaining = Vec::with_capacity(queue.len());
        for (work, ready_at) in queue.drain(..) {
            if ready_at <= now {
                ready.push(work);
            } else {
                remaining.push((work, ready_at));
            }
        }
        let next = remaining.iter().map(|(_, at)| *at).min();
        *queue = remaining;
        (ready, next)
    }

    /// Hand `work` to a free worker, or give it back if all are busy.
    fn try_dispatch(&self, work: Work) -> Option<Work> {
        for worker in &self.workers {
            if worker
                .busy
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                match worker.slot.try_send(work) {
                    Ok(()) => return None,
                    Err(err) => {
                        // One-slot channel of a worker we just marked free
                        // cannot be full; this is shutdown.
                        worker.busy.store(false, Ordering::Release);
                        return Some(err.into_inner());
                    }
                }
            }
        }
        Some(work)
    }
}

/// The scheduler handle. Dropping the last handle shuts the dispatcher and
/// workers down; work still queued at that point is discarded.
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new() -> Self {
        let mut workers = Vec::with_capacity(WORKER_COUNT);
        for index in 0..WORKER_COUNT {
            let (tx, mut rx) = mpsc::channel::<Work>(1);
            let busy = Arc::new(AtomicBool::new(false));
            let busy_task = busy.clone();
            tokio::spawn(async move {
                while let Some(work) = rx.recv().await {
                    if std::panic::catch_unwind(AssertUnwindSafe(work)).is_err() {
                        tracing::error!(worker = index, "scheduled work panicked");
                    }
                    busy_task.store(false, Ordering::Release);
                }
            });
            workers.push(Worker { slot: tx, busy });
        }

        let inner = Arc::new(Inner {
            queue: Mutex::new(Vec::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            workers,
        });

        tokio::spawn(run_dispatcher(inner.clone()));

        Self { inner }
    }

    /// Queue `work` to run after `delay`.
    pub fn schedule(&self, work: impl FnOnce() + Send + 'static, delay: Duration) {
        if self.inner.closed.load(Ordering::Acquire) {
            tracing::warn!("schedule called on a closed scheduler, dropping work");
            return;
        }
        let ready_at = Instant::now() + delay;
        self.inner.queue.lock().push((Box::new(work), ready_at));
        self.inner.notify.notify_one();
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_dispatcher(inner: Arc<Inner>) {
    loop {
        if inner.closed.load(Ordering::Acquire) {
            return;
        }

        let (ready, next_deadline) = inner.take_ready(Instant::now());

        for mut work in ready {
            // All workers busy: back off briefly and retry. The dispatcher
            // must not run the work inline.
            loop {
                match inner.try_dispatch(work) {
                    None => break,
                    Some(returned) => {
                        if inner.closed.load(Ordering::Acquire) {
                            return;
                        }
                        work = returned;
                        tokio::time::sleep(DISPATCH_RETRY).await;
                    }
                }
            }
        }

        match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = inner.notify.notified() => {}
                }
            }
            None => inner.notify.notified().await,
        }
    }
}

// ── Periodic timer helper ────────────────────────────────────────────

/// The tick interval of [`timer`].
const TIMER_TICK: Duration = Duration::from_secs(1);

/// Run `predicate` once per second with the cumulative elapsed duration
/// since the timer was armed. Returning `true` stops the timer; `false`
/// re-arms it.
pub fn timer(
    scheduler: &Arc<Scheduler>,
    predicate: impl FnMut(Duration) -> bool + Send + 'static,
) {
    timer_internal(scheduler.clone(), predicate, Duration::ZERO);
}

fn timer_internal(
    scheduler: Arc<Scheduler>,
    mut predicate: impl FnMut(Duration) -> bool + Send + 'static,
    elapsed: Duration,
) {
    let rearm = scheduler.clone();
    scheduler.schedule(
        move || {
            let elapsed = elapsed + TIMER_TICK;
            if !predicate(elapsed) {
                timer_internal(rearm, predicate, elapsed);
            }
        },
        TIMER_TICK,
    );
}
