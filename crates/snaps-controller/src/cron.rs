//! Periodic `onCronjob` delivery.
//!
//! Each job owns one [`Timer`]. When it fires the job runs, and only then is
//! a fresh timer armed for the next period, so a slow job never overlaps
//! itself. Unscheduling bumps the snap's generation; in-flight runs notice
//! and do not re-arm.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use snaps_capabilities::builtin::endowments::Cronjob;
use snaps_core::{SnapId, Timer};
use tracing::{debug, warn};

/// Runs one job occurrence.
#[async_trait]
pub trait CronRunner: Send + Sync {
    /// Deliver `job` to `snap_id`.
    async fn run_job(&self, snap_id: &SnapId, job: &Cronjob);
}

struct Entry {
    generation: u64,
    timers: Vec<Option<Timer>>,
}

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<SnapId, Entry>>,
    next_generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn is_current(&self, snap_id: &SnapId, generation: u64) -> bool {
        lock(&self.entries)
            .get(snap_id)
            .is_some_and(|e| e.generation == generation)
    }
}

/// Keeps every snap's cron jobs ticking.
#[derive(Clone, Default)]
pub struct CronScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronScheduler")
            .field("snaps", &lock(&self.inner.entries).len())
            .finish()
    }
}

impl CronScheduler {
    /// An empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `snap_id`'s jobs with `jobs`, delivered through `runner`.
    pub fn schedule(&self, snap_id: &SnapId, jobs: Vec<Cronjob>, runner: Arc<dyn CronRunner>) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let count = jobs.len();
        lock(&self.inner.entries).insert(
            snap_id.clone(),
            Entry {
                generation,
                timers: std::iter::repeat_with(|| None).take(count).collect(),
            },
        );
        for (index, job) in jobs.into_iter().enumerate() {
            arm(
                &self.inner,
                snap_id.clone(),
                index,
                job,
                generation,
                Arc::clone(&runner),
            );
        }
        debug!(snap_id = %snap_id, jobs = count, "Cron jobs scheduled");
    }

    /// Stop `snap_id`'s jobs. Returns whether any were scheduled.
    pub fn unschedule(&self, snap_id: &SnapId) -> bool {
        let removed = lock(&self.inner.entries).remove(snap_id);
        if removed.is_some() {
            debug!(snap_id = %snap_id, "Cron jobs stopped");
        }
        removed.is_some()
    }

    /// Stop every job.
    pub fn clear(&self) {
        let drained: Vec<Entry> = lock(&self.inner.entries).drain().map(|(_, e)| e).collect();
        drop(drained);
    }

    /// Number of jobs scheduled for `snap_id`.
    #[must_use]
    pub fn job_count(&self, snap_id: &SnapId) -> usize {
        lock(&self.inner.entries)
            .get(snap_id)
            .map_or(0, |e| e.timers.len())
    }
}

fn arm(
    inner: &Arc<Inner>,
    snap_id: SnapId,
    index: usize,
    job: Cronjob,
    generation: u64,
    runner: Arc<dyn CronRunner>,
) {
    let timer = Timer::from_duration(Duration::from_millis(job.interval_ms));
    let weak = Arc::downgrade(inner);
    let fired_id = snap_id.clone();
    let callback = move || {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if !inner.is_current(&fired_id, generation) {
                return;
            }
            debug!(snap_id = %fired_id, method = %job.request.method, "Cron job firing");
            runner.run_job(&fired_id, &job).await;
            arm(&inner, fired_id, index, job, generation, runner);
        });
    };
    if let Err(e) = timer.start(callback) {
        warn!(snap_id = %snap_id, error = %e, "Failed to arm cron job");
        return;
    }

    let mut entries = lock(&inner.entries);
    if let Some(slot) = entries
        .get_mut(&snap_id)
        .filter(|e| e.generation == generation)
        .and_then(|e| e.timers.get_mut(index))
    {
        *slot = Some(timer);
    }
    // Otherwise the snap was unscheduled meanwhile; dropping `timer` cancels it.
}
