//! Host end of one runtime's multiplexed channel.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use snaps_core::{SnapId, Timer};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::backend::RuntimeGuard;
use crate::error::{ExecutionError, ExecutionResult};
use crate::protocol::{Command, CommandRequest, CommandResponse, Frame};
use crate::runtime_id::RuntimeId;

type Reply = oneshot::Sender<ExecutionResult<Value>>;

struct Pending {
    snap_id: Option<SnapId>,
    method: &'static str,
    timeout_ms: u64,
    timer: Timer,
    reply: Reply,
}

#[derive(Default)]
struct State {
    pending: HashMap<u64, Pending>,
    closed: Option<String>,
    /// Open suspensions per snap; deadlines are paused while non-zero.
    suspended: HashMap<SnapId, usize>,
}

/// Owned by the service; shared with the channel's reader task.
pub(crate) struct Connection {
    id: RuntimeId,
    state: Mutex<State>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    next_id: AtomicU64,
    snaps: Mutex<BTreeSet<SnapId>>,
    last_activity: Mutex<Instant>,
    guard: Mutex<Option<RuntimeGuard>>,
    tasks: Mutex<Tasks>,
}

#[derive(Default)]
struct Tasks {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    pub(crate) fn new(
        id: RuntimeId,
        outbound: mpsc::UnboundedSender<Frame>,
        guard: RuntimeGuard,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(State::default()),
            outbound: Mutex::new(Some(outbound)),
            next_id: AtomicU64::new(1),
            snaps: Mutex::new(BTreeSet::new()),
            last_activity: Mutex::new(Instant::now()),
            guard: Mutex::new(Some(guard)),
            tasks: Mutex::new(Tasks::default()),
        })
    }

    pub(crate) fn id(&self) -> RuntimeId {
        self.id
    }

    pub(crate) fn set_tasks(&self, reader: JoinHandle<()>, writer: JoinHandle<()>) {
        *lock(&self.tasks) = Tasks {
            reader: Some(reader),
            writer: Some(writer),
        };
    }

    pub(crate) fn add_snap(&self, snap_id: SnapId) -> bool {
        lock(&self.snaps).insert(snap_id)
    }

    pub(crate) fn remove_snap(&self, snap_id: &SnapId) {
        lock(&self.snaps).remove(snap_id);
    }

    pub(crate) fn hosts(&self, snap_id: &SnapId) -> bool {
        lock(&self.snaps).contains(snap_id)
    }

    pub(crate) fn snaps(&self) -> Vec<SnapId> {
        lock(&self.snaps).iter().cloned().collect()
    }

    pub(crate) fn touch(&self) {
        *lock(&self.last_activity) = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        lock(&self.last_activity).elapsed()
    }

    pub(crate) fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.state).closed.is_some()
    }

    pub(crate) fn send(&self, frame: Frame) -> bool {
        lock(&self.outbound)
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    fn terminated(&self, reason: &str) -> ExecutionError {
        ExecutionError::Terminated {
            runtime_id: self.id,
            reason: reason.to_string(),
        }
    }

    /// Send a command and wait for exactly one of: its response, its deadline,
    /// or the runtime's termination.
    pub(crate) async fn request(
        self: &Arc<Self>,
        snap_id: Option<&SnapId>,
        command: Command,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> ExecutionResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::command(&CommandRequest {
            id,
            command,
            params,
        })?;
        let (tx, rx) = oneshot::channel();
        let timeout_ms = timeout.map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));

        {
            let mut state = lock(&self.state);
            if let Some(reason) = &state.closed {
                return Err(self.terminated(reason));
            }
            let timer = timeout.map_or_else(Timer::never, Timer::from_duration);
            let weak = Arc::downgrade(self);
            // Started under the lock so the deadline cannot observe a missing entry.
            timer.start(move || expire(&weak, id))?;
            if snap_id.is_some_and(|s| state.suspended.contains_key(s)) {
                let _ = timer.pause();
            }
            state.pending.insert(
                id,
                Pending {
                    snap_id: snap_id.cloned(),
                    method: command.as_str(),
                    timeout_ms,
                    timer,
                    reply: tx,
                },
            );
        }

        trace!(runtime_id = %self.id, id, command = command.as_str(), "Command sent");
        if !self.send(frame) {
            if let Some(pending) = lock(&self.state).pending.remove(&id) {
                let _ = pending.timer.cancel();
            }
            return Err(self.terminated("channel closed"));
        }

        rx.await
            .unwrap_or_else(|_| Err(self.terminated("request dropped")))
    }

    /// Route a response to its caller. Unknown ids and malformed responses
    /// are logged and dropped.
    pub(crate) fn resolve(&self, response: CommandResponse) {
        let id = response.id;
        let outcome = match response.into_result() {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(runtime_id = %self.id, id, error = %e, "Dropping malformed response");
                return;
            },
        };
        let Some(pending) = lock(&self.state).pending.remove(&id) else {
            warn!(runtime_id = %self.id, id, "Dropping response with unknown id");
            return;
        };
        let _ = pending.timer.cancel();
        self.touch();
        let _ = pending.reply.send(outcome.map_err(ExecutionError::Snap));
    }

    /// Fail every pending request with `Terminated`, once. Returns whether
    /// this call did the closing.
    pub(crate) fn close(&self, reason: &str) -> bool {
        let drained: Vec<Pending> = {
            let mut state = lock(&self.state);
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(reason.to_string());
            state.pending.drain().map(|(_, p)| p).collect()
        };
        if !drained.is_empty() {
            debug!(
                runtime_id = %self.id,
                count = drained.len(),
                reason,
                "Failing pending requests"
            );
        }
        for pending in drained {
            let _ = pending.timer.cancel();
            let _ = pending.reply.send(Err(self.terminated(reason)));
        }
        true
    }

    /// Open a suspension for `snap_id`. The first one pauses the deadlines
    /// of its pending requests. Returns how many were paused.
    pub(crate) fn suspend(&self, snap_id: &SnapId) -> usize {
        let mut state = lock(&self.state);
        let depth = state.suspended.entry(snap_id.clone()).or_insert(0);
        *depth = depth.saturating_add(1);
        if *depth > 1 {
            return 0;
        }
        Self::for_each_timer(&state, snap_id, |timer| {
            let _ = timer.pause();
        })
    }

    /// Close a suspension for `snap_id`. The last one resumes the deadlines.
    /// Returns how many were resumed.
    pub(crate) fn resume(&self, snap_id: &SnapId) -> usize {
        let mut state = lock(&self.state);
        let Some(depth) = state.suspended.get_mut(snap_id) else {
            return 0;
        };
        *depth = depth.saturating_sub(1);
        if *depth > 0 {
            return 0;
        }
        state.suspended.remove(snap_id);
        Self::for_each_timer(&state, snap_id, |timer| {
            let _ = timer.resume();
        })
    }

    /// Number of open suspensions for `snap_id`.
    pub(crate) fn suspension_depth(&self, snap_id: &SnapId) -> usize {
        lock(&self.state)
            .suspended
            .get(snap_id)
            .copied()
            .unwrap_or(0)
    }

    fn for_each_timer(state: &State, snap_id: &SnapId, op: impl Fn(&Timer)) -> usize {
        let mut count = 0usize;
        for pending in state.pending.values() {
            if pending.snap_id.as_ref() == Some(snap_id) {
                op(&pending.timer);
                count = count.saturating_add(1);
            }
        }
        count
    }

    /// Stop the writer after it flushes, then tear the runtime down.
    pub(crate) async fn shutdown(&self, grace: Duration) {
        lock(&self.outbound).take();
        let Tasks { reader, writer } = std::mem::take(&mut *lock(&self.tasks));
        let guard = lock(&self.guard).take();

        if let Some(writer) = writer {
            let abort = writer.abort_handle();
            if tokio::time::timeout(grace, writer).await.is_err() {
                abort.abort();
            }
        }
        if let Some(guard) = guard {
            guard.shutdown().await;
        }
        if let Some(reader) = reader {
            reader.abort();
        }
    }
}

/// Deadline path for request `id`.
fn expire(connection: &Weak<Connection>, id: u64) {
    let Some(connection) = connection.upgrade() else {
        return;
    };
    let Some(pending) = lock(&connection.state).pending.remove(&id) else {
        return;
    };
    let target = pending
        .snap_id
        .as_ref()
        .map_or_else(|| connection.id.to_string(), ToString::to_string);
    warn!(
        runtime_id = %connection.id,
        id,
        target = %target,
        method = pending.method,
        timeout_ms = pending.timeout_ms,
        "Request timed out"
    );
    let _ = pending.reply.send(Err(ExecutionError::Timeout {
        target,
        method: pending.method.to_string(),
        timeout_ms: pending.timeout_ms,
    }));
}
