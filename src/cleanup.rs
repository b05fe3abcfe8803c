//! Heap-based session expiry scheduler.
//!
//! Sessions register their next expire-at deadline (nanos); a single
//! background task sleeps until the heap root is due, pops every due entry,
//! re-checks the session's actual expiry through the [`EvictionSink`] (it
//! may have been touched since), and evicts the ones still expired. A
//! 100 ms sleep floor prevents tight loops and an hour-long idle sleep
//! bounds the wait when nothing is scheduled.
//!
//! The heap uses lazy deletion: `deadlines` holds the authoritative
//! deadline per session and stale heap entries are skipped on pop.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::types::now_nanos;

/// Floor between wakeups.
const MIN_DELAY: Duration = Duration::from_millis(100);
/// Sleep when no session is scheduled.
const IDLE_DELAY: Duration = Duration::from_secs(3600);

/// Re-check hook: return true when the session was actually evicted.
pub trait EvictionSink: Send + Sync + 'static {
    fn evict_if_expired(&self, session_id: &str) -> bool;
}

#[derive(Default)]
struct SchedState {
    /// Min-heap of (expire_at, session_id); may contain stale entries.
    heap: BinaryHeap<Reverse<(i64, String)>>,
    /// Authoritative deadline per session.
    deadlines: HashMap<String, i64>,
}

/// Scheduler stats, copy-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub tracked_sessions: usize,
    /// Nanos of the nearest deadline; 0 when nothing is tracked.
    pub next_expiration: i64,
}

pub struct CleanupScheduler {
    state: Mutex<SchedState>,
    wakeup: Notify,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupScheduler {
    pub fn new() -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(SchedState::default()),
            wakeup: Notify::new(),
            shutdown_tx,
            handle: Mutex::new(None),
        })
    }

    /// Spawn the background loop. Must run inside a tokio runtime.
    pub fn start(self: &Arc<Self>, sink: Arc<dyn EvictionSink>) {
        let scheduler = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let delay = scheduler.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        scheduler.run_due(&sink);
                    }
                    _ = scheduler.wakeup.notified() => {
                        // Deadline set changed; recompute the sleep.
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("cleanup scheduler stopping");
                            return;
                        }
                    }
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    /// Register or move a session's deadline. `expire_at == 0` untracks it.
    pub fn update_session(&self, session_id: &str, expire_at: i64) {
        {
            let mut state = self.state.lock();
            if expire_at == 0 {
                state.deadlines.remove(session_id);
            } else {
                state
                    .deadlines
                    .insert(session_id.to_string(), expire_at);
                state.heap.push(Reverse((expire_at, session_id.to_string())));
            }
        }
        self.wakeup.notify_one();
    }

    pub fn remove_session(&self, session_id: &str) {
        self.state.lock().deadlines.remove(session_id);
        self.wakeup.notify_one();
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut state = self.state.lock();
        Self::drop_stale(&mut state);
        SchedulerStats {
            tracked_sessions: state.deadlines.len(),
            next_expiration: state.heap.peek().map(|Reverse((at, _))| *at).unwrap_or(0),
        }
    }

    /// Signal the loop to exit and return its handle for joining.
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        let _ = self.shutdown_tx.send(true);
        self.handle.lock().take()
    }

    fn drop_stale(state: &mut SchedState) {
        while let Some(Reverse((at, id))) = state.heap.peek() {
            match state.deadlines.get(id) {
                Some(current) if current == at => break,
                _ => {
                    state.heap.pop();
                }
            }
        }
    }

    fn next_delay(&self) -> Duration {
        let mut state = self.state.lock();
        Self::drop_stale(&mut state);
        let Some(Reverse((at, _))) = state.heap.peek() else {
            return IDLE_DELAY;
        };
        let delta = *at - now_nanos();
        if delta <= 0 {
            return MIN_DELAY;
        }
        Duration::from_nanos(delta as u64).max(MIN_DELAY)
    }

    fn run_due(&self, sink: &Arc<dyn EvictionSink>) {
        let now = now_nanos();
        let due: Vec<String> = {
            let mut state = self.state.lock();
            let mut due = Vec::new();
            loop {
                Self::drop_stale(&mut state);
                match state.heap.peek() {
                    Some(Reverse((at, _))) if *at <= now => {
                        if let Some(Reverse((_, id))) = state.heap.pop() {
                            state.deadlines.remove(&id);
                            due.push(id);
                        }
                    }
                    _ => break,
                }
            }
            due
        };

        for session_id in due {
            if sink.evict_if_expired(&session_id) {
                info!(session = %session_id, "evicted expired session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        evicted: AtomicUsize,
        expired: bool,
    }

    impl EvictionSink for CountingSink {
        fn evict_if_expired(&self, _session_id: &str) -> bool {
            if self.expired {
                self.evicted.fetch_add(1, Ordering::SeqCst);
            }
            self.expired
        }
    }

    #[test]
    fn stats_track_registered_sessions() {
        let sched = CleanupScheduler::new();
        sched.update_session("s1", 1_000);
        sched.update_session("s2", 2_000);
        let stats = sched.stats();
        assert_eq!(stats.tracked_sessions, 2);
        assert_eq!(stats.next_expiration, 1_000);

        // Moving a deadline replaces the old entry rather than duplicating.
        sched.update_session("s1", 3_000);
        let stats = sched.stats();
        assert_eq!(stats.tracked_sessions, 2);
        assert_eq!(stats.next_expiration, 2_000);

        sched.remove_session("s2");
        assert_eq!(sched.stats().tracked_sessions, 1);
    }

    #[tokio::test]
    async fn due_sessions_are_evicted_after_recheck() {
        let sched = CleanupScheduler::new();
        let sink = Arc::new(CountingSink {
            evicted: AtomicUsize::new(0),
            expired: true,
        });
        sched.start(sink.clone() as Arc<dyn EvictionSink>);

        sched.update_session("s1", now_nanos() + 20_000_000); // 20 ms out
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(sink.evicted.load(Ordering::SeqCst), 1);
        assert_eq!(sched.stats().tracked_sessions, 0);

        if let Some(handle) = sched.stop() {
            let _ = handle.await;
        }
    }

    #[tokio::test]
    async fn touched_sessions_survive_the_recheck() {
        let sched = CleanupScheduler::new();
        let sink = Arc::new(CountingSink {
            evicted: AtomicUsize::new(0),
            expired: false, // re-check says "still alive"
        });
        sched.start(sink.clone() as Arc<dyn EvictionSink>);

        sched.update_session("s1", now_nanos() + 20_000_000);
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(sink.evicted.load(Ordering::SeqCst), 0);

        if let Some(handle) = sched.stop() {
            let _ = handle.await;
        }
    }
}
