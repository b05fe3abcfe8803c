//! Graceful shutdown coordination.
//!
//! Hooks register with a name and an integer priority; lower priorities run
//! first, hooks sharing a priority run concurrently, and the whole sequence
//! races a configurable deadline (default 30 s). Signal wiring is the
//! daemon's job; the engine registers a hook that syncs the WAL and writes
//! an opportunistic snapshot.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

type HookFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type HookFn = Arc<dyn Fn() -> HookFuture + Send + Sync>;

struct Hook {
    name: String,
    priority: i32,
    run: HookFn,
}

/// Ordered shutdown hook runner.
pub struct ShutdownCoordinator {
    hooks: Mutex<Vec<Hook>>,
    timeout: Mutex<Duration>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            hooks: Mutex::new(Vec::new()),
            timeout: Mutex::new(DEFAULT_SHUTDOWN_TIMEOUT),
        }
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }

    /// Register a hook. Lower `priority` runs earlier.
    pub fn register<F, Fut>(&self, name: impl Into<String>, priority: i32, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let mut hooks = self.hooks.lock();
        hooks.push(Hook {
            name: name.into(),
            priority,
            run: Arc::new(move || Box::pin(hook()) as HookFuture),
        });
        hooks.sort_by_key(|h| h.priority);
    }

    /// Run all hooks grouped by priority. Returns the number of hook errors
    /// (deadline overruns count as one per unfinished group).
    pub async fn shutdown(&self) -> usize {
        let (groups, timeout) = {
            let hooks = self.hooks.lock();
            let mut groups: Vec<(i32, Vec<(String, HookFn)>)> = Vec::new();
            for hook in hooks.iter() {
                match groups.last_mut() {
                    Some((p, group)) if *p == hook.priority => {
                        group.push((hook.name.clone(), Arc::clone(&hook.run)));
                    }
                    _ => groups.push((
                        hook.priority,
                        vec![(hook.name.clone(), Arc::clone(&hook.run))],
                    )),
                }
            }
            (groups, *self.timeout.lock())
        };

        let mut errors = 0usize;
        let deadline = tokio::time::Instant::now() + timeout;

        for (priority, group) in groups {
            let names: Vec<&str> = group.iter().map(|(n, _)| n.as_str()).collect();
            info!(priority, hooks = ?names, "running shutdown hook group");

            // Same-priority hooks run concurrently; the next group waits.
            let handles: Vec<_> = group
                .into_iter()
                .map(|(name, run)| tokio::spawn(async move { (name, run().await) }))
                .collect();

            let mut overran = false;
            for handle in handles {
                match tokio::time::timeout_at(deadline, handle).await {
                    Ok(Ok((name, result))) => {
                        if let Err(e) = result {
                            warn!(hook = %name, error = %e, "shutdown hook failed");
                            errors += 1;
                        }
                    }
                    Ok(Err(join_err)) => {
                        warn!(error = %join_err, "shutdown hook panicked");
                        errors += 1;
                    }
                    Err(_) => {
                        overran = true;
                        break;
                    }
                }
            }
            if overran {
                warn!(priority, "shutdown deadline exceeded, abandoning remaining hooks");
                errors += 1;
                break;
            }
        }

        if errors == 0 {
            info!("shutdown completed cleanly");
        } else {
            warn!(errors, "shutdown completed with errors");
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn hooks_run_in_priority_order() {
        let coordinator = ShutdownCoordinator::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, priority) in [("later", 10), ("first", 0), ("middle", 5)] {
            let order = Arc::clone(&order);
            coordinator.register(name, priority, move || {
                let order = Arc::clone(&order);
                async move {
                    order.lock().push(name);
                    Ok(())
                }
            });
        }

        assert_eq!(coordinator.shutdown().await, 0);
        assert_eq!(*order.lock(), vec!["first", "middle", "later"]);
    }

    #[tokio::test]
    async fn failing_hooks_are_counted_not_fatal() {
        let coordinator = ShutdownCoordinator::new();
        let ran = Arc::new(AtomicUsize::new(0));

        coordinator.register("bad", 0, || async { Err("boom".to_string()) });
        let ran2 = Arc::clone(&ran);
        coordinator.register("good", 1, move || {
            let ran = Arc::clone(&ran2);
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        assert_eq!(coordinator.shutdown().await, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deadline_abandons_slow_hooks() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.set_timeout(Duration::from_millis(50));

        coordinator.register("slow", 0, || async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        let never_ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&never_ran);
        coordinator.register("after", 1, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let errors = coordinator.shutdown().await;
        assert_eq!(errors, 1);
        assert_eq!(never_ran.load(Ordering::SeqCst), 0);
    }
}
