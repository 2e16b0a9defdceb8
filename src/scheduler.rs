use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// Trait for background tasks that run periodically
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    /// How often to run this task when no wakeup fires
    fn interval(&self) -> Duration;

    /// Optional event source that runs the task ahead of its next tick.
    /// Used by tasks whose work accumulates between intervals, such as a
    /// pending batch reaching its cap.
    fn wakeup(&self) -> Option<Arc<Notify>> {
        None
    }

    /// Execute the task
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Scheduler manages background tasks with graceful shutdown
pub struct Scheduler {
    tasks: RwLock<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: RwLock::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a periodic background task
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        match self.tasks.write() {
            Ok(mut tasks) => tasks.push(handle),
            Err(_) => handle.abort(),
        }
        self
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let wakeup = task.wakeup();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so tasks start on
            // their configured cadence.
            ticker.tick().await;

            loop {
                let woken = async {
                    match &wakeup {
                        Some(notify) => notify.notified().await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = woken => {
                        ticker.reset();
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), "Task shutting down");
                        break;
                    }
                }

                run_id += 1;
                let ctx = Context {
                    task_name: task.name(),
                    run_id,
                    shutdown: shutdown_rx.resubscribe(),
                };

                if let Err(e) = task.execute(ctx).await {
                    tracing::error!(
                        task = task.name(),
                        error = %e,
                        "Task execution failed"
                    );
                }
            }
        })
    }

    /// Abandon all tasks without waiting for them. Used when the owner is
    /// dropped without an explicit shutdown.
    pub fn abort(&self) {
        self.shutdown_tx.send(()).ok();
        if let Ok(mut tasks) = self.tasks.write() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    /// Graceful shutdown - wait for all tasks
    pub async fn shutdown(self) -> Result<()> {
        // Signal all tasks to stop
        self.shutdown_tx.send(()).ok();

        // Wait for all tasks to complete
        let handles = match self.tasks.write() {
            Ok(mut tasks) => tasks.drain(..).collect::<Vec<_>>(),
            Err(_) => return Err(Error::Shutdown("Task list lock poisoned".to_string())),
        };
        for task in handles {
            task.await
                .map_err(|e| Error::Shutdown(format!("Task join error: {}", e)))?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestTask {
        name: &'static str,
        interval: Duration,
        wakeup: Option<Arc<Notify>>,
        counter: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for TestTask {
        fn name(&self) -> &'static str {
            self.name
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        fn wakeup(&self) -> Option<Arc<Notify>> {
            self.wakeup.clone()
        }

        async fn execute(&self, _ctx: Context) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_scheduler_basic() -> Result<()> {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let task = Arc::new(TestTask {
            name: "test-task",
            interval: Duration::from_millis(10),
            wakeup: None,
            counter: counter.clone(),
        });

        scheduler.register(task);

        // Let it run for a bit
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Should have executed multiple times
        assert!(counter.load(Ordering::SeqCst) > 0);

        scheduler.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_scheduler_graceful_shutdown() -> Result<()> {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let task = Arc::new(TestTask {
            name: "test-task",
            interval: Duration::from_millis(10),
            wakeup: None,
            counter: counter.clone(),
        });

        scheduler.register(task);

        // Let it run briefly
        tokio::time::sleep(Duration::from_millis(25)).await;

        let count_before_shutdown = counter.load(Ordering::SeqCst);

        // Shutdown should be fast
        let start = std::time::Instant::now();
        scheduler.shutdown().await?;
        let shutdown_time = start.elapsed();

        assert!(shutdown_time < Duration::from_millis(100));

        // Give a moment to ensure no more tasks run
        tokio::time::sleep(Duration::from_millis(25)).await;
        let count_after_shutdown = counter.load(Ordering::SeqCst);

        assert_eq!(count_before_shutdown, count_after_shutdown);

        Ok(())
    }

    #[tokio::test]
    async fn test_wakeup_runs_task_ahead_of_tick() -> Result<()> {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let notify = Arc::new(Notify::new());

        let task = Arc::new(TestTask {
            name: "wakeup-task",
            // Long enough that only wakeups can account for executions.
            interval: Duration::from_secs(3600),
            wakeup: Some(notify.clone()),
            counter: counter.clone(),
        });

        scheduler.register(task);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        notify.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await?;
        Ok(())
    }
}
