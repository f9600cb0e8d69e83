//! Supervised background tasks
//!
//! A [`PeriodicTask`] runs one job on a fixed interval until stopped. Only one
//! instance of a given task runs at a time.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct PeriodicTask {
    name: &'static str,
    handle: Mutex<Option<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
}

impl PeriodicTask {
    pub fn new(name: &'static str) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            name,
            handle: Mutex::new(None),
            stop,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run `job` every `interval`, first after one full interval
    ///
    /// Returns `false` if the task is already running.
    pub fn start<F, Fut>(&self, interval: Duration, mut job: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.handle.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::debug!(task = self.name, "Periodic task already running");
            return false;
        }

        let period = if interval.is_zero() {
            tracing::warn!(task = self.name, "Zero interval is invalid; clamped to 1 second");
            Duration::from_secs(1)
        } else {
            interval
        };

        self.stop.send_replace(false);
        let mut stop = self.stop.subscribe();
        let name = self.name;

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Consume the immediate first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop.changed() => break,
                }
                if *stop.borrow() {
                    break;
                }
                tracing::debug!(task = name, "Running periodic task");
                job().await;
            }
            tracing::debug!(task = name, "Periodic task stopped");
        }));

        tracing::info!(
            task = self.name,
            interval_secs = period.as_secs_f64(),
            "Periodic task started"
        );
        true
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Signal the task to stop and wait for the current run to finish
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::warn!(task = self.name, %error, "Periodic task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(counter: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<()> + Send + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_after_each_interval() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::new("test");
        assert!(task.start(Duration::from_secs(10), counting_job(&counter)));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_refused_while_running() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::new("test");
        assert!(task.start(Duration::from_secs(1), counting_job(&counter)));
        assert!(!task.start(Duration::from_secs(1), counting_job(&counter)));
        assert!(task.is_running());
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_the_loop_and_allows_restart() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = PeriodicTask::new("test");
        task.start(Duration::from_secs(1), counting_job(&counter));
        tokio::time::sleep(Duration::from_millis(2500)).await;

        task.stop().await;
        assert!(!task.is_running());
        let after_stop = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);

        assert!(task.start(Duration::from_secs(1), counting_job(&counter)));
        task.stop().await;
    }
}
