use std::{future::Future, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};

/// SweepHandle
///
/// Owner of a periodic cleanup task. Dropping the handle (or calling `cancel`) stops the task,
/// so a sweep never outlives the service it cleans.
#[derive(Debug)]
pub struct SweepHandle {
    name: &'static str,
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Runs `job` every `period` on the tokio timer (virtual time under `start_paused` tests).
/// The first run happens one full period after spawning.
pub fn spawn_sweep<F, Fut>(name: &'static str, period: Duration, mut job: F) -> SweepHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(MIN_PERIOD);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            job().await;
            tracing::trace!(sweep = name, "sweep completed");
        }
    });
    SweepHandle { name, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[tokio::test(start_paused = true)]
    async fn runs_on_each_period_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = spawn_sweep("test", Duration::from_secs(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_does_not_panic() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = spawn_sweep("zero", Duration::ZERO, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(runs.load(Ordering::SeqCst) > 0);
        assert!(!handle.is_finished());
    }
}
