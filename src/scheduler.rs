// ===============================
// src/scheduler.rs (timer-driven single-flight loops)
// ===============================
//
// Each loop owns one tokio interval. A cycle never overlaps another cycle
// of the same loop: ticks (or manual `run_now` calls) that arrive while a
// cycle is in flight are skipped and counted. `stop()` clears the timer
// and waits for the in-flight cycle to finish; it never aborts one.
//
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics::{CYCLES_SKIPPED, CYCLE_SECONDS};

type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Shared {
    name: &'static str,
    in_flight: AtomicBool,
    job: Job,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn run_guarded(shared: &Shared) -> bool {
    if shared.in_flight.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
        CYCLES_SKIPPED.with_label_values(&[shared.name]).inc();
        debug!(loop_name = shared.name, "previous cycle still running, skipping");
        return false;
    }
    let _guard = InFlight(&shared.in_flight);
    let timer = CYCLE_SECONDS.with_label_values(&[shared.name]).start_timer();
    (shared.job)().await;
    timer.observe_duration();
    true
}

pub struct LoopHandle {
    shared: Arc<Shared>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LoopHandle {
    pub fn name(&self) -> &'static str { self.shared.name }

    pub fn is_running(&self) -> bool { self.shared.in_flight.load(Ordering::Acquire) }

    /// Run one cycle now unless one is already in flight; returns whether it ran.
    pub async fn run_now(&self) -> bool { run_guarded(&self.shared).await }

    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(loop_name = self.shared.name, ?e, "loop task ended abnormally");
        }
        info!(loop_name = self.shared.name, "loop stopped");
    }
}

/// Run `job` every `period`, first tick immediately.
pub fn spawn_loop<F, Fut>(name: &'static str, period: Duration, job: F) -> LoopHandle
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let job: Job = Arc::new(move || job().boxed());
    let shared = Arc::new(Shared { name, in_flight: AtomicBool::new(false), job });
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let task = tokio::spawn({
        let shared = shared.clone();
        async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(loop_name = name, period_ms = period.as_millis() as u64, "loop started");
            loop {
                tokio::select! {
                    biased;
                    res = stop_rx.changed() => {
                        // sender gone counts as stop too
                        if res.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        run_guarded(&shared).await;
                    }
                }
            }
        }
    });

    LoopHandle { shared, stop_tx, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    #[tokio::test]
    async fn ticks_repeat_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let h = spawn_loop("t_repeat", Duration::from_millis(10), {
            let runs = runs.clone();
            move || {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        sleep(Duration::from_millis(80)).await;
        h.stop().await;
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "ran {seen} times");

        sleep(Duration::from_millis(40)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn cycles_never_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let h = spawn_loop("t_single", Duration::from_secs(3600), {
            let (active, max_active) = (active.clone(), max_active.clone());
            move || {
                let (active, max_active) = (active.clone(), max_active.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(60)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            }
        });

        sleep(Duration::from_millis(10)).await;
        assert!(h.is_running());
        assert!(!h.run_now().await);
        assert_eq!(CYCLES_SKIPPED.with_label_values(&["t_single"]).get(), 1);

        sleep(Duration::from_millis(80)).await;
        assert!(h.run_now().await);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_cycle() {
        let finished = Arc::new(AtomicBool::new(false));
        let h = spawn_loop("t_stop", Duration::from_secs(3600), {
            let finished = finished.clone();
            move || {
                let finished = finished.clone();
                async move {
                    sleep(Duration::from_millis(50)).await;
                    finished.store(true, Ordering::SeqCst);
                }
            }
        });
        sleep(Duration::from_millis(10)).await;
        h.stop().await;
        assert!(finished.load(Ordering::SeqCst));
    }
}
