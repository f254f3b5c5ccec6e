//! The single periodic-callback task hosted by the pool.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::ErrorReport;

/// Callback invoked on every heartbeat.
pub type HeartbeatFn = Box<dyn Fn() + Send + Sync>;

struct HeartbeatState {
    stop: bool,
    extra: bool,
    running: bool,
}

/// One periodic task: pulse-able, cancellable, crash-proof.
///
/// Callback errors are caught and reported, never propagated; the cadence
/// is untouched by an extra pulse.
pub struct Heartbeat {
    state: Arc<(Mutex<HeartbeatState>, Condvar)>,
}

impl Heartbeat {
    /// Starts the heartbeat thread with the given period.
    pub fn start(
        callback: HeartbeatFn,
        period: Duration,
        report: Arc<dyn ErrorReport>,
    ) -> std::io::Result<Heartbeat> {
        let state = Arc::new((
            Mutex::new(HeartbeatState {
                stop: false,
                extra: false,
                running: true,
            }),
            Condvar::new(),
        ));
        let thread_state = Arc::clone(&state);

        std::thread::Builder::new()
            .name("marlin-heartbeat".to_owned())
            .spawn(move || {
                let (lock, signal) = &*thread_state;
                loop {
                    let fire = {
                        let mut state = lock.lock();
                        if !state.stop && !state.extra {
                            signal.wait_for(&mut state, period);
                        }
                        if state.stop {
                            break;
                        }
                        // Timeout or an extra pulse both fire the callback
                        state.extra = false;
                        true
                    };
                    if fire {
                        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback())) {
                            report.report("heartbeat", &crate::pool::panic_text(&panic));
                        }
                    }
                }
                lock.lock().running = false;
                tracing::debug!("heartbeat thread stopped");
            })?;

        Ok(Heartbeat { state })
    }

    /// Triggers one immediate invocation without disturbing the schedule.
    pub fn pulse(&self) {
        let (lock, signal) = &*self.state;
        let mut state = lock.lock();
        if !state.stop {
            state.extra = true;
            signal.notify_one();
        }
    }

    /// Signals the thread to stop without waiting for it.
    pub fn request_stop(&self) {
        let (lock, signal) = &*self.state;
        lock.lock().stop = true;
        signal.notify_one();
    }

    /// Stops the heartbeat and waits up to ~1 s for the thread to end.
    pub fn stop(&self) {
        self.request_stop();
        let (lock, _) = &*self.state;
        for _ in 0..100 {
            if !lock.lock().running {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        tracing::warn!("heartbeat thread did not stop within a second");
    }

    /// Whether the heartbeat thread is still alive.
    pub fn is_running(&self) -> bool {
        self.state.0.lock().running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TracingErrorReport;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted_heartbeat(period: Duration) -> (Heartbeat, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::clone(&count);
        let heartbeat = Heartbeat::start(
            Box::new(move || {
                ticks.fetch_add(1, Ordering::SeqCst);
            }),
            period,
            Arc::new(TracingErrorReport),
        )
        .unwrap();
        (heartbeat, count)
    }

    #[test]
    fn fires_on_its_period() {
        let (heartbeat, count) = counted_heartbeat(Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(90));
        heartbeat.stop();
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 2, "expected at least two beats, saw {fired}");
    }

    #[test]
    fn pulse_fires_immediately() {
        let (heartbeat, count) = counted_heartbeat(Duration::from_secs(60));
        heartbeat.pulse();
        for _ in 0..100 {
            if count.load(Ordering::SeqCst) >= 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(count.load(Ordering::SeqCst) >= 1);
        heartbeat.stop();
        assert!(!heartbeat.is_running());
    }

    #[test]
    fn a_panicking_callback_does_not_kill_the_thread() {
        let count = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::clone(&count);
        let heartbeat = Heartbeat::start(
            Box::new(move || {
                ticks.fetch_add(1, Ordering::SeqCst);
                panic!("callback crash");
            }),
            Duration::from_millis(10),
            Arc::new(TracingErrorReport),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(heartbeat.is_running());
        assert!(count.load(Ordering::SeqCst) >= 2);
        heartbeat.stop();
    }
}
