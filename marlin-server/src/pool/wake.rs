//! Parking and resuming tasks keyed by a caller-chosen unique token.
//!
//! A long-running task parks itself with [`SleeperRegistry::sleep_task`]
//! and is resumed by any other thread through [`SleeperRegistry::wake`],
//! which may replace the parked payload before signaling. Aborting a
//! sleeper is poison: the sleeper returns [`SleepAborted`] and its caller
//! is responsible for cleaning up before the thread ends.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use marlin_types::{HttpRequest, SoapMessage};
use parking_lot::{Condvar, Mutex};

/// The hand-off value carried across a park/wake pair.
///
/// The concrete payloads the engine needs, plus a catch-all for user code.
#[derive(Default)]
pub enum WakePayload {
    /// An HTTP request in flight.
    Http(Box<HttpRequest>),
    /// A SOAP message in flight.
    Soap(Box<SoapMessage>),
    /// An event stream handle.
    Stream(u64),
    /// Anything user code wants to hand through.
    User(Box<dyn Any + Send>),
    /// Nothing.
    #[default]
    None,
}

impl std::fmt::Debug for WakePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WakePayload::Http(_) => "Http",
            WakePayload::Soap(_) => "Soap",
            WakePayload::Stream(_) => "Stream",
            WakePayload::User(_) => "User",
            WakePayload::None => "None",
        };
        f.write_str(name)
    }
}

/// The sleeper was aborted while parked; unwind and clean up.
#[derive(Debug, thiserror::Error)]
#[error("sleeping task {0} was aborted")]
pub struct SleepAborted(pub u64);

struct Sleeper {
    state: Mutex<SleepState>,
    signal: Condvar,
}

struct SleepState {
    payload: WakePayload,
    woken: bool,
    abort: bool,
}

/// Registry of parked tasks. One entry per unique token.
#[derive(Default)]
pub struct SleeperRegistry {
    sleepers: Mutex<HashMap<u64, Arc<Sleeper>>>,
}

impl SleeperRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks the current thread under `unique` until woken or aborted.
    ///
    /// Returns the payload left by the waker (which may differ from the
    /// one parked). The token must be process-unique for the lifetime of
    /// the park; a duplicate park returns the parked payload of the
    /// second caller immediately as an abort.
    pub fn sleep_task(&self, unique: u64, payload: WakePayload) -> Result<WakePayload, SleepAborted> {
        let sleeper = Arc::new(Sleeper {
            state: Mutex::new(SleepState {
                payload,
                woken: false,
                abort: false,
            }),
            signal: Condvar::new(),
        });

        {
            let mut sleepers = self.sleepers.lock();
            if sleepers.contains_key(&unique) {
                tracing::warn!("sleep token {unique} is already parked");
                return Err(SleepAborted(unique));
            }
            sleepers.insert(unique, Arc::clone(&sleeper));
        }

        let mut state = sleeper.state.lock();
        while !state.woken {
            sleeper.signal.wait(&mut state);
        }
        let abort = state.abort;
        let payload = std::mem::take(&mut state.payload);
        drop(state);

        self.sleepers.lock().remove(&unique);

        if abort {
            Err(SleepAborted(unique))
        } else {
            Ok(payload)
        }
    }

    /// Wakes the sleeper parked under `unique`, handing it `payload`.
    ///
    /// A wake with no matching sleeper is ignored and returns false.
    pub fn wake(&self, unique: u64, payload: WakePayload) -> bool {
        let sleeper = match self.sleepers.lock().get(&unique) {
            Some(sleeper) => Arc::clone(sleeper),
            None => return false,
        };
        let mut state = sleeper.state.lock();
        state.payload = payload;
        state.woken = true;
        sleeper.signal.notify_one();
        true
    }

    /// Reads the parked payload under `unique` without waking anything.
    pub fn peek<R>(&self, unique: u64, read: impl FnOnce(&WakePayload) -> R) -> Option<R> {
        let sleeper = Arc::clone(self.sleepers.lock().get(&unique)?);
        let state = sleeper.state.lock();
        Some(read(&state.payload))
    }

    /// Wakes the sleeper with the abort flag set.
    pub fn abort(&self, unique: u64) -> bool {
        let sleeper = match self.sleepers.lock().get(&unique) {
            Some(sleeper) => Arc::clone(sleeper),
            None => return false,
        };
        let mut state = sleeper.state.lock();
        state.abort = true;
        state.woken = true;
        sleeper.signal.notify_one();
        true
    }

    /// Wakes every parked sleeper; used during shutdown.
    pub fn wake_all(&self) {
        let tokens: Vec<u64> = self.sleepers.lock().keys().copied().collect();
        if !tokens.is_empty() {
            tracing::debug!("waking {} sleeping tasks", tokens.len());
        }
        for unique in tokens {
            self.wake(unique, WakePayload::None);
        }
    }

    /// Number of currently parked tasks.
    pub fn len(&self) -> usize {
        self.sleepers.lock().len()
    }

    /// Whether no task is parked.
    pub fn is_empty(&self) -> bool {
        self.sleepers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wake_hands_off_a_replacement_payload() {
        let registry = Arc::new(SleeperRegistry::new());
        let sleeper_side = Arc::clone(&registry);

        let parked = thread::spawn(move || {
            sleeper_side.sleep_task(17, WakePayload::Stream(1)).unwrap()
        });

        // Wait until the sleeper is registered before waking it
        while registry.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(
            registry.peek(17, |p| matches!(p, WakePayload::Stream(1))),
            Some(true)
        ));
        assert!(registry.wake(17, WakePayload::Stream(2)));

        match parked.join().unwrap() {
            WakePayload::Stream(2) => {}
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn abort_is_poison() {
        let registry = Arc::new(SleeperRegistry::new());
        let sleeper_side = Arc::clone(&registry);

        let parked = thread::spawn(move || sleeper_side.sleep_task(5, WakePayload::None));
        while registry.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(registry.abort(5));
        assert!(matches!(parked.join().unwrap(), Err(SleepAborted(5))));
    }

    #[test]
    fn wake_without_sleeper_is_ignored() {
        let registry = SleeperRegistry::new();
        assert!(!registry.wake(99, WakePayload::None));
        assert!(!registry.abort(99));
        assert!(registry.peek(99, |_| ()).is_none());
    }

    #[test]
    fn wake_all_drains_the_registry() {
        let registry = Arc::new(SleeperRegistry::new());
        let mut handles = Vec::new();
        for unique in 1..=3 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                registry.sleep_task(unique, WakePayload::None)
            }));
        }
        while registry.len() < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        registry.wake_all();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
        assert!(registry.is_empty());
    }
}
