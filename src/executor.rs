//! Background rerender loop.
//!
//! Performing a job never dispatches to containers inline; it only marks a
//! rerender as scheduled. Something has to run
//! [`Runtime::update_subscribers`] afterwards: either the application calls
//! [`Runtime::flush`] itself (tests, sync apps), or it spawns a
//! [`RerenderLoop`].
//!
//! The loop blocks on a channel until a rerender is scheduled, then debounces:
//! each new notification within `debounce` resets the timer, but processing
//! starts after `max_debounce` at the latest. A burst of mutations therefore
//! becomes one rerender.
//!
//! ```ignore
//! let runtime = Runtime::new();
//! RerenderLoop::new(&runtime)
//!     .debounce(Duration::from_millis(2))
//!     .spawn_fn(|f| {
//!         std::thread::Builder::new()
//!             .name("rerender".into())
//!             .spawn(f)
//!             .unwrap()
//!     })
//!     .spawn();
//! ```
//!
//! The loop only holds a weak reference to the runtime and exits once the
//! runtime is dropped.

use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::Runtime;
use crate::runtime::WeakRuntime;

/// Default debounce delay before a rerender.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(4);

/// Upper bound on how long notifications can keep postponing a rerender.
pub const DEFAULT_MAX_DEBOUNCE: Duration = Duration::from_millis(16);

type SpawnFn = Box<dyn FnOnce(Box<dyn FnOnce() + Send>) -> JoinHandle<()> + Send>;

/// Builder for the background rerender loop of one runtime.
pub struct RerenderLoop {
    runtime: Runtime,
    debounce: Duration,
    max_debounce: Duration,
    spawn_fn: Option<SpawnFn>,
}

impl RerenderLoop {
    /// Loop for `runtime` with default timings, spawned on a plain thread.
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            runtime: runtime.clone(),
            debounce: DEFAULT_DEBOUNCE,
            max_debounce: DEFAULT_MAX_DEBOUNCE,
            spawn_fn: None,
        }
    }

    /// Quiet period required before rerendering. Default: 4ms.
    pub fn debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    /// Longest a rerender is postponed. Default: 16ms.
    pub fn max_debounce(mut self, duration: Duration) -> Self {
        self.max_debounce = duration;
        self
    }

    /// Custom thread spawning, e.g. to name the thread.
    pub fn spawn_fn<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Box<dyn FnOnce() + Send>) -> JoinHandle<()> + Send + 'static,
    {
        self.spawn_fn = Some(Box::new(f));
        self
    }

    /// Start the loop. Replaces any loop previously attached to the runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel::<()>();
        self.runtime.attach_notifier(tx);

        let runtime = self.runtime.downgrade();
        let debounce = self.debounce;
        let max_debounce = self.max_debounce;
        let loop_fn: Box<dyn FnOnce() + Send> = Box::new(move || {
            rerender_loop(rx, runtime, debounce, max_debounce);
        });

        match self.spawn_fn {
            Some(spawn_fn) => spawn_fn(loop_fn),
            None => thread::spawn(loop_fn),
        }
    }
}

fn rerender_loop(
    rx: mpsc::Receiver<()>,
    runtime: WeakRuntime,
    debounce: Duration,
    max_debounce: Duration,
) {
    debug!("rerender loop started");
    loop {
        if rx.recv().is_err() {
            break;
        }

        let debounce_start = Instant::now();
        loop {
            let remaining = max_debounce.saturating_sub(debounce_start.elapsed());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(debounce.min(remaining)) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }

        loop {
            match rx.try_recv() {
                Ok(()) => continue,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        let Some(runtime) = runtime.upgrade() else {
            break;
        };
        let dispatched = runtime.update_subscribers();
        trace!(dispatched, "rerender loop iteration");
    }
    debug!("rerender loop stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::integration::{ComponentInstance, Integration, UpdatePayload};
    use crate::subscription::{ContainerKind, Subscriber, SubscriptionConfig};
    use crate::{JobConfig, Observer, ObserverConfig, observed};

    struct Noop;

    impl Integration for Noop {
        fn key(&self) -> &str {
            "noop"
        }

        fn update_method(&self, _: &ComponentInstance, _: &UpdatePayload) {}
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn loop_batches_a_burst_into_one_rerender() {
        let runtime = Runtime::new();
        runtime.integrate(Arc::new(Noop)).unwrap();
        let observer = Observer::new(&runtime, ObserverConfig::default().key("n"));
        let calls = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(0));
        let (calls2, last2) = (calls.clone(), last.clone());
        runtime.subscribe(
            ContainerKind::callback(move |payload| {
                calls2.fetch_add(1, Ordering::SeqCst);
                if let Some(n) = payload.get::<usize>("n") {
                    last2.store(*n, Ordering::SeqCst);
                }
            }),
            [Subscriber::from(&observer)],
            SubscriptionConfig::default(),
        );

        RerenderLoop::new(&runtime)
            .debounce(Duration::from_millis(50))
            .max_debounce(Duration::from_millis(500))
            .spawn();

        for n in 1..=5usize {
            observer.ingest_value(observed(n), JobConfig::default());
        }

        assert!(wait_until(|| calls.load(Ordering::SeqCst) > 0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn loop_exits_when_runtime_is_dropped() {
        let runtime = Runtime::new();
        let handle = RerenderLoop::new(&runtime).spawn();
        drop(runtime);
        handle.join().unwrap();
    }
}
