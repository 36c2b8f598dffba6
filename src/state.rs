//! Typed value store on top of an [`Observer`].
//!
//! A [`State`] keeps two copies of its value: the *next* value, which every
//! write updates immediately, and the committed value held by the observer,
//! which changes when the write's job performs. With the default
//! `perform: true` the two are equal again by the time `set` returns.

use std::{fmt, mem};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::Runtime;
use crate::arena::ObserverId;
use crate::computed::Derivation;
use crate::error::{Error, Result};
use crate::hash::{FastIndexMap, new_index_map};
use crate::job::{JobConfig, RuntimeJob};
use crate::observer::{Derived, Observer, ObserverConfig, ObserverHandler};
use crate::subscription::Subscriber;
use crate::value::{ObservedValue, observed};

/// Bound for values stored in a [`State`].
pub trait StateValue: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

impl<T> StateValue for T where T: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

/// Called with the committed value and the watcher key.
pub type Watcher<T> = Arc<dyn Fn(&T, &str) + Send + Sync>;

/// Called with the committed value and the config of the job that committed it.
pub type SideEffect<T> = Arc<dyn Fn(&T, &JobConfig) + Send + Sync>;

type ComputeMethod<T> = Arc<dyn Fn(T) -> T + Send + Sync>;

/// Construction options for a [`State`].
#[derive(Debug, Default)]
pub struct StateConfig {
    /// External key.
    pub key: Option<String>,
    /// Observers this state is re-ingested for.
    pub dependencies: Vec<ObserverId>,
}

impl StateConfig {
    /// Set [`key`](Self::key).
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a dependency.
    pub fn depends_on(mut self, dependency: ObserverId) -> Self {
        self.dependencies.push(dependency);
        self
    }
}

pub(crate) struct StateInner<T: StateValue> {
    observer: Observer,
    initial: T,
    next: Mutex<T>,
    is_set: AtomicBool,
    watchers: Mutex<FastIndexMap<String, Watcher<T>>>,
    side_effects: Mutex<FastIndexMap<String, SideEffect<T>>>,
    compute_method: RwLock<Option<ComputeMethod<T>>>,
    pub(crate) derivation: Option<Derivation<T>>,
}

impl<T: StateValue> StateInner<T> {
    fn committed(&self, value: Option<ObservedValue>) -> T {
        value
            .as_deref()
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
            .unwrap_or_else(|| self.next.lock().clone())
    }

    fn current(&self) -> T {
        self.committed(self.observer.value_untracked())
    }
}

impl<T: StateValue> ObserverHandler for StateInner<T> {
    fn derive(&self, config: &JobConfig) -> Derived {
        let (next, pending) = match &self.derivation {
            Some(derivation) => {
                let value = derivation.compute(&self.observer);
                let pending = mem::replace(&mut *self.next.lock(), value.clone());
                (value, pending)
            }
            None => {
                let value = self.next.lock().clone();
                (value.clone(), value)
            }
        };
        // a queued job may still commit `pending` after the current value
        if !config.force && next == pending && next == self.current() {
            return Derived::Unchanged;
        }
        Derived::Value(observed(next))
    }

    fn perform(&self, job: &RuntimeJob) {
        let value = self.current();
        self.is_set.store(value != self.initial, Ordering::Relaxed);

        if !job.config().side_effects.enabled {
            return;
        }
        let watchers: Vec<(String, Watcher<T>)> = self
            .watchers
            .lock()
            .iter()
            .map(|(key, watcher)| (key.clone(), watcher.clone()))
            .collect();
        for (key, watcher) in watchers {
            watcher(&value, &key);
        }
        let side_effects: Vec<(String, SideEffect<T>)> = self
            .side_effects
            .lock()
            .iter()
            .map(|(key, effect)| (key.clone(), effect.clone()))
            .collect();
        for (key, effect) in side_effects {
            if job.config().side_effects.allows(&key) {
                effect(&value, job.config());
            }
        }
    }
}

/// A typed, observable value.
///
/// ```ignore
/// let runtime = Runtime::new();
/// let count = State::new(&runtime, 0);
/// count.watch(|value, _| println!("count is now {value}"));
///
/// count.set(1);
/// count.update(|n| *n += 1);
/// assert_eq!(count.get(), 2);
///
/// count.undo();
/// assert_eq!(count.get(), 1);
/// ```
pub struct State<T: StateValue> {
    pub(crate) inner: Arc<StateInner<T>>,
}

impl<T: StateValue> Clone for State<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: StateValue> fmt::Debug for State<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("key", &self.key())
            .field("value", &self.get_untracked())
            .finish()
    }
}

impl<T: StateValue> State<T> {
    /// State holding `initial`.
    pub fn new(runtime: &Runtime, initial: T) -> Self {
        Self::with_config(runtime, initial, StateConfig::default())
    }

    /// State holding `initial`, configured by `config`.
    pub fn with_config(runtime: &Runtime, initial: T, config: StateConfig) -> Self {
        Self::build(runtime, initial, config, None)
    }

    pub(crate) fn build(
        runtime: &Runtime,
        initial: T,
        config: StateConfig,
        derivation: Option<Derivation<T>>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<StateInner<T>>| {
            let mut observer_config = ObserverConfig::default().value(observed(initial.clone()));
            observer_config.key = config.key;
            observer_config.dependencies = config.dependencies;
            let observer = Observer::new(runtime, observer_config);
            let handler: Weak<dyn ObserverHandler> = weak.clone();
            observer.set_handler(handler);
            StateInner {
                observer,
                next: Mutex::new(initial.clone()),
                initial,
                is_set: AtomicBool::new(false),
                watchers: Mutex::new(new_index_map()),
                side_effects: Mutex::new(new_index_map()),
                compute_method: RwLock::new(None),
                derivation,
            }
        });
        trace!(observer = ?inner.observer.id(), "created state");
        Self { inner }
    }

    /// Underlying observer.
    pub fn observer(&self) -> &Observer {
        &self.inner.observer
    }

    /// Id of the underlying observer.
    pub fn id(&self) -> ObserverId {
        self.inner.observer.id()
    }

    /// Runtime the state lives in.
    pub fn runtime(&self) -> &Runtime {
        self.inner.observer.runtime()
    }

    /// External key.
    pub fn key(&self) -> Option<String> {
        self.inner.observer.key()
    }

    /// Replace the external key.
    pub fn set_key(&self, key: impl Into<String>) -> &Self {
        self.inner.observer.set_key(Some(key.into()));
        self
    }

    /// Committed value. Recorded as a dependency inside a tracked derivation.
    pub fn get(&self) -> T {
        self.inner.committed(self.inner.observer.value())
    }

    /// Committed value without dependency tracking.
    pub fn get_untracked(&self) -> T {
        self.inner.current()
    }

    /// Value before the last committed change.
    pub fn previous(&self) -> T {
        self.inner.committed(self.inner.observer.previous_value())
    }

    /// Value the state was created with.
    pub fn initial(&self) -> &T {
        &self.inner.initial
    }

    /// Value the next job will commit. Equal to [`get`](Self::get) once all jobs performed.
    pub fn next_value(&self) -> T {
        self.inner.next.lock().clone()
    }

    /// Whether the committed value equals `value`.
    pub fn is(&self, value: &T) -> bool {
        self.get_untracked() == *value
    }

    /// Whether the committed value differs from `value`.
    pub fn is_not(&self, value: &T) -> bool {
        !self.is(value)
    }

    /// Whether the committed value differs from the initial one.
    pub fn is_set(&self) -> bool {
        self.inner.is_set.load(Ordering::Relaxed)
    }

    /// Assign `value` with the runtime's default job config.
    pub fn set(&self, value: T) -> &Self {
        self.set_with(value, self.runtime().job_config())
    }

    /// Assign `value`.
    ///
    /// Nothing happens when `value` equals both the pending next value and
    /// the committed one, unless `config.force` is set.
    pub fn set_with(&self, value: T, config: JobConfig) -> &Self {
        self.assign(config, |_| value)
    }

    /// Edit the pending next value in place and assign the result.
    ///
    /// Reading, editing and queueing happen under the state's lock, so
    /// concurrent updates never lose each other's edits. `edit` must not
    /// touch this state.
    pub fn update(&self, edit: impl FnOnce(&mut T)) -> &Self {
        self.assign(self.runtime().job_config(), |next| {
            let mut value = next.clone();
            edit(&mut value);
            value
        })
    }

    fn assign(&self, config: JobConfig, make: impl FnOnce(&T) -> T) -> &Self {
        let compute = self.inner.compute_method.read().clone();
        let runtime = self.runtime();
        let perform = config.perform;
        {
            let mut next = self.inner.next.lock();
            let value = make(&*next);
            let value = match &compute {
                Some(compute) => compute(value),
                None => value,
            };
            if !config.force && *next == value && value == self.inner.current() {
                trace!(observer = ?self.id(), "value unchanged, skipping ingest");
                return self;
            }
            *next = value.clone();
            // queued under the lock so jobs commit in the order `next` was written
            let job = RuntimeJob::new(runtime, self.id(), config, Some(observed(value)));
            runtime.ingest(job, false);
        }
        if perform {
            runtime.perform_queued();
        }
        self
    }

    /// Go back to the previous value.
    pub fn undo(&self) -> &Self {
        self.set(self.previous())
    }

    /// Go back to the initial value.
    pub fn reset(&self) -> &Self {
        self.set(self.inner.initial.clone())
    }

    /// Re-push the pending next value through the runtime.
    pub fn ingest(&self, config: JobConfig) -> &Self {
        self.inner.observer.ingest(config);
        self
    }

    /// Transform every value before it is assigned.
    pub fn compute_method(&self, method: impl Fn(T) -> T + Send + Sync + 'static) -> &Self {
        *self.inner.compute_method.write() = Some(Arc::new(method));
        let next = self.next_value();
        self.set(next)
    }

    /// Register a watcher under a generated key, which is returned.
    pub fn watch(&self, callback: impl Fn(&T, &str) + Send + Sync + 'static) -> String {
        let key = self.runtime().generate_key("watcher");
        self.inner
            .watchers
            .lock()
            .insert(key.clone(), Arc::new(callback));
        key
    }

    /// Register a watcher under `key`.
    pub fn watch_with_key(
        &self,
        key: impl Into<String>,
        callback: impl Fn(&T, &str) + Send + Sync + 'static,
    ) -> Result<()> {
        let key = key.into();
        let mut watchers = self.inner.watchers.lock();
        if watchers.contains_key(&key) {
            return Err(Error::WatcherExists(key));
        }
        watchers.insert(key, Arc::new(callback));
        Ok(())
    }

    /// Remove the watcher under `key`. Returns whether one was registered.
    pub fn remove_watcher(&self, key: &str) -> bool {
        self.inner.watchers.lock().shift_remove(key).is_some()
    }

    /// Whether a watcher is registered under `key`.
    pub fn has_watcher(&self, key: &str) -> bool {
        self.inner.watchers.lock().contains_key(key)
    }

    /// Run `callback` once, on the next committed change.
    pub fn on_inaugurated(&self, callback: impl FnOnce(&T) + Send + 'static) {
        let callback: Mutex<Option<Box<dyn FnOnce(&T) + Send>>> =
            Mutex::new(Some(Box::new(callback)));
        let inner = Arc::downgrade(&self.inner);
        self.watch(move |value, key| {
            if let Some(callback) = callback.lock().take() {
                callback(value);
            }
            if let Some(inner) = inner.upgrade() {
                inner.watchers.lock().shift_remove(key);
            }
        });
    }

    /// Run `effect` after every committed change whose job does not exclude `key`.
    pub fn add_side_effect(
        &self,
        key: impl Into<String>,
        effect: impl Fn(&T, &JobConfig) + Send + Sync + 'static,
    ) -> &Self {
        self.inner
            .side_effects
            .lock()
            .insert(key.into(), Arc::new(effect));
        self
    }

    /// Remove the side effect under `key`.
    pub fn remove_side_effect(&self, key: &str) -> bool {
        self.inner.side_effects.lock().shift_remove(key).is_some()
    }

    /// Whether a side effect is registered under `key`.
    pub fn has_side_effect(&self, key: &str) -> bool {
        self.inner.side_effects.lock().contains_key(key)
    }
}

impl State<bool> {
    /// Flip the value.
    pub fn invert(&self) -> &Self {
        self.update(|flag| *flag = !*flag)
    }
}

impl<T: StateValue> From<&State<T>> for Subscriber {
    fn from(state: &State<T>) -> Self {
        state.id().into()
    }
}
