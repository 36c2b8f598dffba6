use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::Runtime;
use crate::arena::ObserverId;
use crate::error::Result;
use crate::hash::{FastIndexSet, new_index_set};
use crate::job::JobConfig;
use crate::observer::Observer;
use crate::state::{State, StateConfig, StateValue};
use crate::subscription::Subscriber;

type ComputeFn<T> = Arc<dyn Fn() -> T + Send + Sync>;

/// Construction options for a [`Computed`].
#[derive(Debug)]
pub struct ComputedConfig {
    /// External key.
    pub key: Option<String>,
    /// Observers that always trigger a recompute, read or not.
    pub dependencies: Vec<ObserverId>,
    /// Discover dependencies from the reads of each run.
    ///
    /// Turn this off for derivations whose reads cannot all happen during
    /// the synchronous run; only `dependencies` trigger them then.
    pub auto_track: bool,
}

impl Default for ComputedConfig {
    fn default() -> Self {
        Self {
            key: None,
            dependencies: Vec::new(),
            auto_track: true,
        }
    }
}

impl ComputedConfig {
    /// Set [`key`](Self::key).
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a hard-coded dependency.
    pub fn depends_on(mut self, dependency: ObserverId) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Set [`auto_track`](Self::auto_track).
    pub fn auto_track(mut self, auto_track: bool) -> Self {
        self.auto_track = auto_track;
        self
    }
}

struct DerivationState<T> {
    compute: ComputeFn<T>,
    hard_coded: Vec<ObserverId>,
    /// Dependencies found by the last tracked run.
    tracked: Vec<ObserverId>,
}

/// The recompute half of a computed state: the function plus the
/// dependency edges it currently owns.
pub(crate) struct Derivation<T> {
    state: Mutex<DerivationState<T>>,
    auto_track: bool,
}

impl<T> Derivation<T> {
    fn new(compute: ComputeFn<T>, hard_coded: Vec<ObserverId>, auto_track: bool) -> Self {
        Self {
            state: Mutex::new(DerivationState {
                compute,
                hard_coded,
                tracked: Vec::new(),
            }),
            auto_track,
        }
    }

    /// Run the compute function, returning the result and the observers it read.
    fn run(&self, runtime: &Runtime) -> (T, Vec<ObserverId>) {
        let compute = self.state.lock().compute.clone();
        if self.auto_track {
            runtime.tracked(|| compute())
        } else {
            (runtime.untracked(|| compute()), Vec::new())
        }
    }

    /// Recompute for `observer` and rewire its dependency edges.
    pub(crate) fn compute(&self, observer: &Observer) -> T {
        let (value, found) = self.run(observer.runtime());
        self.rewire(observer.runtime(), observer.id(), found);
        value
    }

    /// Replace the edges owned by the previous run with `found`.
    ///
    /// Edges to hard-coded dependencies survive even when not read.
    fn rewire(&self, runtime: &Runtime, me: ObserverId, found: Vec<ObserverId>) {
        let found: Vec<ObserverId> = found.into_iter().filter(|id| *id != me).collect();
        let mut state = self.state.lock();
        for old in &state.tracked {
            if !found.contains(old) && !state.hard_coded.contains(old) {
                runtime.remove_dependent(*old, me);
            }
        }
        for dependency in found.iter().chain(&state.hard_coded) {
            if *dependency != me {
                runtime.add_dependent(*dependency, me);
            }
        }
        trace!(computed = ?me, dependencies = found.len(), "rewired dependencies");
        state.tracked = found;
    }

    fn replace(&self, runtime: &Runtime, me: ObserverId, compute: ComputeFn<T>, hard_coded: Vec<ObserverId>) {
        let mut state = self.state.lock();
        for old in &state.hard_coded {
            if !hard_coded.contains(old) && !state.tracked.contains(old) {
                runtime.remove_dependent(*old, me);
            }
        }
        state.compute = compute;
        state.hard_coded = hard_coded;
    }

    fn dependencies(&self) -> Vec<ObserverId> {
        let state = self.state.lock();
        let mut all: FastIndexSet<ObserverId> = new_index_set();
        all.extend(state.hard_coded.iter().copied());
        all.extend(state.tracked.iter().copied());
        all.into_iter().collect()
    }
}

/// Derived value that recomputes when the observers it reads change.
///
/// A Computed is a [`State`] without setters whose value comes from a
/// function. Every run records the observers read through
/// [`State::get`]/[`Observer::value`]; those become the dependencies, and the
/// edges to observers no longer read are dropped. When any dependency
/// performs, the computed is re-ingested, recomputes, and commits (and
/// cascades further) only if the result differs.
///
/// # Example
/// ```ignore
/// let runtime = Runtime::new();
/// let first = State::new(&runtime, "Jeff".to_owned());
/// let last = State::new(&runtime, "Bezos".to_owned());
///
/// let full = Computed::new(&runtime, {
///     let (first, last) = (first.clone(), last.clone());
///     move || format!("{} {}", first.get(), last.get())
/// });
///
/// first.set("Frank".into());
/// assert_eq!(full.get(), "Frank Bezos");
/// ```
pub struct Computed<T: StateValue> {
    state: State<T>,
}

impl<T: StateValue> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: StateValue> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("key", &self.key())
            .field("value", &self.get_untracked())
            .field("dependencies", &self.dependencies())
            .finish()
    }
}

impl<T: StateValue> Computed<T> {
    /// Computed value with auto-tracked dependencies.
    ///
    /// The function runs once immediately.
    pub fn new(runtime: &Runtime, compute: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::with_config(runtime, compute, ComputedConfig::default())
    }

    /// Computed value that also always depends on `dependencies`.
    pub fn with_dependencies(
        runtime: &Runtime,
        compute: impl Fn() -> T + Send + Sync + 'static,
        dependencies: impl IntoIterator<Item = ObserverId>,
    ) -> Self {
        let config = ComputedConfig {
            dependencies: dependencies.into_iter().collect(),
            ..ComputedConfig::default()
        };
        Self::with_config(runtime, compute, config)
    }

    /// Computed value configured by `config`.
    pub fn with_config(
        runtime: &Runtime,
        compute: impl Fn() -> T + Send + Sync + 'static,
        config: ComputedConfig,
    ) -> Self {
        let compute: ComputeFn<T> = Arc::new(compute);
        let derivation = Derivation::new(compute, config.dependencies, config.auto_track);
        let (initial, found) = derivation.run(runtime);

        let state_config = StateConfig {
            key: config.key,
            dependencies: Vec::new(),
        };
        let state = State::build(runtime, initial, state_config, Some(derivation));
        if let Some(derivation) = &state.inner.derivation {
            derivation.rewire(runtime, state.id(), found);
        }
        Self { state }
    }

    fn derivation(&self) -> Option<&Derivation<T>> {
        self.state.inner.derivation.as_ref()
    }

    /// Underlying observer.
    pub fn observer(&self) -> &Observer {
        self.state.observer()
    }

    /// Id of the underlying observer.
    pub fn id(&self) -> ObserverId {
        self.state.id()
    }

    /// External key.
    pub fn key(&self) -> Option<String> {
        self.state.key()
    }

    /// Replace the external key.
    pub fn set_key(&self, key: impl Into<String>) -> &Self {
        self.state.set_key(key);
        self
    }

    /// Current result. Recorded as a dependency inside a tracked derivation.
    pub fn get(&self) -> T {
        self.state.get()
    }

    /// Current result without dependency tracking.
    pub fn get_untracked(&self) -> T {
        self.state.get_untracked()
    }

    /// Result before the last change.
    pub fn previous(&self) -> T {
        self.state.previous()
    }

    /// Whether the current result equals `value`.
    pub fn is(&self, value: &T) -> bool {
        self.state.is(value)
    }

    /// Hard-coded and discovered dependencies.
    pub fn dependencies(&self) -> Vec<ObserverId> {
        self.derivation()
            .map(Derivation::dependencies)
            .unwrap_or_default()
    }

    /// Run the function again and ingest the result if it changed.
    pub fn recompute(&self, config: JobConfig) -> &Self {
        self.state.ingest(config);
        self
    }

    /// Swap the function and hard-coded dependencies, then recompute.
    pub fn update_compute_function(
        &self,
        compute: impl Fn() -> T + Send + Sync + 'static,
        dependencies: impl IntoIterator<Item = ObserverId>,
        config: JobConfig,
    ) -> &Self {
        if let Some(derivation) = self.derivation() {
            derivation.replace(
                self.state.runtime(),
                self.id(),
                Arc::new(compute),
                dependencies.into_iter().collect(),
            );
        }
        self.recompute(config)
    }

    /// See [`State::watch`].
    pub fn watch(&self, callback: impl Fn(&T, &str) + Send + Sync + 'static) -> String {
        self.state.watch(callback)
    }

    /// See [`State::watch_with_key`].
    pub fn watch_with_key(
        &self,
        key: impl Into<String>,
        callback: impl Fn(&T, &str) + Send + Sync + 'static,
    ) -> Result<()> {
        self.state.watch_with_key(key, callback)
    }

    /// See [`State::remove_watcher`].
    pub fn remove_watcher(&self, key: &str) -> bool {
        self.state.remove_watcher(key)
    }

    /// See [`State::on_inaugurated`].
    pub fn on_inaugurated(&self, callback: impl FnOnce(&T) + Send + 'static) {
        self.state.on_inaugurated(callback);
    }

    /// See [`State::add_side_effect`].
    pub fn add_side_effect(
        &self,
        key: impl Into<String>,
        effect: impl Fn(&T, &JobConfig) + Send + Sync + 'static,
    ) -> &Self {
        self.state.add_side_effect(key, effect);
        self
    }

    /// See [`State::remove_side_effect`].
    pub fn remove_side_effect(&self, key: &str) -> bool {
        self.state.remove_side_effect(key)
    }
}

impl<T: StateValue> From<&Computed<T>> for Subscriber {
    fn from(computed: &Computed<T>) -> Self {
        computed.id().into()
    }
}
