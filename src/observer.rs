use std::sync::Weak;

use crate::Runtime;
use crate::arena::{ContainerId, ObserverId};
use crate::job::{JobConfig, RuntimeJob};
use crate::value::ObservedValue;

/// Outcome of asking an observer's owner for its next value.
#[derive(Debug)]
pub enum Derived {
    /// Nothing changed; no job is created.
    Unchanged,
    /// Commit this value.
    Value(ObservedValue),
    /// Keep the value, but still perform, cascade and rerender.
    Notify,
}

/// The seam between the scheduler and whatever owns an observer.
///
/// States and computeds implement this; the runtime calls back into it when
/// the observer is ingested without a value (a dependency changed) and after
/// a job for it has been committed.
pub trait ObserverHandler: Send + Sync {
    /// Produce the value to ingest when no explicit value was given.
    fn derive(&self, _config: &JobConfig) -> Derived {
        Derived::Notify
    }

    /// Run side effects once `job` has been committed to the observer.
    fn perform(&self, _job: &RuntimeJob) {}
}

/// Construction options for an [`Observer`].
#[derive(Default, Debug)]
pub struct ObserverConfig {
    /// External key, used to name jobs and payload entries.
    pub key: Option<String>,
    /// Initial value.
    pub value: Option<ObservedValue>,
    /// Observers the new observer depends on.
    pub dependencies: Vec<ObserverId>,
}

impl ObserverConfig {
    /// Set [`key`](Self::key).
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set [`value`](Self::value).
    pub fn value(mut self, value: ObservedValue) -> Self {
        self.value = Some(value);
        self
    }

    /// Add a dependency.
    pub fn depends_on(mut self, dependency: ObserverId) -> Self {
        self.dependencies.push(dependency);
        self
    }
}

/// A graph node wrapping one reactive value.
///
/// The observer owns its arena node: dropping it removes the node and severs
/// every edge and subscription that referenced it. It is deliberately not
/// `Clone`; share the [`ObserverId`] instead.
///
/// ```ignore
/// let runtime = Runtime::new();
/// let source = Observer::new(&runtime, ObserverConfig::default().key("source"));
/// let sink = Observer::new(&runtime, ObserverConfig::default().depends_on(source.id()));
///
/// source.ingest_value(observed(1), JobConfig::default());
/// // sink was ingested as a dependent of source in the same cascade
/// ```
pub struct Observer {
    runtime: Runtime,
    id: ObserverId,
}

impl Observer {
    /// Allocate a new observer in `runtime`.
    pub fn new(runtime: &Runtime, config: ObserverConfig) -> Self {
        let id = runtime.insert_observer(config.key, config.value);
        for dependency in config.dependencies {
            runtime.add_dependent(dependency, id);
        }
        Self {
            runtime: runtime.clone(),
            id,
        }
    }

    /// Attach the owner that derives values and runs side effects.
    pub fn set_handler(&self, handler: Weak<dyn ObserverHandler>) {
        self.runtime.set_observer_handler(self.id, handler);
    }

    /// Arena id.
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Runtime this observer lives in.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// External key.
    pub fn key(&self) -> Option<String> {
        self.runtime.observer_key(self.id)
    }

    /// Replace the external key.
    pub fn set_key(&self, key: Option<String>) {
        self.runtime.set_observer_key(self.id, key);
    }

    /// Current value. Recorded as a dependency if a derivation is being tracked.
    pub fn value(&self) -> Option<ObservedValue> {
        self.runtime.observer_value(self.id, true)
    }

    /// Current value without dependency tracking.
    pub fn value_untracked(&self) -> Option<ObservedValue> {
        self.runtime.observer_value(self.id, false)
    }

    /// Value before the last committed job.
    pub fn previous_value(&self) -> Option<ObservedValue> {
        self.runtime.observer_previous_value(self.id)
    }

    /// Observers re-ingested when this one performs.
    pub fn dependents(&self) -> Vec<ObserverId> {
        self.runtime.observer_dependents(self.id)
    }

    /// Observers this one is re-ingested for.
    pub fn dependencies(&self) -> Vec<ObserverId> {
        self.runtime.observer_dependencies(self.id)
    }

    /// Containers currently subscribed to this observer.
    pub fn subscribed_to(&self) -> Vec<ContainerId> {
        self.runtime.observer_subscriptions(self.id).1.into_iter().collect()
    }

    /// Make `dependent` re-evaluate whenever this observer performs.
    ///
    /// Returns false if the edge already existed.
    pub fn add_dependent(&self, dependent: &Observer) -> bool {
        self.runtime.add_dependent(self.id, dependent.id)
    }

    /// Drop the edge to `dependent`. Returns false if there was none.
    pub fn remove_dependent(&self, dependent: &Observer) -> bool {
        self.runtime.remove_dependent(self.id, dependent.id)
    }

    /// Ingest without a value: the owner decides what (if anything) changes.
    pub fn ingest(&self, config: JobConfig) {
        self.runtime.ingest_observer(self.id, config);
    }

    /// Ingest an explicit value.
    pub fn ingest_value(&self, value: ObservedValue, config: JobConfig) {
        let perform = config.perform;
        let job = RuntimeJob::new(&self.runtime, self.id, config, Some(value));
        self.runtime.ingest(job, perform);
    }

    /// Commit `job` into this observer.
    ///
    /// A job that has already been performed is left untouched.
    pub fn perform(&self, job: &mut RuntimeJob) {
        self.runtime.perform_observer(job);
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("id", &self.id)
            .field("key", &self.key())
            .finish()
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.runtime.remove_observer(self.id);
    }
}
