//! Jobs: one-shot descriptions of a pending value transition.
//!
//! A [`RuntimeJob`] is created per mutation, handed to
//! [`Runtime::ingest`](crate::Runtime::ingest), performed once, and then kept
//! only for as long as some subscription container still has to hear about it.

use crate::Runtime;
use crate::arena::{ContainerId, ObserverId};
use crate::config::DEFAULT_MAX_TRIES_TO_UPDATE;
use crate::hash::{FastIndexMap, FastIndexSet, new_index_map};
use crate::value::{ObservedValue, Observable, observed};

/// Which side effects a performed job may run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SideEffectConfig {
    /// Run side effects (watchers included) at all.
    pub enabled: bool,
    /// Keys of side effects to skip even when enabled.
    pub exclude: Vec<String>,
}

impl Default for SideEffectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exclude: Vec::new(),
        }
    }
}

impl SideEffectConfig {
    /// Whether the side effect registered under `key` should run.
    pub fn allows(&self, key: &str) -> bool {
        self.enabled && !self.exclude.iter().any(|excluded| excluded == key)
    }
}

/// Configuration snapshot carried by a job. Immutable once the job exists.
#[derive(Clone, Debug)]
pub struct JobConfig {
    /// Job key; defaults to the observer key.
    pub key: Option<String>,
    /// Commit the value without notifying subscription containers.
    pub background: bool,
    /// Bypass the equality short-circuit.
    pub force: bool,
    /// Perform immediately when the runtime is idle instead of only queueing.
    pub perform: bool,
    /// Side effect policy.
    pub side_effects: SideEffectConfig,
    /// How many drain cycles to wait for not-ready containers; `None` waits forever.
    pub max_tries_to_update: Option<u32>,
    /// Extra context for side effects.
    pub extra: FastIndexMap<String, ObservedValue>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            key: None,
            background: false,
            force: false,
            perform: true,
            side_effects: SideEffectConfig::default(),
            max_tries_to_update: Some(DEFAULT_MAX_TRIES_TO_UPDATE),
            extra: new_index_map(),
        }
    }
}

impl JobConfig {
    /// Set [`key`](Self::key).
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set [`background`](Self::background).
    pub fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    /// Set [`force`](Self::force).
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Set [`perform`](Self::perform).
    pub fn perform(mut self, perform: bool) -> Self {
        self.perform = perform;
        self
    }

    /// Enable or disable all side effects.
    pub fn side_effects(mut self, enabled: bool) -> Self {
        self.side_effects.enabled = enabled;
        self
    }

    /// Skip the side effect registered under `key`.
    pub fn exclude_side_effect(mut self, key: impl Into<String>) -> Self {
        self.side_effects.exclude.push(key.into());
        self
    }

    /// Set [`max_tries_to_update`](Self::max_tries_to_update).
    pub fn max_tries_to_update(mut self, tries: Option<u32>) -> Self {
        self.max_tries_to_update = tries;
        self
    }

    /// Attach extra context under `key`.
    pub fn extra<T: Observable>(mut self, key: impl Into<String>, value: T) -> Self {
        self.extra.insert(key.into(), observed(value));
        self
    }

    /// Read extra context back as `T`.
    pub fn get_extra<T: Observable>(&self, key: &str) -> Option<&T> {
        self.extra.get(key).and_then(|value| value.downcast_ref::<T>())
    }
}

/// A scheduled transition for one observer.
#[derive(Debug)]
pub struct RuntimeJob {
    pub(crate) key: Option<String>,
    pub(crate) observer: ObserverId,
    pub(crate) config: JobConfig,
    pub(crate) new_value: Option<ObservedValue>,
    pub(crate) rerender: bool,
    pub(crate) subscription_containers_to_update: FastIndexSet<ContainerId>,
    pub(crate) tries_to_update: u32,
    pub(crate) performed: bool,
    /// Observers whose jobs cascaded into this one, oldest first.
    pub(crate) causes: Vec<ObserverId>,
}

impl RuntimeJob {
    /// Build a job for `observer`.
    ///
    /// The containers to update are a snapshot of the observer's subscriptions
    /// at this moment; containers subscribing later do not see this job.
    pub fn new(
        runtime: &Runtime,
        observer: ObserverId,
        config: JobConfig,
        new_value: Option<ObservedValue>,
    ) -> Self {
        let (observer_key, containers) = runtime.observer_subscriptions(observer);
        let rerender = !config.background && runtime.has_integration();
        let job = Self {
            key: config.key.clone().or(observer_key),
            observer,
            config,
            new_value,
            rerender,
            subscription_containers_to_update: containers,
            tries_to_update: 0,
            performed: false,
            causes: Vec::new(),
        };
        tracing::trace!(job = ?job.key, ?observer, rerender, "created job");
        job
    }

    /// Job key.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Rename the job.
    pub fn set_key(&mut self, key: Option<String>) {
        self.key = key;
    }

    /// Observer this job transitions.
    pub fn observer(&self) -> ObserverId {
        self.observer
    }

    /// Configuration snapshot.
    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Value committed by this job, if it carries one.
    pub fn new_value(&self) -> Option<&ObservedValue> {
        self.new_value.as_ref()
    }

    /// Whether subscription containers are notified after the job performs.
    pub fn rerender(&self) -> bool {
        self.rerender
    }

    /// Containers that still have to be notified.
    pub fn subscription_containers_to_update(&self) -> impl Iterator<Item = ContainerId> + '_ {
        self.subscription_containers_to_update.iter().copied()
    }

    /// Drain cycles spent waiting on not-ready containers.
    pub fn tries_to_update(&self) -> u32 {
        self.tries_to_update
    }

    /// Whether the value has been committed.
    pub fn performed(&self) -> bool {
        self.performed
    }

    /// Whether the retry budget is spent after `tries_to_update` attempts.
    pub(crate) fn retries_exhausted(&self) -> bool {
        self.config
            .max_tries_to_update
            .is_some_and(|max| self.tries_to_update >= max)
    }
}
