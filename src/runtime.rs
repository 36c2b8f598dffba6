//! The scheduler.
//!
//! A [`Runtime`] owns the observer graph, the subscription containers and the
//! job queues. Work happens in two phases:
//!
//! 1. **Perform.** [`ingest`](Runtime::ingest) either performs a job right
//!    away or queues it behind the job currently performing. Performing a job
//!    commits its value, re-ingests every dependent (cascade) and, if the job
//!    rerenders, parks it for phase two. Values are visible as soon as the
//!    job performs.
//! 2. **Rerender.** [`update_subscribers`](Runtime::update_subscribers) runs
//!    once per drain, either from a [`RerenderLoop`](crate::RerenderLoop) or
//!    from an explicit [`flush`](Runtime::flush). It collects every container
//!    touched by the parked jobs, filters them through readiness and
//!    selectors, and dispatches each container at most once with all the
//!    values that changed for it.
//!
//! No lock is held while user code runs (handlers, derivations, watchers,
//! selectors, callbacks, integrations), so any of those may call back into
//! the runtime.

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::arena::container_arena::{ContainerArena, ContainerNode, insert_container};
use crate::arena::observer_arena::{
    ObserverArena, ObserverNode, insert_observer, link, remove_observer, unlink,
};
use crate::arena::{ContainerId, ObserverId};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::hash::{FastIndexSet, new_index_set};
use crate::integration::{Integration, Integrations, UpdatePayload};
use crate::job::{JobConfig, RuntimeJob};
use crate::observer::{Derived, ObserverHandler};
use crate::subscription::{ContainerKind, Selector, Subscriber, SubscriptionConfig, SubscriptionContainer};
use crate::tracker::{ComputedTracker, FrameGuard};
use crate::value::{ObservedValue, values_equal};

#[derive(Default)]
struct JobQueues {
    is_performing_jobs: bool,
    job_queue: VecDeque<RuntimeJob>,
    jobs_to_rerender: Vec<RuntimeJob>,
    not_ready_jobs_to_rerender: Vec<RuntimeJob>,
}

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    observers: RwLock<ObserverArena>,
    containers: RwLock<ContainerArena>,
    queues: Mutex<JobQueues>,
    tracker: Mutex<ComputedTracker>,
    integrations: RwLock<Integrations>,
    notifier: Mutex<Option<Sender<()>>>,
    update_scheduled: AtomicBool,
    next_id: AtomicU64,
}

/// Handle to a reactive runtime. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

/// Non-owning handle, used by the rerender loop so it does not keep the
/// runtime alive.
#[derive(Clone)]
pub(crate) struct WeakRuntime(Weak<RuntimeInner>);

impl WeakRuntime {
    pub(crate) fn upgrade(&self) -> Option<Runtime> {
        self.0.upgrade().map(|inner| Runtime { inner })
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("observers", &self.inner.observers.read().len())
            .field("containers", &self.inner.containers.read().len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Runtime {
    /// Runtime with default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Runtime with `config`.
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                config,
                observers: RwLock::new(ObserverArena::new()),
                containers: RwLock::new(ContainerArena::new()),
                queues: Mutex::new(JobQueues::default()),
                tracker: Mutex::new(ComputedTracker::new()),
                integrations: RwLock::new(Integrations::default()),
                notifier: Mutex::new(None),
                update_scheduled: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Configuration the runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Job defaults derived from the runtime configuration.
    pub fn job_config(&self) -> JobConfig {
        JobConfig::default().max_tries_to_update(self.inner.config.max_tries_to_update)
    }

    pub(crate) fn downgrade(&self) -> WeakRuntime {
        WeakRuntime(Arc::downgrade(&self.inner))
    }

    /// Fresh key, unique within this runtime.
    pub(crate) fn generate_key(&self, prefix: &str) -> String {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{id}")
    }

    // ---- integrations ----

    /// Register a UI integration. Keys must be unique.
    pub fn integrate(&self, integration: Arc<dyn Integration>) -> Result<()> {
        let key = integration.key().to_owned();
        let mut integrations = self.inner.integrations.write();
        integrations.register(integration)?;
        debug!(integration = %key, registered = ?integrations.keys(), "registered integration");
        Ok(())
    }

    /// Whether any integration is registered. Without one nothing rerenders.
    pub fn has_integration(&self) -> bool {
        self.inner.integrations.read().has_integration()
    }

    // ---- observers ----

    pub(crate) fn insert_observer(
        &self,
        key: Option<String>,
        value: Option<ObservedValue>,
    ) -> ObserverId {
        let id = insert_observer(&mut self.inner.observers.write(), ObserverNode::new(key, value));
        trace!(observer = ?id, "created observer");
        id
    }

    pub(crate) fn remove_observer(&self, id: ObserverId) {
        let Some(node) = remove_observer(&mut self.inner.observers.write(), id) else {
            return;
        };
        let mut containers = self.inner.containers.write();
        for container in &node.subscribed_to {
            if let Some(container) = containers.get_mut(container.0) {
                container.subscribers.shift_remove(&id);
                container.subscriber_keys.shift_remove(&id);
                container.selectors.shift_remove(&id);
                container.updated_subscribers.shift_remove(&id);
            }
        }
        trace!(observer = ?id, key = ?node.key, "removed observer");
    }

    pub(crate) fn set_observer_handler(&self, id: ObserverId, handler: Weak<dyn ObserverHandler>) {
        if let Some(node) = self.inner.observers.write().get_mut(id.0) {
            node.handler = Some(handler);
        }
    }

    fn observer_handler(&self, id: ObserverId) -> Option<Arc<dyn ObserverHandler>> {
        let handler = self
            .inner
            .observers
            .read()
            .get(id.0)
            .and_then(|node| node.handler.clone());
        handler.and_then(|handler| handler.upgrade())
    }

    pub(crate) fn observer_key(&self, id: ObserverId) -> Option<String> {
        self.inner.observers.read().get(id.0).and_then(|node| node.key.clone())
    }

    pub(crate) fn set_observer_key(&self, id: ObserverId, key: Option<String>) {
        if let Some(node) = self.inner.observers.write().get_mut(id.0) {
            node.key = key;
        }
    }

    /// Current value of `id`, recorded into the active tracking frame when `tracked`.
    pub(crate) fn observer_value(&self, id: ObserverId, tracked: bool) -> Option<ObservedValue> {
        if tracked {
            self.inner.tracker.lock().record(id);
        }
        self.inner.observers.read().get(id.0).and_then(|node| node.value.clone())
    }

    pub(crate) fn observer_previous_value(&self, id: ObserverId) -> Option<ObservedValue> {
        self.inner
            .observers
            .read()
            .get(id.0)
            .and_then(|node| node.previous_value.clone())
    }

    pub(crate) fn observer_dependents(&self, id: ObserverId) -> Vec<ObserverId> {
        self.inner
            .observers
            .read()
            .get(id.0)
            .map(|node| node.dependents.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn observer_dependencies(&self, id: ObserverId) -> Vec<ObserverId> {
        self.inner
            .observers
            .read()
            .get(id.0)
            .map(|node| node.dependencies.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Key and subscribed containers of `id`, as snapshotted into new jobs.
    pub(crate) fn observer_subscriptions(
        &self,
        id: ObserverId,
    ) -> (Option<String>, FastIndexSet<ContainerId>) {
        self.inner
            .observers
            .read()
            .get(id.0)
            .map(|node| (node.key.clone(), node.subscribed_to.clone()))
            .unwrap_or_else(|| (None, new_index_set()))
    }

    /// Make `dependent` re-evaluate whenever `dependency` performs.
    pub fn add_dependent(&self, dependency: ObserverId, dependent: ObserverId) -> bool {
        link(&mut self.inner.observers.write(), dependency, dependent)
    }

    /// Remove the edge `dependency -> dependent`.
    pub fn remove_dependent(&self, dependency: ObserverId, dependent: ObserverId) -> bool {
        unlink(&mut self.inner.observers.write(), dependency, dependent)
    }

    // ---- tracking ----

    /// Run `f` and return every observer it read, in first-read order.
    pub fn tracked<R>(&self, f: impl FnOnce() -> R) -> (R, Vec<ObserverId>) {
        let guard = FrameGuard::track(&self.inner.tracker);
        let result = f();
        (result, guard.finish())
    }

    /// Run `f` without attributing its reads to an enclosing derivation.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        let guard = FrameGuard::suppress(&self.inner.tracker);
        let result = f();
        guard.finish();
        result
    }

    // ---- perform phase ----

    /// Ask the owner of `id` for its next value and ingest the resulting job.
    pub(crate) fn ingest_observer(&self, id: ObserverId, config: JobConfig) {
        self.ingest_caused(id, config, Vec::new());
    }

    fn ingest_caused(&self, id: ObserverId, config: JobConfig, causes: Vec<ObserverId>) {
        if !self.inner.observers.read().contains(id.0) {
            trace!(observer = ?id, "ignoring ingest of dropped observer");
            return;
        }
        let derived = match self.observer_handler(id) {
            Some(handler) => handler.derive(&config),
            None => Derived::Notify,
        };
        let new_value = match derived {
            Derived::Unchanged => {
                trace!(observer = ?id, "value unchanged");
                return;
            }
            Derived::Value(value) => Some(value),
            Derived::Notify => None,
        };
        let perform = config.perform;
        let mut job = RuntimeJob::new(self, id, config, new_value);
        job.causes = causes;
        self.ingest(job, perform);
    }

    /// Accept a job.
    ///
    /// With `perform` set and no job currently performing, the job and
    /// everything queued behind it are performed before this returns.
    /// Otherwise the job is queued; a job ingested while another performs
    /// runs after it, in FIFO order.
    pub fn ingest(&self, job: RuntimeJob, perform: bool) {
        let mut queues = self.inner.queues.lock();
        if perform && !queues.is_performing_jobs {
            queues.is_performing_jobs = true;
            drop(queues);
            self.drain(job);
        } else {
            trace!(job = ?job.key, queued = queues.job_queue.len(), "queued job");
            queues.job_queue.push_back(job);
        }
    }

    /// Perform `job`, then every job queued behind it.
    ///
    /// Called while another job is performing, only `job` itself runs; the
    /// outer drain picks up the queue.
    pub fn perform(&self, job: RuntimeJob) {
        let nested = mem::replace(&mut self.inner.queues.lock().is_performing_jobs, true);
        if nested {
            self.perform_job(job);
        } else {
            self.drain(job);
        }
    }

    /// Perform whatever is queued, unless jobs are performing already.
    pub(crate) fn perform_queued(&self) {
        let job = {
            let mut queues = self.inner.queues.lock();
            if queues.is_performing_jobs {
                return;
            }
            let Some(job) = queues.job_queue.pop_front() else {
                return;
            };
            queues.is_performing_jobs = true;
            job
        };
        self.drain(job);
    }

    /// Perform jobs until the queue is empty. The caller owns `is_performing_jobs`.
    fn drain(&self, mut job: RuntimeJob) {
        let rerender = loop {
            self.perform_job(job);
            let mut queues = self.inner.queues.lock();
            match queues.job_queue.pop_front() {
                Some(next) => job = next,
                None => {
                    queues.is_performing_jobs = false;
                    break !queues.jobs_to_rerender.is_empty();
                }
            }
        };
        if rerender {
            self.schedule_update_subscribers();
        }
    }

    fn perform_job(&self, mut job: RuntimeJob) {
        if job.performed {
            cov_mark::hit!(job_already_performed);
            trace!(job = ?job.key, "job already performed");
            return;
        }
        self.perform_observer(&mut job);
        let observer = job.observer;
        let config = self.job_config().perform(false);
        let mut causes = mem::take(&mut job.causes);
        causes.push(observer);
        trace!(job = ?job.key, rerender = job.rerender, "performed job");
        if job.rerender {
            self.inner.queues.lock().jobs_to_rerender.push(job);
        }
        for dependent in self.observer_dependents(observer) {
            if causes.contains(&dependent) {
                cov_mark::hit!(dependency_cycle_cut);
                debug!(?observer, ?dependent, "dependency cycle, not cascading further");
                continue;
            }
            self.ingest_caused(dependent, config.clone(), causes.clone());
        }
    }

    /// Commit the job's value into its observer and run the owner's side effects.
    pub(crate) fn perform_observer(&self, job: &mut RuntimeJob) {
        if job.performed {
            return;
        }
        let handler = {
            let mut observers = self.inner.observers.write();
            observers.get_mut(job.observer.0).and_then(|node| {
                if let Some(value) = &job.new_value {
                    node.previous_value = node.value.replace(value.clone());
                }
                node.handler.clone()
            })
        };
        job.performed = true;
        if let Some(handler) = handler.and_then(|handler| handler.upgrade()) {
            handler.perform(job);
        }
    }

    /// Whether jobs are currently being performed.
    pub fn is_performing_jobs(&self) -> bool {
        self.inner.queues.lock().is_performing_jobs
    }

    // ---- rerender phase ----

    fn schedule_update_subscribers(&self) {
        self.inner.update_scheduled.store(true, Ordering::Release);
        if let Some(notifier) = self.inner.notifier.lock().as_ref() {
            // the loop may have exited; the flag is still set for flush()
            let _ = notifier.send(());
        }
    }

    /// Whether a rerender is pending.
    pub fn is_update_scheduled(&self) -> bool {
        self.inner.update_scheduled.load(Ordering::Acquire)
    }

    pub(crate) fn attach_notifier(&self, notifier: Sender<()>) {
        if self.is_update_scheduled() {
            let _ = notifier.send(());
        }
        *self.inner.notifier.lock() = Some(notifier);
    }

    /// Run a rerender now. Returns whether any container was dispatched.
    pub fn flush(&self) -> bool {
        self.update_subscribers()
    }

    /// Dispatch every pending rerender job to its containers.
    ///
    /// Jobs whose containers are not ready yet are kept for the next cycle
    /// until their retry budget runs out. Returns whether any container was
    /// dispatched.
    pub fn update_subscribers(&self) -> bool {
        self.inner.update_scheduled.store(false, Ordering::Release);
        let has_integration = self.has_integration();
        let jobs = {
            let mut queues = self.inner.queues.lock();
            if !has_integration {
                cov_mark::hit!(rerender_without_integration);
                queues.jobs_to_rerender.clear();
                queues.not_ready_jobs_to_rerender.clear();
                return false;
            }
            let mut jobs = mem::take(&mut queues.jobs_to_rerender);
            jobs.append(&mut queues.not_ready_jobs_to_rerender);
            jobs
        };
        if jobs.is_empty() {
            return false;
        }
        let containers = self.extract_to_update_subscription_container(jobs);
        if containers.is_empty() {
            return false;
        }
        self.update_subscription_container(&containers);
        true
    }

    /// Work out which containers `jobs` have to notify right now.
    ///
    /// Ready containers leave their job and are returned (once each) if
    /// their selectors let the change through. Not-ready containers keep
    /// their job alive for another cycle; stale ones are dropped.
    pub(crate) fn extract_to_update_subscription_container(
        &self,
        jobs: Vec<RuntimeJob>,
    ) -> Vec<ContainerId> {
        let mut to_update: FastIndexSet<ContainerId> = new_index_set();
        let mut not_ready_jobs = Vec::new();

        for mut job in jobs {
            let mut waiting = Vec::new();
            let pending: Vec<ContainerId> =
                job.subscription_containers_to_update.iter().copied().collect();
            for container in pending {
                let ready = self.with_container(container, |node| node.ready);
                match ready {
                    None => {
                        cov_mark::hit!(stale_container_skipped);
                        job.subscription_containers_to_update.shift_remove(&container);
                    }
                    Some(false) => waiting.push(container),
                    Some(true) => {
                        job.subscription_containers_to_update.shift_remove(&container);
                        if self.handle_selectors(container, &job) {
                            if let Some(node) = self.inner.containers.write().get_mut(container.0) {
                                node.updated_subscribers.insert(job.observer);
                            }
                            to_update.insert(container);
                        }
                    }
                }
            }

            if !waiting.is_empty() {
                job.tries_to_update += 1;
                if job.retries_exhausted() {
                    cov_mark::hit!(not_ready_container_dropped);
                    for container in waiting {
                        job.subscription_containers_to_update.shift_remove(&container);
                        warn!(
                            job = ?job.key,
                            ?container,
                            tries = job.tries_to_update,
                            "container never became ready, dropping update"
                        );
                    }
                } else {
                    warn!(
                        job = ?job.key,
                        waiting = waiting.len(),
                        tries = job.tries_to_update,
                        "containers not ready, retrying next update"
                    );
                }
            }

            if !job.subscription_containers_to_update.is_empty() {
                not_ready_jobs.push(job);
            }
        }

        if !not_ready_jobs.is_empty() {
            self.inner
                .queues
                .lock()
                .not_ready_jobs_to_rerender
                .append(&mut not_ready_jobs);
        }
        to_update.into_iter().collect()
    }

    /// Whether `container` wants to hear about `job`.
    ///
    /// Without selectors for the job's observer every change counts. With
    /// selectors, the change counts if any selector yields a different
    /// projection of the committed and the previous value.
    pub(crate) fn handle_selectors(&self, container: ContainerId, job: &RuntimeJob) -> bool {
        let selectors: Vec<Selector> = self
            .with_container(container, |node| node.selectors.get(&job.observer).cloned())
            .flatten()
            .unwrap_or_default();
        if selectors.is_empty() {
            return true;
        }
        let (value, previous) = self
            .inner
            .observers
            .read()
            .get(job.observer.0)
            .map(|node| (node.value.clone(), node.previous_value.clone()))
            .unwrap_or_default();
        let (Some(value), Some(previous)) = (value, previous) else {
            return true;
        };
        let changed = selectors.iter().any(|select| {
            match (select(&*value), select(&*previous)) {
                (Some(current), Some(previous)) => !values_equal(Some(&current), Some(&previous)),
                _ => true,
            }
        });
        if !changed {
            cov_mark::hit!(selector_suppressed_update);
            trace!(?container, observer = ?job.observer, "selectors unchanged");
        }
        changed
    }

    /// Dispatch each container once and clear what it was told about.
    ///
    /// The updated observers are taken from the container in one step, so
    /// two overlapping rerender passes never dispatch the same change twice
    /// or dispatch an empty payload.
    pub(crate) fn update_subscription_container(&self, containers: &[ContainerId]) {
        let integrations = self.inner.integrations.read().snapshot();
        let mut dispatched = 0;
        for &container in containers {
            let Ok((kind, updated)) = self.with_container_mut(container, |node| {
                (node.kind.clone(), mem::take(&mut node.updated_subscribers))
            }) else {
                continue;
            };
            if updated.is_empty() {
                trace!(?container, "already dispatched by another pass");
                continue;
            }
            let payload = self.get_updated_observer_values(container, &updated);
            match &kind {
                ContainerKind::Callback(callback) => callback(&payload),
                ContainerKind::Component(component) => {
                    for integration in &integrations {
                        integration.update_method(component, &payload);
                    }
                }
            }
            dispatched += 1;
            trace!(?container, ?kind, values = payload.len(), "updated container");
        }
        debug!(containers = dispatched, "updated subscription containers");
    }

    /// Payload for `container` from its `updated` observers: each under its
    /// subscriber key, falling back to the observer key. Observers with
    /// neither are left out.
    pub(crate) fn get_updated_observer_values(
        &self,
        container: ContainerId,
        updated: &FastIndexSet<ObserverId>,
    ) -> UpdatePayload {
        let entries: Vec<(ObserverId, Option<String>)> = self
            .with_container(container, |node| {
                updated
                    .iter()
                    .map(|observer| (*observer, node.subscriber_keys.get(observer).cloned()))
                    .collect()
            })
            .unwrap_or_default();

        let observers = self.inner.observers.read();
        let mut payload = UpdatePayload::new();
        for (observer, key) in entries {
            let Some(node) = observers.get(observer.0) else {
                continue;
            };
            let Some(key) = key.or_else(|| node.key.clone()) else {
                continue;
            };
            payload.insert(key, node.value.clone());
        }
        payload
    }

    // ---- subscriptions ----

    /// Register a container listening to `subscribers`.
    ///
    /// Callback containers are ready immediately. Component containers wait
    /// for [`SubscriptionContainer::set_ready`] unless `wait_for_mount` is off.
    pub fn subscribe(
        &self,
        kind: ContainerKind,
        subscribers: impl IntoIterator<Item = Subscriber>,
        config: SubscriptionConfig,
    ) -> SubscriptionContainer {
        let ready = match kind {
            ContainerKind::Callback(_) => true,
            ContainerKind::Component(_) => {
                !config.wait_for_mount.unwrap_or(self.inner.config.wait_for_mount)
            }
        };
        let key = config.key.unwrap_or_else(|| self.generate_key("container"));
        let mut node = ContainerNode::new(key, kind, ready);
        node.component_id = config.component_id;

        let subscribers: Vec<Subscriber> = {
            let observers = self.inner.observers.read();
            subscribers
                .into_iter()
                .filter(|subscriber| observers.contains(subscriber.observer.0))
                .collect()
        };
        for subscriber in &subscribers {
            node.subscribers.insert(subscriber.observer);
            if let Some(key) = &subscriber.key {
                node.subscriber_keys.insert(subscriber.observer, key.clone());
            }
            if !subscriber.selectors.is_empty() {
                node.selectors
                    .entry(subscriber.observer)
                    .or_default()
                    .extend(subscriber.selectors.iter().cloned());
            }
        }

        let key = node.key.clone();
        let id = insert_container(&mut self.inner.containers.write(), node);
        {
            let mut observers = self.inner.observers.write();
            for subscriber in &subscribers {
                if let Some(node) = observers.get_mut(subscriber.observer.0) {
                    node.subscribed_to.insert(id);
                }
            }
        }
        debug!(container = %key, subscribers = subscribers.len(), ready, "subscribed");
        SubscriptionContainer::new(self.clone(), id)
    }

    /// Remove a container and detach it from its observers.
    pub fn unsubscribe(&self, id: ContainerId) {
        let Some(node) = self.inner.containers.write().remove(id.0) else {
            return;
        };
        let mut observers = self.inner.observers.write();
        for observer in &node.subscribers {
            if let Some(observer) = observers.get_mut(observer.0) {
                observer.subscribed_to.shift_remove(&id);
            }
        }
        debug!(container = %node.key, "unsubscribed");
    }

    pub(crate) fn with_container<R>(
        &self,
        id: ContainerId,
        f: impl FnOnce(&ContainerNode) -> R,
    ) -> Option<R> {
        self.inner.containers.read().get(id.0).map(f)
    }

    fn with_container_mut<R>(
        &self,
        id: ContainerId,
        f: impl FnOnce(&mut ContainerNode) -> R,
    ) -> Result<R> {
        self.inner
            .containers
            .write()
            .get_mut(id.0)
            .map(f)
            .ok_or(Error::StaleContainer)
    }

    pub(crate) fn set_container_ready(&self, id: ContainerId) -> Result<()> {
        let key = self.with_container_mut(id, |node| {
            node.ready = true;
            node.key.clone()
        })?;
        debug!(container = %key, "container ready");
        let retry = !self.inner.queues.lock().not_ready_jobs_to_rerender.is_empty();
        if retry {
            self.schedule_update_subscribers();
        }
        Ok(())
    }

    pub(crate) fn add_container_selector(
        &self,
        id: ContainerId,
        observer: ObserverId,
        selector: Selector,
    ) -> Result<()> {
        if !self.inner.observers.read().contains(observer.0) {
            return Err(Error::StaleObserver);
        }
        self.with_container_mut(id, |node| {
            node.selectors.entry(observer).or_default().push(selector);
        })
    }

    pub(crate) fn remove_container_selectors(
        &self,
        id: ContainerId,
        observer: ObserverId,
    ) -> Result<()> {
        self.with_container_mut(id, |node| {
            node.selectors.shift_remove(&observer);
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::integration::ComponentInstance;
    use crate::value::observed;
    use crate::{Observer, ObserverConfig};

    #[derive(Default)]
    struct Recorder {
        updates: Mutex<Vec<UpdatePayload>>,
    }

    impl Integration for Recorder {
        fn key(&self) -> &str {
            "recorder"
        }

        fn update_method(&self, _: &ComponentInstance, payload: &UpdatePayload) {
            self.updates.lock().push(payload.clone());
        }
    }

    fn runtime_with_recorder() -> (Runtime, Arc<Recorder>) {
        let runtime = Runtime::new();
        let recorder = Arc::new(Recorder::default());
        runtime.integrate(recorder.clone()).unwrap();
        (runtime, recorder)
    }

    fn callback_counter(
        runtime: &Runtime,
        subscribers: impl IntoIterator<Item = Subscriber>,
    ) -> (SubscriptionContainer, Arc<Mutex<Vec<UpdatePayload>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let container = runtime.subscribe(
            ContainerKind::callback(move |payload| sink.lock().push(payload.clone())),
            subscribers,
            SubscriptionConfig::default(),
        );
        (container, seen)
    }

    #[test]
    fn duplicate_integration_is_rejected() {
        let (runtime, recorder) = runtime_with_recorder();
        assert_eq!(
            runtime.integrate(recorder),
            Err(Error::IntegrationExists("recorder".into()))
        );
    }

    #[test]
    fn nothing_rerenders_without_integration() {
        let runtime = Runtime::new();
        let observer = Observer::new(&runtime, ObserverConfig::default().key("a"));
        let (_container, seen) = callback_counter(&runtime, [Subscriber::from(&observer)]);

        observer.ingest_value(observed(1), JobConfig::default());

        assert_eq!(observer.value().unwrap().downcast_ref::<i32>(), Some(&1));
        assert!(!runtime.is_update_scheduled());
        assert!(!runtime.flush());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn background_jobs_skip_rerender() {
        let (runtime, _) = runtime_with_recorder();
        let observer = Observer::new(&runtime, ObserverConfig::default().key("a"));
        let (_container, seen) = callback_counter(&runtime, [Subscriber::from(&observer)]);

        observer.ingest_value(observed(1), JobConfig::default().background(true));

        assert_eq!(observer.value().unwrap().downcast_ref::<i32>(), Some(&1));
        assert!(!runtime.flush());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn jobs_ingested_while_performing_run_in_order() {
        let runtime = Runtime::new();
        let observer = Observer::new(&runtime, ObserverConfig::default());

        runtime.inner.queues.lock().is_performing_jobs = true;
        observer.ingest_value(observed("first"), JobConfig::default());
        observer.ingest_value(observed("second"), JobConfig::default());
        assert!(observer.value().is_none(), "queued jobs are not performed yet");
        assert_eq!(runtime.inner.queues.lock().job_queue.len(), 2);

        runtime.inner.queues.lock().is_performing_jobs = false;
        let job = RuntimeJob::new(&runtime, observer.id(), JobConfig::default(), Some(observed("zeroth")));
        runtime.perform(job);

        assert!(!runtime.is_performing_jobs());
        assert!(runtime.inner.queues.lock().job_queue.is_empty());
        assert_eq!(observer.value().unwrap().downcast_ref::<&str>(), Some(&"second"));
        assert_eq!(observer.previous_value().unwrap().downcast_ref::<&str>(), Some(&"first"));
    }

    #[test]
    fn ingest_without_perform_only_queues() {
        let runtime = Runtime::new();
        let observer = Observer::new(&runtime, ObserverConfig::default());
        observer.ingest_value(observed(5), JobConfig::default().perform(false));

        assert!(observer.value().is_none());
        assert_eq!(runtime.inner.queues.lock().job_queue.len(), 1);
    }

    #[test]
    fn performed_jobs_are_not_performed_again() {
        cov_mark::check!(job_already_performed);
        let runtime = Runtime::new();
        let observer = Observer::new(&runtime, ObserverConfig::default());
        let mut job = RuntimeJob::new(&runtime, observer.id(), JobConfig::default(), Some(observed(1)));
        observer.perform(&mut job);
        runtime.perform(job);
        assert!(observer.previous_value().is_none());
    }

    #[test]
    fn batched_jobs_dispatch_once() {
        let (runtime, _) = runtime_with_recorder();
        let a = Observer::new(&runtime, ObserverConfig::default().key("a"));
        let b = Observer::new(&runtime, ObserverConfig::default().key("b"));
        let (container, seen) =
            callback_counter(&runtime, [Subscriber::from(&a), Subscriber::from(&b)]);

        a.ingest_value(observed(1), JobConfig::default());
        b.ingest_value(observed(2), JobConfig::default());
        assert!(runtime.is_update_scheduled());
        assert!(seen.lock().is_empty(), "dispatch waits for the rerender phase");

        assert!(runtime.flush());
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get::<i32>("a"), Some(&1));
        assert_eq!(seen[0].get::<i32>("b"), Some(&2));
        assert!(container.is_ready());
        assert!(!runtime.is_update_scheduled());
        assert!(
            runtime
                .with_container(container.id(), |node| node.updated_subscribers.is_empty())
                .unwrap()
        );
    }

    #[test]
    fn overlapping_dispatch_passes_notify_once() {
        let (runtime, _) = runtime_with_recorder();
        let a = Observer::new(&runtime, ObserverConfig::default().key("a"));
        let (container, seen) = callback_counter(&runtime, [Subscriber::from(&a)]);

        a.ingest_value(observed(1), JobConfig::default());
        let jobs = mem::take(&mut runtime.inner.queues.lock().jobs_to_rerender);
        let containers = runtime.extract_to_update_subscription_container(jobs);
        assert_eq!(containers, [container.id()]);

        runtime.update_subscription_container(&containers);
        runtime.update_subscription_container(&containers);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get::<i32>("a"), Some(&1));
    }

    #[test]
    fn payload_keys_prefer_subscriber_key() {
        let (runtime, _) = runtime_with_recorder();
        let named = Observer::new(&runtime, ObserverConfig::default().key("observer"));
        let anonymous = Observer::new(&runtime, ObserverConfig::default());
        let hidden = Observer::new(&runtime, ObserverConfig::default());
        let (_container, seen) = callback_counter(
            &runtime,
            [
                Subscriber::keyed("alias", &named),
                Subscriber::keyed("anon", &anonymous),
                Subscriber::from(&hidden),
            ],
        );

        named.ingest_value(observed(1), JobConfig::default());
        anonymous.ingest_value(observed(2), JobConfig::default());
        hidden.ingest_value(observed(3), JobConfig::default());
        runtime.flush();

        let seen = seen.lock();
        assert_eq!(seen[0].keys().collect::<Vec<_>>(), ["alias", "anon"]);
    }

    #[test]
    fn selectors_filter_unrelated_changes() {
        #[derive(Debug, Clone, PartialEq)]
        struct User {
            name: String,
            age: u32,
        }

        let (runtime, _) = runtime_with_recorder();
        let user = Observer::new(
            &runtime,
            ObserverConfig::default().key("user").value(observed(User {
                name: "jeff".into(),
                age: 8,
            })),
        );
        let (container, seen) = callback_counter(
            &runtime,
            [Subscriber::from(&user).select(|user: &User| user.name.clone())],
        );

        {
            cov_mark::check!(selector_suppressed_update);
            user.ingest_value(
                observed(User { name: "jeff".into(), age: 9 }),
                JobConfig::default(),
            );
            assert!(!runtime.flush());
        }
        assert!(seen.lock().is_empty());

        user.ingest_value(
            observed(User { name: "frank".into(), age: 9 }),
            JobConfig::default(),
        );
        assert!(runtime.flush());
        assert_eq!(seen.lock().len(), 1);

        container.remove_selectors(user.id()).unwrap();
        user.ingest_value(
            observed(User { name: "frank".into(), age: 10 }),
            JobConfig::default(),
        );
        assert!(runtime.flush());
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn selector_type_mismatch_counts_as_change() {
        let (runtime, _) = runtime_with_recorder();
        let observer = Observer::new(
            &runtime,
            ObserverConfig::default().key("n").value(observed(1u8)),
        );
        let (container, seen) = callback_counter(&runtime, [Subscriber::from(&observer)]);
        container
            .register_selector(observer.id(), |value: &String| value.len())
            .unwrap();

        observer.ingest_value(observed(2u8), JobConfig::default());
        assert!(runtime.flush());
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn component_containers_go_through_integrations() {
        let (runtime, recorder) = runtime_with_recorder();
        let observer = Observer::new(&runtime, ObserverConfig::default().key("a"));
        runtime.subscribe(
            ContainerKind::component("widget"),
            [Subscriber::from(&observer)],
            SubscriptionConfig::default().wait_for_mount(false),
        );

        observer.ingest_value(observed(4), JobConfig::default());
        runtime.flush();

        let updates = recorder.updates.lock();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].get::<i32>("a"), Some(&4));
    }

    #[test]
    fn stale_containers_are_skipped() {
        cov_mark::check!(stale_container_skipped);
        let (runtime, _) = runtime_with_recorder();
        let observer = Observer::new(&runtime, ObserverConfig::default().key("a"));
        let (container, seen) = callback_counter(&runtime, [Subscriber::from(&observer)]);

        let job = RuntimeJob::new(&runtime, observer.id(), JobConfig::default(), Some(observed(1)));
        container.unsubscribe();
        runtime.ingest(job, true);

        assert!(!runtime.flush());
        assert!(seen.lock().is_empty());
        assert!(runtime.inner.queues.lock().not_ready_jobs_to_rerender.is_empty());
    }

    #[test]
    fn not_ready_containers_are_retried_then_dropped() {
        let (runtime, recorder) = runtime_with_recorder();
        let observer = Observer::new(&runtime, ObserverConfig::default().key("a"));
        let container = runtime.subscribe(
            ContainerKind::component(()),
            [Subscriber::from(&observer)],
            SubscriptionConfig::default(),
        );

        observer.ingest_value(observed(1), JobConfig::default().max_tries_to_update(Some(2)));
        assert!(!runtime.flush());
        assert_eq!(runtime.inner.queues.lock().not_ready_jobs_to_rerender.len(), 1);

        {
            cov_mark::check!(not_ready_container_dropped);
            assert!(!runtime.flush());
        }
        assert!(runtime.inner.queues.lock().not_ready_jobs_to_rerender.is_empty());

        container.set_ready().unwrap();
        assert!(!runtime.flush());
        assert!(recorder.updates.lock().is_empty());
    }

    #[test]
    fn set_ready_reschedules_waiting_jobs() {
        let (runtime, recorder) = runtime_with_recorder();
        let observer = Observer::new(&runtime, ObserverConfig::default().key("a"));
        let container = runtime.subscribe(
            ContainerKind::component(()),
            [Subscriber::from(&observer)],
            SubscriptionConfig::default(),
        );

        observer.ingest_value(observed(1), JobConfig::default());
        assert!(!runtime.flush());
        assert!(!runtime.is_update_scheduled());

        container.set_ready().unwrap();
        assert!(runtime.is_update_scheduled());
        assert!(runtime.flush());
        assert_eq!(recorder.updates.lock().len(), 1);
    }

    #[test]
    fn unbounded_retries_keep_waiting() {
        let runtime = Runtime::with_config(RuntimeConfig::default().max_tries_to_update(None));
        runtime.integrate(Arc::new(Recorder::default())).unwrap();
        let observer = Observer::new(&runtime, ObserverConfig::default().key("a"));
        runtime.subscribe(
            ContainerKind::component(()),
            [Subscriber::from(&observer)],
            SubscriptionConfig::default(),
        );

        observer.ingest_value(observed(1), runtime.job_config());
        for _ in 0..10 {
            runtime.flush();
        }
        let queues = runtime.inner.queues.lock();
        assert_eq!(queues.not_ready_jobs_to_rerender.len(), 1);
        assert_eq!(queues.not_ready_jobs_to_rerender[0].tries_to_update(), 10);
    }

    #[test]
    fn cascade_reingests_dependents() {
        let runtime = Runtime::new();
        let source = Observer::new(&runtime, ObserverConfig::default());
        let sink = Observer::new(&runtime, ObserverConfig::default().depends_on(source.id()));

        struct Counting(AtomicUsize);
        impl ObserverHandler for Counting {
            fn perform(&self, _: &RuntimeJob) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let handler: Weak<dyn ObserverHandler> = Arc::downgrade(&counting) as Weak<Counting>;
        sink.set_handler(handler);

        source.ingest_value(observed(1), JobConfig::default());
        assert_eq!(counting.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn tracked_records_reads() {
        let runtime = Runtime::new();
        let a = Observer::new(&runtime, ObserverConfig::default());
        let b = Observer::new(&runtime, ObserverConfig::default());

        let ((), read) = runtime.tracked(|| {
            a.value();
            runtime.untracked(|| b.value());
            b.value_untracked();
            a.value();
        });
        assert_eq!(read, vec![a.id()]);
    }
}
