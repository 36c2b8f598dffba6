//! Subscription containers: the runtime-side record of one consumer.
//!
//! A container is either a plain callback or an opaque component handed to
//! the registered integrations. It subscribes to a set of observers, may be
//! not ready (a component that has not mounted yet), and may carry selectors
//! that narrow which changes of an observer it cares about.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::Runtime;
use crate::arena::{ContainerId, ObserverId};
use crate::error::Result;
use crate::integration::{ComponentInstance, UpdatePayload};
use crate::observer::Observer;
use crate::value::{ObservedValue, Observable, observed};

/// Callback invoked with the changed values of a callback container.
pub type UpdateCallback = Arc<dyn Fn(&UpdatePayload) + Send + Sync>;

/// Projection of an observer's value. `None` means the projection did not
/// apply (wrong type), which always counts as a change.
pub type Selector = Arc<dyn Fn(&dyn Observable) -> Option<ObservedValue> + Send + Sync>;

/// Build a [`Selector`] from a typed projection.
pub fn selector<T, U, F>(select: F) -> Selector
where
    T: Any,
    U: Observable,
    F: Fn(&T) -> U + Send + Sync + 'static,
{
    Arc::new(move |value: &dyn Observable| value.downcast_ref::<T>().map(|v| observed(select(v))))
}

/// What a container dispatches to.
#[derive(Clone)]
pub enum ContainerKind {
    /// Invoke the callback directly. Ready from the start.
    Callback(UpdateCallback),
    /// Pass the component to every integration's update method.
    Component(ComponentInstance),
}

impl ContainerKind {
    /// Callback container kind.
    pub fn callback(callback: impl Fn(&UpdatePayload) + Send + Sync + 'static) -> Self {
        Self::Callback(Arc::new(callback))
    }

    /// Component container kind.
    pub fn component<C: Any + Send + Sync>(component: C) -> Self {
        Self::Component(Arc::new(component))
    }
}

impl fmt::Debug for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("Callback"),
            Self::Component(_) => f.write_str("Component"),
        }
    }
}

/// One observer a container subscribes to.
pub struct Subscriber {
    pub(crate) observer: ObserverId,
    pub(crate) key: Option<String>,
    pub(crate) selectors: Vec<Selector>,
}

impl Subscriber {
    /// Subscriber whose payload entry is named `key` instead of the observer key.
    pub fn keyed(key: impl Into<String>, observer: impl Into<Subscriber>) -> Self {
        let mut subscriber = observer.into();
        subscriber.key = Some(key.into());
        subscriber
    }

    /// Only notify when `select` of the value changes.
    pub fn select<T, U, F>(mut self, select: F) -> Self
    where
        T: Any,
        U: Observable,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        self.selectors.push(selector(select));
        self
    }

    /// Observer behind this subscriber.
    pub fn observer(&self) -> ObserverId {
        self.observer
    }
}

impl From<ObserverId> for Subscriber {
    fn from(observer: ObserverId) -> Self {
        Self {
            observer,
            key: None,
            selectors: Vec::new(),
        }
    }
}

impl From<&Observer> for Subscriber {
    fn from(observer: &Observer) -> Self {
        observer.id().into()
    }
}

/// Options for [`Runtime::subscribe`].
#[derive(Clone, Debug, Default)]
pub struct SubscriptionConfig {
    /// Container key; generated when absent.
    pub key: Option<String>,
    /// Identifier of the component, for integrations that need one.
    pub component_id: Option<String>,
    /// Overrides [`RuntimeConfig::wait_for_mount`](crate::RuntimeConfig::wait_for_mount).
    pub wait_for_mount: Option<bool>,
}

impl SubscriptionConfig {
    /// Set [`key`](Self::key).
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set [`component_id`](Self::component_id).
    pub fn component_id(mut self, id: impl Into<String>) -> Self {
        self.component_id = Some(id.into());
        self
    }

    /// Set [`wait_for_mount`](Self::wait_for_mount).
    pub fn wait_for_mount(mut self, wait: bool) -> Self {
        self.wait_for_mount = Some(wait);
        self
    }
}

/// Handle to a registered container.
///
/// Cloning the handle does not duplicate the subscription. The container
/// stays registered until [`unsubscribe`](Self::unsubscribe) is called.
#[derive(Clone)]
pub struct SubscriptionContainer {
    runtime: Runtime,
    id: ContainerId,
}

impl SubscriptionContainer {
    pub(crate) fn new(runtime: Runtime, id: ContainerId) -> Self {
        Self { runtime, id }
    }

    /// Arena id.
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Container key, `None` once unsubscribed.
    pub fn key(&self) -> Option<String> {
        self.runtime.with_container(self.id, |node| node.key.clone())
    }

    /// Component id given at subscription time.
    pub fn component_id(&self) -> Option<String> {
        self.runtime
            .with_container(self.id, |node| node.component_id.clone())
            .flatten()
    }

    /// Whether updates can be delivered.
    pub fn is_ready(&self) -> bool {
        self.runtime
            .with_container(self.id, |node| node.ready)
            .unwrap_or(false)
    }

    /// Whether the container is still registered.
    pub fn is_subscribed(&self) -> bool {
        self.runtime.with_container(self.id, |_| ()).is_some()
    }

    /// Whether payload entries are named by subscriber keys.
    pub fn is_object_based(&self) -> bool {
        self.runtime
            .with_container(self.id, |node| node.is_object_based())
            .unwrap_or(false)
    }

    /// Observers this container listens to.
    pub fn subscribers(&self) -> Vec<ObserverId> {
        self.runtime
            .with_container(self.id, |node| node.subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Mark the container mounted. Pending updates are rescheduled.
    pub fn set_ready(&self) -> Result<()> {
        self.runtime.set_container_ready(self.id)
    }

    /// Add a selector for `observer`'s value.
    pub fn register_selector<T, U, F>(&self, observer: ObserverId, select: F) -> Result<()>
    where
        T: Any,
        U: Observable,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        self.runtime
            .add_container_selector(self.id, observer, selector(select))
    }

    /// Drop all selectors for `observer`; every change notifies again.
    pub fn remove_selectors(&self, observer: ObserverId) -> Result<()> {
        self.runtime.remove_container_selectors(self.id, observer)
    }

    /// Unregister the container and detach it from its observers.
    pub fn unsubscribe(&self) {
        self.runtime.unsubscribe(self.id);
    }
}

impl fmt::Debug for SubscriptionContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionContainer")
            .field("id", &self.id)
            .field("key", &self.key())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObserverConfig;
    use crate::error::Error;

    #[test]
    fn typed_selector_projects() {
        #[derive(Debug, PartialEq)]
        struct User {
            name: &'static str,
            age: u32,
        }

        let by_name = selector(|user: &User| user.name);
        let user = User { name: "jeff", age: 3 };
        let projected = by_name(&user as &dyn Observable).unwrap();
        assert_eq!(projected.downcast_ref::<&str>(), Some(&"jeff"));
        assert!(by_name(&7u32 as &dyn Observable).is_none());
        assert_eq!(user.age, 3);
    }

    #[test]
    fn callback_containers_start_ready() {
        let runtime = Runtime::new();
        let observer = Observer::new(&runtime, ObserverConfig::default().key("a"));
        let container = runtime.subscribe(
            ContainerKind::callback(|_| {}),
            [Subscriber::from(&observer)],
            SubscriptionConfig::default().key("callback"),
        );

        assert!(container.is_ready());
        assert_eq!(container.key().as_deref(), Some("callback"));
        assert_eq!(container.subscribers(), vec![observer.id()]);
        assert_eq!(observer.subscribed_to(), vec![container.id()]);
        assert!(!container.is_object_based());
    }

    #[test]
    fn component_containers_wait_for_mount() {
        let runtime = Runtime::new();
        let observer = Observer::new(&runtime, ObserverConfig::default());
        let waiting = runtime.subscribe(
            ContainerKind::component(()),
            [Subscriber::keyed("value", &observer)],
            SubscriptionConfig::default(),
        );
        let eager = runtime.subscribe(
            ContainerKind::component(()),
            [Subscriber::keyed("value", &observer)],
            SubscriptionConfig::default().wait_for_mount(false),
        );

        assert!(!waiting.is_ready());
        assert!(eager.is_ready());
        assert!(waiting.is_object_based());

        waiting.set_ready().unwrap();
        assert!(waiting.is_ready());
    }

    #[test]
    fn unsubscribe_detaches_observers() {
        let runtime = Runtime::new();
        let observer = Observer::new(&runtime, ObserverConfig::default());
        let container = runtime.subscribe(
            ContainerKind::callback(|_| {}),
            [Subscriber::from(&observer)],
            SubscriptionConfig::default(),
        );

        container.unsubscribe();
        assert!(!container.is_subscribed());
        assert!(observer.subscribed_to().is_empty());
        assert_eq!(container.set_ready(), Err(Error::StaleContainer));
        assert_eq!(
            container.register_selector(observer.id(), |v: &u32| *v),
            Err(Error::StaleContainer)
        );
    }

    #[test]
    fn dropped_observer_leaves_containers() {
        let runtime = Runtime::new();
        let observer = Observer::new(&runtime, ObserverConfig::default());
        let container = runtime.subscribe(
            ContainerKind::callback(|_| {}),
            [Subscriber::from(&observer)],
            SubscriptionConfig::default(),
        );

        drop(observer);
        assert!(container.subscribers().is_empty());
    }
}
