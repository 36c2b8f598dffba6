//! Adapters that turn a container update into a rerender of some UI.
//!
//! The runtime knows nothing about components. For a component-backed
//! container it hands the opaque [`ComponentInstance`] and the changed
//! values to every registered [`Integration`], in registration order.

use std::any::Any;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::hash::{FastIndexMap, new_index_map};
use crate::value::ObservedValue;

/// Opaque handle to a UI component, owned by the integration that made it.
pub type ComponentInstance = Arc<dyn Any + Send + Sync>;

/// A UI framework adapter.
pub trait Integration: Send + Sync {
    /// Unique name of the adapter.
    fn key(&self) -> &str;

    /// Rerender `component` with the values in `payload`.
    fn update_method(&self, component: &ComponentInstance, payload: &UpdatePayload);
}

/// Ordered registry of integrations.
#[derive(Default)]
pub struct Integrations {
    integrations: Vec<Arc<dyn Integration>>,
}

impl Integrations {
    /// Add an integration. Keys must be unique.
    pub fn register(&mut self, integration: Arc<dyn Integration>) -> Result<()> {
        if self.integrations.iter().any(|i| i.key() == integration.key()) {
            return Err(Error::IntegrationExists(integration.key().to_owned()));
        }
        self.integrations.push(integration);
        Ok(())
    }

    /// Whether anything is registered.
    pub fn has_integration(&self) -> bool {
        !self.integrations.is_empty()
    }

    /// Keys in registration order.
    pub fn keys(&self) -> Vec<String> {
        self.integrations.iter().map(|i| i.key().to_owned()).collect()
    }

    /// Cheap copy for dispatching without holding the registry lock.
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn Integration>> {
        self.integrations.clone()
    }
}

/// Values delivered to a container, keyed by subscriber key.
///
/// Only observers that changed since the container was last updated appear.
#[derive(Clone, Debug, Default)]
pub struct UpdatePayload {
    values: FastIndexMap<String, Option<ObservedValue>>,
}

impl UpdatePayload {
    pub(crate) fn new() -> Self {
        Self {
            values: new_index_map(),
        }
    }

    pub(crate) fn insert(&mut self, key: String, value: Option<ObservedValue>) {
        self.values.insert(key, value);
    }

    /// The value under `key` as `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.get_raw(key).and_then(|value| value.downcast_ref::<T>())
    }

    /// The type-erased value under `key`.
    pub fn get_raw(&self, key: &str) -> Option<&ObservedValue> {
        self.values.get(key).and_then(Option::as_ref)
    }

    /// Whether `key` is present, even if its observer holds no value.
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Keys in the order the observers subscribed.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Entries in subscription order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&ObservedValue>)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }
}
