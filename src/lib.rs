#![deny(missing_docs)]

//! Reactive value store with batched, readiness-aware UI dispatch.
//!
//! Values live in observers that form a dependency graph. Writing a value
//! creates a job; performing it commits the value right away and re-evaluates
//! every dependent. UI consumers subscribe through containers and are told
//! about changes later, in one batched rerender per container.
//!
//! # Quick Start
//!
//! ```ignore
//! use reactant::{Computed, ContainerKind, Runtime, State, Subscriber, SubscriptionConfig};
//!
//! let runtime = Runtime::new();
//! runtime.integrate(Arc::new(MyUiIntegration))?;
//!
//! let first = State::with_config(&runtime, "Jeff".to_owned(), StateConfig::default().key("first"));
//! let count = State::with_config(&runtime, 0, StateConfig::default().key("count"));
//! let label = Computed::new(&runtime, {
//!     let (first, count) = (first.clone(), count.clone());
//!     move || format!("{} clicked {} times", first.get(), count.get())
//! });
//!
//! let container = runtime.subscribe(
//!     ContainerKind::callback(|payload| println!("{:?}", payload.get::<String>("label"))),
//!     [Subscriber::keyed("label", &label), Subscriber::from(&count)],
//!     SubscriptionConfig::default(),
//! );
//!
//! count.set(1);
//! first.set("Frank".into());
//! assert_eq!(label.get(), "Frank clicked 1 times"); // visible immediately
//!
//! runtime.flush(); // one callback with both `label` and `count`
//! ```
//!
//! # Core Types
//!
//! - [`Runtime`] - Scheduler owning the graph, the containers and the job queues.
//! - [`Observer`] - Graph node holding one type-erased value.
//! - [`State<T>`] - Typed value with watchers, side effects and undo.
//! - [`Computed<T>`] - Derived value with auto-discovered dependencies.
//! - [`SubscriptionContainer`] - A UI consumer, optionally gated by readiness and selectors.
//! - [`Integration`] - Adapter that rerenders component containers.
//!
//! # Rerendering
//!
//! ```ignore
//! runtime.flush();                      // dispatch pending updates now
//! runtime.is_update_scheduled();        // anything waiting?
//! RerenderLoop::new(&runtime).spawn();  // or let a background thread do it
//! ```
//!
//! Nothing is dispatched while no integration is registered.
//!
//! # Readiness
//!
//! Component containers start not ready (see [`RuntimeConfig::wait_for_mount`]).
//! Updates for them are kept for a bounded number of rerender cycles
//! ([`RuntimeConfig::max_tries_to_update`]) and delivered once
//! [`SubscriptionContainer::set_ready`] is called.

pub(crate) mod arena;
mod computed;
mod config;
mod error;
mod executor;
mod hash;
mod integration;
mod job;
mod observer;
mod runtime;
mod state;
mod subscription;
mod tracker;
mod value;

pub use arena::{ContainerId, ObserverId};
pub use computed::{Computed, ComputedConfig};
pub use config::{DEFAULT_MAX_TRIES_TO_UPDATE, RuntimeConfig};
pub use error::{Error, Result};
pub use executor::{DEFAULT_DEBOUNCE, DEFAULT_MAX_DEBOUNCE, RerenderLoop};
pub use integration::{ComponentInstance, Integration, Integrations, UpdatePayload};
pub use job::{JobConfig, RuntimeJob, SideEffectConfig};
pub use observer::{Derived, Observer, ObserverConfig, ObserverHandler};
pub use runtime::Runtime;
pub use state::{SideEffect, State, StateConfig, StateValue, Watcher};
pub use subscription::{
    ContainerKind, Selector, Subscriber, SubscriptionConfig, SubscriptionContainer,
    UpdateCallback, selector,
};
pub use tracker::ComputedTracker;
pub use value::{Observable, ObservedValue, observed, values_equal};
