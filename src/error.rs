use thiserror::Error;

/// Errors returned by registration-time calls.
///
/// The scheduler itself never returns these; it degrades to logged skips.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A watcher with this key is already registered on the state.
    #[error("watcher callback with the key '{0}' already exists")]
    WatcherExists(String),

    /// An integration with this key is already registered on the runtime.
    #[error("integration with the key '{0}' is already registered")]
    IntegrationExists(String),

    /// The observer was dropped before the call.
    #[error("observer no longer exists")]
    StaleObserver,

    /// The subscription container was unsubscribed before the call.
    #[error("subscription container no longer exists")]
    StaleContainer,
}

/// Result alias for fallible registration calls.
pub type Result<T, E = Error> = std::result::Result<T, E>;
