//! Runtime-wide defaults.

/// Default number of drain cycles a job waits on a not-ready container.
pub const DEFAULT_MAX_TRIES_TO_UPDATE: u32 = 3;

/// Configuration for a [`Runtime`](crate::Runtime).
///
/// ```ignore
/// let runtime = Runtime::with_config(
///     RuntimeConfig::default()
///         .wait_for_mount(false)
///         .max_tries_to_update(None),
/// );
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Whether component containers start not ready and wait for
    /// [`set_ready`](crate::SubscriptionContainer::set_ready).
    pub wait_for_mount: bool,
    /// Retry bound copied into every job built from [`Runtime::job_config`](crate::Runtime::job_config).
    /// `None` retries until the container becomes ready.
    pub max_tries_to_update: Option<u32>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            wait_for_mount: true,
            max_tries_to_update: Some(DEFAULT_MAX_TRIES_TO_UPDATE),
        }
    }
}

impl RuntimeConfig {
    /// Set [`wait_for_mount`](Self::wait_for_mount).
    pub fn wait_for_mount(mut self, wait: bool) -> Self {
        self.wait_for_mount = wait;
        self
    }

    /// Set [`max_tries_to_update`](Self::max_tries_to_update).
    pub fn max_tries_to_update(mut self, tries: Option<u32>) -> Self {
        self.max_tries_to_update = tries;
        self
    }
}
