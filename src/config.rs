use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheBackend, MemoryBackend, SharedDefinitions};
use crate::events::ErrorCallback;
use crate::poller_thread::PollerThreadConfig;
use crate::{Client, Error, Result};

/// Where flag results (and, with leader election, shared definitions) are cached.
#[derive(Clone)]
#[non_exhaustive]
pub enum CacheBackendConfig {
    /// In-process cache holding at most `max_entries` flag results.
    Memory {
        /// Entry limit of the cache.
        max_entries: usize,
    },
    /// Redis server at the given URL, e.g. `redis://127.0.0.1/`.
    #[cfg(feature = "redis")]
    Redis(String),
    /// Any other backend.
    Custom(Arc<dyn CacheBackend>),
}

impl Default for CacheBackendConfig {
    fn default() -> CacheBackendConfig {
        CacheBackendConfig::Memory {
            max_entries: MemoryBackend::DEFAULT_MAX_ENTRIES,
        }
    }
}

impl fmt::Debug for CacheBackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheBackendConfig::Memory { max_entries } => f
                .debug_struct("Memory")
                .field("max_entries", max_entries)
                .finish(),
            #[cfg(feature = "redis")]
            CacheBackendConfig::Redis(url) => f.debug_tuple("Redis").field(url).finish(),
            CacheBackendConfig::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Configuration for [`Client`].
///
/// ```
/// # use std::time::Duration;
/// # use posthog::ClientConfig;
/// let config = ClientConfig::new("phc_project_api_key")
///     .with_personal_api_key("phx_personal_api_key")
///     .with_poll_interval(Duration::from_secs(60));
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) api_key: String,
    pub(crate) host: String,
    pub(crate) personal_api_key: Option<String>,
    pub(crate) poller: PollerThreadConfig,
    pub(crate) request_timeout: Duration,
    pub(crate) flush_at: usize,
    pub(crate) flush_interval: Duration,
    pub(crate) max_retries: u32,
    pub(crate) retry_backoff: Duration,
    pub(crate) max_queue_size: usize,
    pub(crate) sync_mode: bool,
    pub(crate) gzip: bool,
    pub(crate) worker_threads: usize,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) cache_ttl: Duration,
    pub(crate) stale_cache_ttl: Duration,
    pub(crate) cache_backend: CacheBackendConfig,
    pub(crate) cache_namespace: String,
    pub(crate) shared_definitions: bool,
    pub(crate) lock_ttl: Duration,
    pub(crate) send_feature_flag_events: bool,
    pub(crate) only_evaluate_locally: bool,
    pub(crate) disabled: bool,
    pub(crate) on_error: Option<ErrorCallback>,
}

impl ClientConfig {
    /// Default host for API calls.
    pub const DEFAULT_HOST: &'static str = "https://us.i.posthog.com";
    /// Default timeout of each HTTP request.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default number of events per batch.
    pub const DEFAULT_FLUSH_AT: usize = 100;
    /// Default time to wait for a batch to fill up.
    pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);
    /// Default number of retries of a failed batch.
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    /// Default delay before the first retry. Doubled on every following attempt.
    pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);
    /// Default capacity of the delivery queue.
    pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;
    /// Default bound for [`Client::flush`] and [`Client::shutdown`].
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
    /// Default time a cached flag result is served in preference to remote evaluation.
    pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
    /// Default time a cached flag result remains usable as a last resort.
    pub const DEFAULT_STALE_CACHE_TTL: Duration = Duration::from_secs(3600);
    /// Default prefix of cache keys.
    pub const DEFAULT_CACHE_NAMESPACE: &'static str = "posthog";

    /// Create a default configuration using the project API key.
    pub fn new(api_key: impl Into<String>) -> ClientConfig {
        ClientConfig {
            api_key: api_key.into(),
            host: ClientConfig::DEFAULT_HOST.to_owned(),
            personal_api_key: None,
            poller: PollerThreadConfig::default(),
            request_timeout: ClientConfig::DEFAULT_REQUEST_TIMEOUT,
            flush_at: ClientConfig::DEFAULT_FLUSH_AT,
            flush_interval: ClientConfig::DEFAULT_FLUSH_INTERVAL,
            max_retries: ClientConfig::DEFAULT_MAX_RETRIES,
            retry_backoff: ClientConfig::DEFAULT_RETRY_BACKOFF,
            max_queue_size: ClientConfig::DEFAULT_MAX_QUEUE_SIZE,
            sync_mode: false,
            gzip: false,
            worker_threads: 1,
            shutdown_timeout: ClientConfig::DEFAULT_SHUTDOWN_TIMEOUT,
            cache_ttl: ClientConfig::DEFAULT_CACHE_TTL,
            stale_cache_ttl: ClientConfig::DEFAULT_STALE_CACHE_TTL,
            cache_backend: CacheBackendConfig::default(),
            cache_namespace: ClientConfig::DEFAULT_CACHE_NAMESPACE.to_owned(),
            shared_definitions: false,
            lock_ttl: SharedDefinitions::DEFAULT_LOCK_TTL,
            send_feature_flag_events: true,
            only_evaluate_locally: false,
            disabled: false,
            on_error: None,
        }
    }

    /// Override the API host, e.g. `https://eu.i.posthog.com` or a self-hosted instance.
    pub fn with_host(mut self, host: impl Into<String>) -> ClientConfig {
        self.host = host.into();
        self
    }

    /// Enable local flag evaluation by polling flag definitions with a personal API key.
    pub fn with_personal_api_key(mut self, personal_api_key: impl Into<String>) -> ClientConfig {
        self.personal_api_key = Some(personal_api_key.into());
        self
    }

    /// How often flag definitions are polled.
    pub fn with_poll_interval(mut self, interval: Duration) -> ClientConfig {
        self.poller = self.poller.with_interval(interval);
        self
    }

    /// Random amount subtracted from each poll interval.
    pub fn with_poll_jitter(mut self, jitter: Duration) -> ClientConfig {
        self.poller = self.poller.with_jitter(jitter);
        self
    }

    /// Timeout of each HTTP request.
    pub fn with_request_timeout(mut self, timeout: Duration) -> ClientConfig {
        self.request_timeout = timeout;
        self
    }

    /// Maximum number of events per batch.
    pub fn with_flush_at(mut self, flush_at: usize) -> ClientConfig {
        self.flush_at = flush_at;
        self
    }

    /// Maximum time spent filling a batch before sending it.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> ClientConfig {
        self.flush_interval = flush_interval;
        self
    }

    /// Number of times a failed batch is retried before it is dropped.
    pub fn with_max_retries(mut self, max_retries: u32) -> ClientConfig {
        self.max_retries = max_retries;
        self
    }

    /// Delay before the first retry. Doubled for each further attempt, up to 10 seconds.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> ClientConfig {
        self.retry_backoff = backoff;
        self
    }

    /// Capacity of the delivery queue. Capture calls fail with
    /// [`EnqueueError::QueueFull`](crate::EnqueueError::QueueFull) beyond it.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> ClientConfig {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Send every event on the calling thread before returning, instead of in the background.
    pub fn with_sync_mode(mut self, sync_mode: bool) -> ClientConfig {
        self.sync_mode = sync_mode;
        self
    }

    /// Compress batches with gzip.
    pub fn with_gzip(mut self, gzip: bool) -> ClientConfig {
        self.gzip = gzip;
        self
    }

    /// Number of background delivery threads.
    pub fn with_worker_threads(mut self, worker_threads: usize) -> ClientConfig {
        self.worker_threads = worker_threads;
        self
    }

    /// Upper bound on [`Client::flush`] and [`Client::shutdown`].
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> ClientConfig {
        self.shutdown_timeout = timeout;
        self
    }

    /// How long a cached flag result is fresh, and how long it remains usable as a fallback.
    pub fn with_cache_ttl(mut self, ttl: Duration, stale_ttl: Duration) -> ClientConfig {
        self.cache_ttl = ttl;
        self.stale_cache_ttl = stale_ttl;
        self
    }

    /// Where flag results are cached.
    pub fn with_cache_backend(mut self, backend: CacheBackendConfig) -> ClientConfig {
        self.cache_backend = backend;
        self
    }

    /// Prefix of every cache key. Instances of the same service should share it.
    pub fn with_cache_namespace(mut self, namespace: impl Into<String>) -> ClientConfig {
        self.cache_namespace = namespace.into();
        self
    }

    /// Elect one instance per cache namespace to poll definitions and share them through the
    /// cache backend. `lock_ttl` must exceed the poll interval.
    pub fn with_shared_definitions(mut self, lock_ttl: Duration) -> ClientConfig {
        self.shared_definitions = true;
        self.lock_ttl = lock_ttl;
        self
    }

    /// Whether to send `$feature_flag_called` events.
    pub fn with_feature_flag_events(mut self, send: bool) -> ClientConfig {
        self.send_feature_flag_events = send;
        self
    }

    /// Never fall back to remote evaluation.
    pub fn with_only_evaluate_locally(mut self, only_locally: bool) -> ClientConfig {
        self.only_evaluate_locally = only_locally;
        self
    }

    /// Drop all events and return no flags, without any network traffic.
    pub fn with_disabled(mut self, disabled: bool) -> ClientConfig {
        self.disabled = disabled;
        self
    }

    /// Called when a batch is dropped after exhausting its retries.
    ///
    /// ```
    /// # use posthog::ClientConfig;
    /// let config = ClientConfig::new("api-key").with_on_error(|err, batch| {
    ///     eprintln!("dropped {} events: {err}", batch.len());
    /// });
    /// ```
    pub fn with_on_error(
        mut self,
        on_error: impl Fn(&Error, &[crate::events::Envelope]) + Send + Sync + 'static,
    ) -> ClientConfig {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(Error::InvalidConfig("api_key must not be empty"));
        }
        if self.flush_at == 0 {
            return Err(Error::InvalidConfig("flush_at must be positive"));
        }
        if self.max_queue_size == 0 {
            return Err(Error::InvalidConfig("max_queue_size must be positive"));
        }
        if self.shared_definitions && self.lock_ttl <= self.poller.interval {
            return Err(Error::InvalidConfig("lock_ttl must exceed the poll interval"));
        }
        Ok(())
    }

    /// Create a new [`Client`] using this configuration.
    pub fn to_client(self) -> Result<Client> {
        Client::new(self)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("local_evaluation", &self.personal_api_key.is_some())
            .field("poller", &self.poller)
            .field("flush_at", &self.flush_at)
            .field("flush_interval", &self.flush_interval)
            .field("sync_mode", &self.sync_mode)
            .field("cache_backend", &self.cache_backend)
            .field("cache_namespace", &self.cache_namespace)
            .field("shared_definitions", &self.shared_definitions)
            .field("disabled", &self.disabled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::new("phc_test");
        assert!(config.validate().is_ok());
        assert_eq!(config.poller.interval, Duration::from_secs(30));
        assert_eq!(config.flush_at, 100);
        assert!(config.personal_api_key.is_none());
    }

    #[test]
    fn rejects_invalid_values() {
        let invalid = [
            ClientConfig::new(""),
            ClientConfig::new("phc_test").with_flush_at(0),
            ClientConfig::new("phc_test").with_max_queue_size(0),
            ClientConfig::new("phc_test")
                .with_poll_interval(Duration::from_secs(60))
                .with_shared_definitions(Duration::from_secs(60)),
        ];
        for config in invalid {
            assert!(
                matches!(config.validate(), Err(Error::InvalidConfig(_))),
                "{config:?} should be invalid"
            );
        }
    }

    #[test]
    fn debug_hides_credentials() {
        let config = ClientConfig::new("phc_secret").with_personal_api_key("phx_secret");
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("local_evaluation: true"));
    }
}
