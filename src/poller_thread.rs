//! A background poller thread that periodically requests flag definitions from the server and
//! stores them in a definition store.
use std::{
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex, PoisonError},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::cache::{FlagResultCache, SharedDefinitions};
use crate::definition_store::DefinitionStore;
use crate::flag_fetcher::{DefinitionsFetcher, FetchOutcome};
use crate::flags::FlagDefinitionsResponse;
use crate::{Error, Result};

/// Configuration for [`PollerThread`].
#[derive(Debug, Clone)]
pub struct PollerThreadConfig {
    /// Interval to wait between requests for definitions.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_INTERVAL`].
    pub interval: Duration,
    /// Jitter applies a randomized duration to wait between requests for definitions. This helps
    /// to avoid multiple server instances synchronizing and producing spiky network load.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_JITTER`].
    pub jitter: Duration,
}

impl PollerThreadConfig {
    /// Default value for [`PollerThreadConfig::interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
    /// Default value for [`PollerThreadConfig::jitter`].
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);

    /// Create a new `PollerThreadConfig` using default configuration.
    pub fn new() -> PollerThreadConfig {
        PollerThreadConfig::default()
    }

    /// Update poll interval with `interval`.
    pub fn with_interval(mut self, interval: Duration) -> PollerThreadConfig {
        self.interval = interval;
        self
    }

    /// Update poll interval jitter with `jitter`.
    pub fn with_jitter(mut self, jitter: Duration) -> PollerThreadConfig {
        self.jitter = jitter;
        self
    }
}

impl Default for PollerThreadConfig {
    fn default() -> PollerThreadConfig {
        PollerThreadConfig {
            interval: PollerThreadConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollerThreadConfig::DEFAULT_POLL_JITTER,
        }
    }
}

/// A single refresh cycle: decide whether to fetch, fetch or read shared definitions, store them,
/// and keep the result cache consistent with the stored version.
pub(crate) struct DefinitionPoller {
    fetcher: DefinitionsFetcher,
    store: Arc<DefinitionStore>,
    cache: Arc<FlagResultCache>,
    shared: Option<SharedDefinitions>,
}

impl DefinitionPoller {
    pub(crate) fn new(
        fetcher: DefinitionsFetcher,
        store: Arc<DefinitionStore>,
        cache: Arc<FlagResultCache>,
        shared: Option<SharedDefinitions>,
    ) -> DefinitionPoller {
        DefinitionPoller {
            fetcher,
            store,
            cache,
            shared,
        }
    }

    pub(crate) fn poll(&mut self) -> Result<()> {
        if let Some(shared) = &self.shared {
            if !shared.should_fetch() {
                match shared.get_definitions() {
                    Some(definitions) => {
                        log::debug!(target: "posthog", "using flag definitions published by the leader");
                        self.apply(definitions);
                        return Ok(());
                    }
                    None if self.store.get_definitions().is_some() => return Ok(()),
                    None => {
                        log::debug!(target: "posthog", "no shared flag definitions yet, fetching directly");
                    }
                }
            }
        }

        match self.fetcher.fetch_definitions() {
            Ok(FetchOutcome::Updated(definitions)) => {
                if let Some(shared) = &self.shared {
                    shared.publish(&definitions);
                }
                self.apply(definitions);
                Ok(())
            }
            Ok(FetchOutcome::NotModified) => {
                // Keep the published copy alive for followers.
                if let (Some(shared), Some(current)) = (&self.shared, self.store.get_definitions())
                {
                    shared.publish(current.response());
                }
                Ok(())
            }
            Err(Error::QuotaLimited) => {
                self.store.clear();
                self.cache.clear();
                Err(Error::QuotaLimited)
            }
            Err(err) => Err(err),
        }
    }

    fn apply(&self, definitions: FlagDefinitionsResponse) {
        if let Some(previous) = self.store.set_definitions(definitions) {
            log::debug!(target: "posthog",
                        version = self.store.current_version();
                        "flag definitions changed");
            self.cache.invalidate_version(previous);
        }
    }

    fn shutdown(&self) {
        if let Some(shared) = &self.shared {
            shared.shutdown();
        }
    }
}

/// A flag definitions poller thread.
///
/// The poller thread polls the server periodically to fetch the latest definitions and stores
/// them in [`DefinitionStore`].
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,

    result: PollResult,
}

/// Outcome of the poller thread, shared with waiters.
///
/// Holds `None` if no poll has completed yet. Holds `Some(Ok(()))` once definitions have been
/// loaded. Holds `Some(Err(...))` if the first poll failed or the poller hit a terminal error.
#[derive(Clone)]
pub(crate) struct PollResult(Arc<(Mutex<Option<Result<()>>>, Condvar)>);

impl PollResult {
    fn new() -> PollResult {
        PollResult(Arc::new((Mutex::new(None), Condvar::new())))
    }

    fn update(&self, value: Result<()>, terminal: bool) {
        let (slot, condvar) = &*self.0;
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        // A transient failure doesn't hide an earlier success.
        if terminal || value.is_ok() || slot.is_none() {
            *slot = Some(value);
        }
        condvar.notify_all();
    }

    /// Block until the first result is available.
    pub(crate) fn wait(&self) -> Result<()> {
        let (slot, condvar) = &*self.0;
        let mut lock = slot.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = condvar.wait(lock).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

impl PollerThread {
    /// Starts the poller thread.
    ///
    /// Fails only if the OS refuses to spawn the thread.
    pub(crate) fn start(
        mut poller: DefinitionPoller,
        config: PollerThreadConfig,
    ) -> std::io::Result<PollerThread> {
        // `SyncSender` is `Sync`, so `stop()` works through `&self`. One slot is enough: a full
        // buffer means a stop is already pending.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let result = PollResult::new();

        let join_handle = {
            let result = result.clone();
            let update_result =
                move |value: Result<()>, terminal: bool| result.update(value, terminal);

            std::thread::Builder::new()
                .name("posthog-poller".to_owned())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        loop {
                            log::debug!(target: "posthog", "polling flag definitions");
                            match poller.poll() {
                                Ok(()) => update_result(Ok(()), false),
                                Err(err @ (Error::Unauthorized | Error::InvalidBaseUrl(_))) => {
                                    log::error!(target: "posthog", "stopping flag definitions poller: {err}");
                                    update_result(Err(err), true);
                                    poller.shutdown();
                                    return;
                                }
                                Err(err) => {
                                    log::warn!(target: "posthog", "failed to poll flag definitions: {err}");
                                    update_result(Err(err), false);
                                }
                            };

                            let timeout = jitter(config.interval, config.jitter);
                            match stop_receiver.recv_timeout(timeout) {
                                Err(RecvTimeoutError::Timeout) => {
                                    // Timed out. Loop back to fetch new definitions.
                                }
                                Ok(()) => {
                                    log::debug!(target: "posthog", "poller thread received stop command");
                                    poller.shutdown();
                                    return;
                                }
                                Err(RecvTimeoutError::Disconnected) => {
                                    // The `PollerThread` was dropped.
                                    log::debug!(target: "posthog", "poller thread received disconnected");
                                    poller.shutdown();
                                    return;
                                }
                            }
                        }
                    }));

                    if result.is_err() {
                        update_result(Err(Error::PollerThreadPanicked), true);
                    }
                })?
        };

        Ok(PollerThread {
            join_handle,
            stop_sender,
            result,
        })
    }

    /// Waits for the first poll to complete.
    ///
    /// # Errors
    ///
    /// Returns the error of the first poll if it failed, or a terminal error:
    ///
    /// - [`Error::PollerThreadPanicked`]
    /// - [`Error::Unauthorized`]
    /// - [`Error::InvalidBaseUrl`]
    pub fn wait_for_definitions(&self) -> Result<()> {
        self.result.wait()
    }

    /// Handle to wait on without borrowing the thread.
    pub(crate) fn result_handle(&self) -> PollResult {
        self.result.clone()
    }

    /// Ask the thread to stop without waiting for it.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited) or the channel buffer is
        // full. Either way the thread is stopping or already stopped.
        let _ = self.stop_sender.try_send(());
    }

    /// Return `true` once the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Stop the thread and join it. See [`PollerThread::stop`] for the non-blocking variant.
    ///
    /// # Errors
    ///
    /// - [`Error::PollerThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        self.stop();

        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;

        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}


#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::cache::{CacheBackend, MemoryBackend};
    use crate::flags::{DecisionSource, EvaluationReason, FlagDecision};

    const PATH: &str = "/api/feature_flag/local_evaluation/";
    const MINUTE: Duration = Duration::from_secs(60);

    fn body(rollout: u32) -> serde_json::Value {
        json!({
            "flags": [{
                "key": "beta",
                "active": true,
                "filters": {"groups": [{"properties": [], "rollout_percentage": rollout}]}
            }]
        })
    }

    fn decision() -> FlagDecision {
        FlagDecision {
            key: "beta".to_owned(),
            value: true.into(),
            payload: None,
            reason: EvaluationReason::ConditionMatch { condition_index: 0 },
            source: DecisionSource::Local,
        }
    }

    struct Fixture {
        store: Arc<DefinitionStore>,
        cache: Arc<FlagResultCache>,
        backend: Arc<dyn CacheBackend>,
    }

    impl Fixture {
        fn new() -> Fixture {
            let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new(100));
            Fixture {
                store: Arc::new(DefinitionStore::new()),
                cache: Arc::new(FlagResultCache::new(backend.clone(), "test", MINUTE, MINUTE)),
                backend,
            }
        }

        fn poller(&self, server: &MockServer, shared: bool) -> DefinitionPoller {
            let fetcher =
                DefinitionsFetcher::new(&server.base_url(), "phc_test", "phx_test", MINUTE)
                    .unwrap();
            DefinitionPoller::new(
                fetcher,
                self.store.clone(),
                self.cache.clone(),
                shared.then(|| SharedDefinitions::new(self.backend.clone(), "test", MINUTE)),
            )
        }
    }

    #[test]
    fn version_bump_invalidates_cache() {
        let server = MockServer::start();
        let mut mock = server.mock(|when, then| {
            when.method(GET).path(PATH);
            then.status(200).json_body(body(50));
        });

        let fixture = Fixture::new();
        let mut poller = fixture.poller(&server, false);

        poller.poll().unwrap();
        assert_eq!(fixture.store.current_version(), 1);
        fixture.cache.set("user", "beta", &decision(), 1);

        // Same definitions: nothing changes.
        poller.poll().unwrap();
        assert!(fixture.cache.get("user", "beta", 1).is_some());

        mock.delete();
        server.mock(|when, then| {
            when.method(GET).path(PATH);
            then.status(200).json_body(body(60));
        });
        poller.poll().unwrap();
        assert_eq!(fixture.store.current_version(), 2);
        assert!(fixture.cache.get_stale("user", "beta", 1).is_none());
    }

    #[test]
    fn quota_limit_clears_definitions_and_cache() {
        let server = MockServer::start();
        let mut mock = server.mock(|when, then| {
            when.method(GET).path(PATH);
            then.status(200).json_body(body(50));
        });

        let fixture = Fixture::new();
        let mut poller = fixture.poller(&server, false);
        poller.poll().unwrap();
        fixture.cache.set("user", "beta", &decision(), 0);

        mock.delete();
        server.mock(|when, then| {
            when.method(GET).path(PATH);
            then.status(402);
        });

        assert!(matches!(poller.poll(), Err(Error::QuotaLimited)));
        assert!(fixture.store.get_definitions().is_none());
        assert!(fixture.cache.get_stale("user", "beta", 0).is_none());
    }

    #[test]
    fn follower_uses_published_definitions() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path(PATH);
            then.status(200).json_body(body(50));
        });

        let leader_fixture = Fixture::new();
        let mut leader = leader_fixture.poller(&server, true);
        leader.poll().unwrap();
        mock.assert_hits(1);

        // A second instance sharing the same backend, with its own store.
        let follower_store = Arc::new(DefinitionStore::new());
        let mut follower = DefinitionPoller::new(
            DefinitionsFetcher::new(&server.base_url(), "phc_test", "phx_test", MINUTE).unwrap(),
            follower_store.clone(),
            leader_fixture.cache.clone(),
            Some(SharedDefinitions::new(
                leader_fixture.backend.clone(),
                "test",
                MINUTE,
            )),
        );
        follower.poll().unwrap();

        mock.assert_hits(1);
        assert!(follower_store.get_definitions().unwrap().get("beta").is_some());
    }

    #[test]
    fn follower_fetches_when_nothing_is_published() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path(PATH);
            then.status(200).json_body(body(50));
        });

        let fixture = Fixture::new();
        let other = SharedDefinitions::new(fixture.backend.clone(), "test", MINUTE);
        assert!(other.should_fetch());

        let mut follower = fixture.poller(&server, true);
        follower.poll().unwrap();

        mock.assert_hits(1);
        assert!(fixture.store.get_definitions().is_some());
    }

    #[test]
    fn thread_loads_definitions_and_shuts_down() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path(PATH);
            then.status(200).json_body(body(50));
        });

        let fixture = Fixture::new();
        let poller = PollerThread::start(
            fixture.poller(&server, false),
            PollerThreadConfig::new().with_interval(MINUTE),
        )
        .unwrap();

        poller.wait_for_definitions().unwrap();
        assert!(fixture.store.get_definitions().is_some());
        poller.shutdown().unwrap();
    }

    #[test]
    fn transient_error_keeps_earlier_success() {
        let result = PollResult::new();
        let waiter = {
            let result = result.clone();
            std::thread::spawn(move || result.wait())
        };

        result.update(Ok(()), false);
        result.update(Err(Error::QuotaLimited), false);
        assert!(waiter.join().unwrap().is_ok());
        assert!(result.wait().is_ok());

        result.update(Err(Error::Unauthorized), true);
        assert!(matches!(result.wait(), Err(Error::Unauthorized)));
    }

    #[test]
    fn thread_surfaces_unauthorized() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path(PATH);
            then.status(401);
        });

        let fixture = Fixture::new();
        let poller = PollerThread::start(
            fixture.poller(&server, false),
            PollerThreadConfig::new().with_interval(Duration::from_millis(10)),
        )
        .unwrap();

        assert!(matches!(
            poller.wait_for_definitions(),
            Err(Error::Unauthorized)
        ));
        poller.shutdown().unwrap();
    }
}
