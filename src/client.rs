use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::{
    cache::{CacheBackend, FlagResultCache, MemoryBackend, SharedDefinitions},
    called_flags::CalledFlags,
    config::CacheBackendConfig,
    definition_store::DefinitionStore,
    events::{
        deliver_or_report, BatchSender, BatchingWorker, DeliveryQueue, Event, HttpBatchSender,
        RetryPolicy, WorkerConfig,
    },
    flag_fetcher::{DefinitionsFetcher, RemoteEvaluator},
    flags::{EvaluationContext, FlagDecision, FlagEvaluator, FlagValue, Properties, Sha1Hasher},
    poller_thread::{DefinitionPoller, PollerThread},
    scope::Scope,
    ClientConfig, EnqueueError, Result,
};

/// All flags for a subject, with their payloads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllFlags {
    /// Flag values by key.
    pub flags: HashMap<String, FlagValue>,
    /// Payloads by flag key, for flags that resolved to a value with a payload.
    pub payloads: HashMap<String, serde_json::Value>,
}

/// A client for PostHog: captures events and evaluates feature flags.
///
/// Flags are evaluated locally when definitions are available (requires a personal API key),
/// and otherwise fall back to cached results and remote evaluation. Events are delivered in the
/// background in batches.
///
/// # Examples
/// ```
/// # use posthog::{Client, ClientConfig, EvaluationContext, Event};
/// let client = Client::new(ClientConfig::new("phc_api_key").with_disabled(true)).unwrap();
/// client.capture(Event::new("signed up", "user-1")).unwrap();
/// let beta = client.is_feature_enabled("beta", &EvaluationContext::new("user-1"));
/// # assert_eq!(beta, None);
/// ```
pub struct Client {
    config: ClientConfig,
    store: Arc<DefinitionStore>,
    cache: Arc<FlagResultCache>,
    remote: RemoteEvaluator,
    queue: Arc<DeliveryQueue>,
    sender: Arc<dyn BatchSender>,
    retry: RetryPolicy,
    called_flags: CalledFlags,
    worker: Mutex<Option<BatchingWorker>>,
    poller: Mutex<Option<PollerThread>>,
}

impl Client {
    /// Create a new `Client`, starting its delivery workers and, if a personal API key is
    /// configured, the flag definitions poller.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`](crate::Error::InvalidConfig) if the configuration is invalid.
    /// - [`Error::InvalidBaseUrl`](crate::Error::InvalidBaseUrl) if the host is not a valid URL.
    /// - [`Error::Io`](crate::Error::Io) if a background thread failed to start.
    pub fn new(config: ClientConfig) -> Result<Client> {
        config.validate()?;

        let backend: Arc<dyn CacheBackend> = match &config.cache_backend {
            CacheBackendConfig::Memory { max_entries } => {
                Arc::new(MemoryBackend::new(*max_entries))
            }
            #[cfg(feature = "redis")]
            CacheBackendConfig::Redis(url) => Arc::new(crate::cache::RedisBackend::open(url)?),
            CacheBackendConfig::Custom(backend) => backend.clone(),
        };
        let cache = Arc::new(FlagResultCache::new(
            backend.clone(),
            &config.cache_namespace,
            config.cache_ttl,
            config.stale_cache_ttl,
        ));
        let store = Arc::new(DefinitionStore::new());

        let remote = RemoteEvaluator::new(&config.host, &config.api_key, config.request_timeout)?;
        let sender: Arc<dyn BatchSender> = Arc::new(HttpBatchSender::new(
            &config.host,
            &config.api_key,
            config.request_timeout,
            config.gzip,
        )?);
        let queue = Arc::new(DeliveryQueue::new(config.max_queue_size));
        let retry = RetryPolicy {
            max_retries: config.max_retries,
            initial_backoff: config.retry_backoff,
            max_backoff: RetryPolicy::MAX_BACKOFF,
        };

        let worker = if config.disabled || config.sync_mode {
            None
        } else {
            Some(BatchingWorker::start(
                queue.clone(),
                sender.clone(),
                WorkerConfig {
                    flush_at: config.flush_at,
                    flush_interval: config.flush_interval,
                    retry: retry.clone(),
                    threads: config.worker_threads,
                },
                config.on_error.clone(),
            )?)
        };

        let poller = match &config.personal_api_key {
            Some(personal_api_key) if !config.disabled => {
                let fetcher = DefinitionsFetcher::new(
                    &config.host,
                    &config.api_key,
                    personal_api_key,
                    config.request_timeout,
                )?;
                let shared = config.shared_definitions.then(|| {
                    SharedDefinitions::new(backend.clone(), &config.cache_namespace, config.lock_ttl)
                });
                let poller = DefinitionPoller::new(fetcher, store.clone(), cache.clone(), shared);
                Some(PollerThread::start(poller, config.poller.clone())?)
            }
            _ => None,
        };

        log::debug!(target: "posthog",
                    local_evaluation = poller.is_some(),
                    sync_mode = config.sync_mode;
                    "client started");

        Ok(Client {
            config,
            store,
            cache,
            remote,
            queue,
            sender,
            retry,
            called_flags: CalledFlags::default(),
            worker: Mutex::new(worker),
            poller: Mutex::new(poller),
        })
    }

    /// Evaluate `flag_key` for `context`.
    ///
    /// Tries, in order: local evaluation, a fresh cached result, remote evaluation (unless
    /// disabled with [`ClientConfig::with_only_evaluate_locally`]) and a stale cached result.
    /// Returns `None` if none of them could decide.
    pub fn evaluate_flag(&self, flag_key: &str, context: &EvaluationContext) -> Option<FlagDecision> {
        if self.config.disabled {
            return None;
        }

        let decision = self.decide(flag_key, context);
        match &decision {
            Some(decision) => {
                log::trace!(target: "posthog",
                            flag_key,
                            distinct_id = context.distinct_id.as_str(),
                            decision:serde;
                            "evaluated a flag");
                self.report_flag_called(context, decision);
            }
            None => {
                log::debug!(target: "posthog",
                            flag_key,
                            distinct_id = context.distinct_id.as_str();
                            "unable to evaluate flag");
            }
        }
        decision
    }

    fn decide(&self, flag_key: &str, context: &EvaluationContext) -> Option<FlagDecision> {
        let subject = context.distinct_id.as_str();
        let definitions = self.store.get_definitions();
        let version = definitions
            .as_ref()
            .map_or_else(|| self.store.current_version(), |d| d.version());

        if let Some(definitions) = &definitions {
            let mut evaluator = FlagEvaluator::new(definitions, &Sha1Hasher, context);
            match evaluator.evaluate(flag_key) {
                Ok(decision) => {
                    self.cache.set(subject, flag_key, &decision, version);
                    return Some(decision);
                }
                Err(err) => {
                    log::debug!(target: "posthog", flag_key; "cannot evaluate flag locally: {err}");
                }
            }
        }

        if let Some(decision) = self.cache.get(subject, flag_key, version) {
            return Some(decision);
        }

        let remote = self
            .remote_decisions(context, Some(&[flag_key.to_owned()]))
            .and_then(|mut decisions| decisions.remove(flag_key));
        if let Some(decision) = remote {
            self.cache.set(subject, flag_key, &decision, version);
            return Some(decision);
        }

        self.cache.get_stale(subject, flag_key, version)
    }

    /// Evaluate flags on the server. `None` if remote evaluation is off or failed.
    fn remote_decisions(
        &self,
        context: &EvaluationContext,
        flag_keys: Option<&[String]>,
    ) -> Option<HashMap<String, FlagDecision>> {
        if self.config.only_evaluate_locally {
            return None;
        }

        match self.remote.evaluate(context, flag_keys) {
            Ok(response) if response.is_quota_limited() => {
                log::warn!(target: "posthog", "feature flags are quota limited, clearing cached results");
                self.cache.clear();
                None
            }
            Ok(response) => Some(
                response
                    .flags
                    .into_iter()
                    .map(|(key, flag)| (key, flag.to_decision()))
                    .collect(),
            ),
            Err(err) => {
                log::warn!(target: "posthog", "remote flag evaluation unavailable: {err}");
                None
            }
        }
    }

    fn report_flag_called(&self, context: &EvaluationContext, decision: &FlagDecision) {
        if !self.config.send_feature_flag_events {
            return;
        }
        if !self.called_flags.first_call(
            &context.distinct_id,
            &decision.key,
            &decision.value.lookup_key(),
        ) {
            return;
        }
        let event = Event::feature_flag_called(&context.distinct_id, decision, &context.groups);
        if let Err(err) = self.enqueue(event) {
            log::debug!(target: "posthog", flag_key = decision.key.as_str(); "feature flag call not reported: {err}");
        }
    }

    /// Value of `flag_key` for `context`, or `None` if it could not be decided.
    pub fn get_feature_flag(&self, flag_key: &str, context: &EvaluationContext) -> Option<FlagValue> {
        self.evaluate_flag(flag_key, context).map(|d| d.value)
    }

    /// Whether `flag_key` is enabled (any variant counts), or `None` if it could not be decided.
    pub fn is_feature_enabled(&self, flag_key: &str, context: &EvaluationContext) -> Option<bool> {
        self.evaluate_flag(flag_key, context)
            .map(|d| d.value.is_enabled())
    }

    /// Payload of the value `flag_key` resolves to for `context`.
    pub fn get_feature_flag_payload(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
    ) -> Option<serde_json::Value> {
        self.evaluate_flag(flag_key, context)
            .and_then(|d| d.payload)
    }

    /// Values of all flags for `context` (restricted to [`EvaluationContext::flag_keys`] if set).
    ///
    /// Flags that can't be decided locally are filled in by a single remote call. Flags that
    /// can't be decided at all are left out.
    pub fn get_all_flags(&self, context: &EvaluationContext) -> HashMap<String, FlagValue> {
        self.get_all_flags_and_payloads(context).flags
    }

    /// Like [`Client::get_all_flags`], with the payloads of the resolved values.
    pub fn get_all_flags_and_payloads(&self, context: &EvaluationContext) -> AllFlags {
        let mut all = AllFlags::default();
        if self.config.disabled {
            return all;
        }
        for (key, decision) in self.all_decisions(context) {
            if let Some(payload) = decision.payload {
                all.payloads.insert(key.clone(), payload);
            }
            all.flags.insert(key, decision.value);
        }
        all
    }

    fn all_decisions(&self, context: &EvaluationContext) -> HashMap<String, FlagDecision> {
        let subject = context.distinct_id.as_str();
        let definitions = self.store.get_definitions();
        let version = definitions
            .as_ref()
            .map_or_else(|| self.store.current_version(), |d| d.version());

        let mut decisions = HashMap::new();
        let mut unresolved = Vec::new();
        match &definitions {
            Some(definitions) => {
                let mut evaluator = FlagEvaluator::new(definitions, &Sha1Hasher, context);
                for (key, result) in evaluator.evaluate_all() {
                    match result {
                        Ok(decision) => {
                            self.cache.set(subject, &key, &decision, version);
                            decisions.insert(key, decision);
                        }
                        Err(err) => {
                            log::debug!(target: "posthog", flag_key = key.as_str(); "cannot evaluate flag locally: {err}");
                            unresolved.push(key);
                        }
                    }
                }
                if unresolved.is_empty() {
                    return decisions;
                }
            }
            None => {
                log::debug!(target: "posthog", "no flag definitions loaded, evaluating all flags remotely");
            }
        }

        if let Some(remote) = self.remote_decisions(context, context.flag_keys.as_deref()) {
            for (key, decision) in remote {
                decisions.entry(key).or_insert_with_key(|key| {
                    self.cache.set(subject, key, &decision, version);
                    decision
                });
            }
        }

        // Flags neither side could decide fall back to the last known result.
        for key in unresolved {
            if decisions.contains_key(&key) {
                continue;
            }
            if let Some(decision) = self.cache.get_stale(subject, &key, version) {
                decisions.insert(key, decision);
            }
        }
        decisions
    }

    /// Queue `event` for delivery. Returns the id assigned to it.
    ///
    /// # Errors
    ///
    /// - [`EnqueueError::QueueFull`] if the delivery queue is at capacity.
    /// - [`EnqueueError::ShutDown`] after [`Client::shutdown`].
    pub fn capture(&self, event: Event) -> std::result::Result<Uuid, EnqueueError> {
        self.enqueue(event)
    }

    /// Like [`Client::capture`], filling in the distinct id and tags of `scope`.
    pub fn capture_with_scope(
        &self,
        event: Event,
        scope: &Scope,
    ) -> std::result::Result<Uuid, EnqueueError> {
        self.enqueue(scope.apply(event))
    }

    /// Set person properties for `distinct_id`.
    pub fn identify(
        &self,
        distinct_id: impl Into<String>,
        properties: Properties,
    ) -> std::result::Result<Uuid, EnqueueError> {
        self.enqueue(Event::identify(distinct_id, properties))
    }

    /// Link `alias` to the person known as `distinct_id`.
    pub fn alias(
        &self,
        distinct_id: impl Into<String>,
        alias: impl Into<String>,
    ) -> std::result::Result<Uuid, EnqueueError> {
        self.enqueue(Event::alias(distinct_id, alias))
    }

    /// Set properties of a group.
    pub fn group_identify(
        &self,
        group_type: impl Into<String>,
        group_key: impl Into<String>,
        properties: Properties,
    ) -> std::result::Result<Uuid, EnqueueError> {
        self.enqueue(Event::group_identify(group_type, group_key, properties))
    }

    /// Capture `error` and its sources as an `$exception` event within `scope`.
    ///
    /// Without a distinct id in `scope`, the exception is attributed to a random id and no person
    /// profile is created.
    pub fn capture_exception(
        &self,
        error: &(dyn std::error::Error + 'static),
        scope: &Scope,
    ) -> std::result::Result<Uuid, EnqueueError> {
        let event = match scope.distinct_id() {
            Some(distinct_id) => Event::exception(distinct_id, error),
            None => Event::exception(&Uuid::new_v4().to_string(), error)
                .with_property("$process_person_profile", false),
        };
        self.enqueue(scope.apply(event))
    }

    fn enqueue(&self, event: Event) -> std::result::Result<Uuid, EnqueueError> {
        let envelope = event.into_envelope();
        let uuid = envelope.uuid();
        if self.config.disabled {
            return Ok(uuid);
        }
        if self.queue.is_closed() {
            return Err(EnqueueError::ShutDown);
        }

        if self.config.sync_mode {
            deliver_or_report(
                self.sender.as_ref(),
                std::slice::from_ref(&envelope),
                &self.retry,
                self.config.on_error.as_ref(),
            );
            return Ok(uuid);
        }

        self.queue.try_push(envelope).map(|()| uuid).map_err(|err| {
            log::warn!(target: "posthog", "dropping event: {err}");
            err
        })
    }

    /// Wait until every accepted event has been delivered or dropped, bounded by the shutdown
    /// timeout. Returns `true` if the queue drained in time.
    pub fn flush(&self) -> bool {
        self.queue.wait_all_done(self.config.shutdown_timeout)
    }

    /// Block until the first flag definitions poll completes. Returns immediately if local
    /// evaluation is not configured.
    ///
    /// # Errors
    ///
    /// Returns the error of the first poll, e.g. [`Error::Unauthorized`](crate::Error::Unauthorized)
    /// for an invalid personal API key.
    pub fn wait_for_definitions(&self) -> Result<()> {
        // Don't hold the lock while waiting, so that `shutdown` can proceed.
        let result = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(PollerThread::result_handle);
        match result {
            Some(result) => result.wait(),
            None => Ok(()),
        }
    }

    /// Stop polling, deliver queued events and stop the background threads, waiting for them at
    /// most the configured shutdown timeout. Releases the leader lock if this instance holds it.
    ///
    /// Events captured after shutdown are rejected with [`EnqueueError::ShutDown`].
    ///
    /// # Errors
    ///
    /// - [`Error::WorkerThreadPanicked`](crate::Error::WorkerThreadPanicked) or
    ///   [`Error::PollerThreadPanicked`](crate::Error::PollerThreadPanicked) if a background
    ///   thread has panicked.
    pub fn shutdown(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.shutdown_timeout;

        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(poller) = &poller {
            poller.stop();
        }

        self.queue.close();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut result = match worker {
            Some(worker) => worker.shutdown(self.config.shutdown_timeout),
            None => Ok(()),
        };

        if let Some(poller) = poller {
            while !poller.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            if poller.is_finished() {
                result = result.and(poller.shutdown());
            } else {
                log::warn!(target: "posthog", "poller thread did not stop before shutdown deadline");
            }
        }

        log::debug!(target: "posthog", "client shut down");
        result
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.queue.is_closed() {
            if let Err(err) = self.shutdown() {
                log::warn!(target: "posthog", "error while shutting down: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::flags::{DecisionSource, FlagDefinitionsResponse};

    fn definitions(value: serde_json::Value) -> FlagDefinitionsResponse {
        serde_json::from_value(value).unwrap()
    }

    fn client(server: &MockServer) -> Client {
        Client::new(
            ClientConfig::new("phc_test")
                .with_host(server.base_url())
                .with_sync_mode(true)
                .with_max_retries(0)
                .with_feature_flag_events(false)
                .with_request_timeout(Duration::from_secs(2)),
        )
        .unwrap()
    }

    fn remote_mock<'a>(server: &'a MockServer, body: serde_json::Value) -> httpmock::Mock<'a> {
        server.mock(|when, then| {
            when.method(POST).path("/flags/");
            then.status(200).json_body(body);
        })
    }

    #[test]
    fn evaluates_locally_without_network() {
        let server = MockServer::start();
        let remote = remote_mock(&server, json!({"flags": {}}));
        let client = client(&server);
        client.store.set_definitions(definitions(json!({
            "flags": [{
                "key": "beta",
                "active": true,
                "filters": {"groups": [{"properties": [], "rollout_percentage": 100}]}
            }]
        })));

        let decision = client
            .evaluate_flag("beta", &EvaluationContext::new("user"))
            .unwrap();
        assert_eq!(decision.value, FlagValue::Boolean(true));
        assert_eq!(decision.source, DecisionSource::Local);
        remote.assert_hits(0);
    }

    #[test]
    fn falls_back_to_remote_and_caches() {
        let server = MockServer::start();
        let remote = remote_mock(
            &server,
            json!({"flags": {"beta": {"key": "beta", "enabled": true, "variant": "test"}}}),
        );
        let client = client(&server);
        let context = EvaluationContext::new("user");

        assert_eq!(
            client.get_feature_flag("beta", &context),
            Some(FlagValue::from("test"))
        );
        remote.assert_hits(1);

        // Served from cache while fresh.
        let cached = client.evaluate_flag("beta", &context).unwrap();
        assert_eq!(cached.source, DecisionSource::Cache);
        remote.assert_hits(1);
    }

    #[test]
    fn quota_limited_response_clears_cache() {
        let server = MockServer::start();
        let mut remote = remote_mock(
            &server,
            json!({"flags": {"beta": {"key": "beta", "enabled": true}}}),
        );
        let client = Client::new(
            ClientConfig::new("phc_test")
                .with_host(server.base_url())
                .with_sync_mode(true)
                .with_feature_flag_events(false)
                .with_cache_ttl(Duration::ZERO, Duration::from_secs(60)),
        )
        .unwrap();
        let context = EvaluationContext::new("user");

        assert_eq!(client.is_feature_enabled("beta", &context), Some(true));
        remote.delete();
        let quota = remote_mock(&server, json!({"flags": {}, "quotaLimited": ["feature_flags"]}));

        // Without clearing, the stale entry would be served.
        assert_eq!(client.is_feature_enabled("beta", &context), None);
        quota.assert_hits(1);
        assert!(client.cache.get_stale("user", "beta", 0).is_none());
    }

    #[test]
    fn serves_stale_results_when_remote_fails() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/flags/");
            then.status(500);
        });
        let client = Client::new(
            ClientConfig::new("phc_test")
                .with_host(server.base_url())
                .with_sync_mode(true)
                .with_feature_flag_events(false)
                .with_cache_ttl(Duration::ZERO, Duration::from_secs(60)),
        )
        .unwrap();

        let context = EvaluationContext::new("user");
        assert_eq!(client.evaluate_flag("beta", &context), None);

        let decision = FlagDecision {
            key: "beta".to_owned(),
            value: true.into(),
            payload: None,
            reason: crate::flags::EvaluationReason::Remote { description: None },
            source: DecisionSource::Remote,
        };
        client.cache.set("user", "beta", &decision, 0);

        let stale = client.evaluate_flag("beta", &context).unwrap();
        assert_eq!(stale.source, DecisionSource::Cache);
        assert_eq!(stale.value, FlagValue::Boolean(true));
    }

    #[test]
    fn only_evaluate_locally_skips_remote() {
        let server = MockServer::start();
        let remote = remote_mock(&server, json!({"flags": {}}));
        let client = Client::new(
            ClientConfig::new("phc_test")
                .with_host(server.base_url())
                .with_sync_mode(true)
                .with_only_evaluate_locally(true),
        )
        .unwrap();

        assert_eq!(client.evaluate_flag("beta", &EvaluationContext::new("user")), None);
        remote.assert_hits(0);
    }

    #[test]
    fn get_all_flags_fills_inconclusive_flags_remotely() {
        let server = MockServer::start();
        let remote = remote_mock(
            &server,
            json!({"flags": {
                "local": {"key": "local", "enabled": false},
                "needs-server": {"key": "needs-server", "enabled": true, "metadata": {"payload": "{\"a\": 1}"}}
            }}),
        );
        let client = client(&server);
        client.store.set_definitions(definitions(json!({
            "flags": [
                {"key": "local", "active": true, "filters": {"groups": [{"properties": [], "rollout_percentage": 100}]}},
                {"key": "needs-server", "active": true, "ensure_experience_continuity": true, "filters": {}}
            ]
        })));

        let all = client.get_all_flags_and_payloads(&EvaluationContext::new("user"));

        remote.assert_hits(1);
        // Local results win over the server's.
        assert_eq!(all.flags["local"], FlagValue::Boolean(true));
        assert_eq!(all.flags["needs-server"], FlagValue::Boolean(true));
        assert_eq!(all.payloads["needs-server"], json!({"a": 1}));
    }

    #[test]
    fn flags_missing_from_remote_response_use_stale_results() {
        let server = MockServer::start();
        let remote = remote_mock(&server, json!({"flags": {}}));
        let client = client(&server);
        client.store.set_definitions(definitions(json!({
            "flags": [{"key": "pro", "active": true, "filters": {"groups": [{
                "properties": [{"key": "plan", "value": "pro", "type": "person"}],
                "rollout_percentage": 100
            }]}}]
        })));
        let earlier = client
            .evaluate_flag(
                "pro",
                &EvaluationContext::new("user").with_person_property("plan", "pro"),
            )
            .unwrap();

        let all = client.get_all_flags(&EvaluationContext::new("user"));

        remote.assert_hits(1);
        assert_eq!(all.get("pro"), Some(&earlier.value));
    }

    #[test]
    fn waiting_for_definitions_does_not_block_shutdown() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/feature_flag/local_evaluation/");
            then.status(200)
                .delay(Duration::from_millis(500))
                .json_body(json!({"flags": []}));
        });
        let client = Client::new(
            ClientConfig::new("phc_test")
                .with_host(server.base_url())
                .with_personal_api_key("phx_test")
                .with_sync_mode(true),
        )
        .unwrap();

        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| client.wait_for_definitions());
            std::thread::sleep(Duration::from_millis(100));

            // The waiter is blocked on the first poll, not on the poller slot.
            assert!(client.poller.try_lock().is_ok());
            assert!(waiter.join().unwrap().is_ok());
        });
        client.shutdown().unwrap();
    }

    #[test]
    fn reports_flag_calls_once() {
        let server = MockServer::start();
        let batch = server.mock(|when, then| {
            when.method(POST)
                .path("/batch/")
                .body_contains("$feature_flag_called");
            then.status(200);
        });
        let client = Client::new(
            ClientConfig::new("phc_test")
                .with_host(server.base_url())
                .with_sync_mode(true),
        )
        .unwrap();
        client.store.set_definitions(definitions(json!({
            "flags": [{"key": "beta", "active": true, "filters": {"groups": [{"properties": []}]}}]
        })));

        let context = EvaluationContext::new("user");
        for _ in 0..3 {
            assert_eq!(client.is_feature_enabled("beta", &context), Some(true));
        }
        batch.assert_hits(1);
    }

    #[test]
    fn rejects_events_after_shutdown() {
        let server = MockServer::start();
        let client = client(&server);
        client.shutdown().unwrap();

        assert_eq!(
            client.capture(Event::new("late", "user")),
            Err(EnqueueError::ShutDown)
        );
    }

    #[test]
    fn disabled_client_does_nothing() {
        let server = MockServer::start();
        let any = server.mock(|when, then| {
            when.path_contains("/");
            then.status(200);
        });
        let client = Client::new(
            ClientConfig::new("phc_test")
                .with_host(server.base_url())
                .with_personal_api_key("phx_test")
                .with_disabled(true),
        )
        .unwrap();

        assert!(client.capture(Event::new("e", "user")).is_ok());
        assert_eq!(client.evaluate_flag("beta", &EvaluationContext::new("user")), None);
        assert!(client.get_all_flags(&EvaluationContext::new("user")).is_empty());
        client.shutdown().unwrap();
        any.assert_hits(0);
    }
}
