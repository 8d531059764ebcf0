//! HTTP clients for the flag endpoints: definition polling for local evaluation and remote
//! evaluation as a fallback.
use std::collections::HashMap;
use std::time::Duration;

use reqwest::{header, StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::flags::{
    DecisionSource, EvaluationContext, EvaluationReason, FlagDecision, FlagDefinitionsResponse,
    FlagValue, Properties,
};
use crate::{Error, Result};

pub(crate) const USER_AGENT: &str = concat!("posthog-rust/", env!("CARGO_PKG_VERSION"));

const LOCAL_EVALUATION_ENDPOINT: &str = "/api/feature_flag/local_evaluation/";
const FLAGS_ENDPOINT: &str = "/flags/";

/// Build the blocking HTTP client shared by every endpoint.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()?)
}

pub(crate) fn endpoint_url(host: &str, path: &str, params: &[(&str, &str)]) -> Result<Url> {
    Url::parse_with_params(&format!("{}{}", host.trim_end_matches('/'), path), params)
        .map_err(Error::InvalidBaseUrl)
}

/// Map a non-success response to an [`Error`].
pub(crate) fn status_error(response: reqwest::blocking::Response) -> Error {
    let status = response.status();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Unauthorized,
        StatusCode::PAYMENT_REQUIRED | StatusCode::TOO_MANY_REQUESTS => Error::QuotaLimited,
        _ => {
            #[derive(Deserialize)]
            struct Detail {
                detail: String,
            }

            let body = response.text().unwrap_or_default();
            let message = match serde_json::from_str::<Detail>(&body) {
                Ok(Detail { detail }) => detail,
                Err(_) => body,
            };
            Error::Api {
                status: status.as_u16(),
                message,
            }
        }
    }
}

/// Result of a definitions poll.
#[derive(Debug)]
pub enum FetchOutcome {
    /// New definitions were served.
    Updated(FlagDefinitionsResponse),
    /// The server confirmed our definitions are current (`304 Not Modified`).
    NotModified,
}

/// A client that fetches flag definitions for local evaluation.
pub struct DefinitionsFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    url: Url,
    personal_api_key: String,
    etag: Option<String>,
    /// If we receive a 401/403 during a request, it means the key is not valid. We cache this
    /// error so we don't issue additional requests to the server.
    unauthorized: bool,
}

impl DefinitionsFetcher {
    pub(crate) fn new(
        host: &str,
        api_key: &str,
        personal_api_key: &str,
        timeout: Duration,
    ) -> Result<DefinitionsFetcher> {
        Ok(DefinitionsFetcher {
            client: http_client(timeout)?,
            url: endpoint_url(
                host,
                LOCAL_EVALUATION_ENDPOINT,
                &[("token", api_key), ("send_cohorts", "true")],
            )?,
            personal_api_key: personal_api_key.to_owned(),
            etag: None,
            unauthorized: false,
        })
    }

    /// Fetch the current definitions, sending the last `ETag` seen.
    pub fn fetch_definitions(&mut self) -> Result<FetchOutcome> {
        if self.unauthorized {
            return Err(Error::Unauthorized);
        }

        log::debug!(target: "posthog", "fetching flag definitions");
        let mut request = self
            .client
            .get(self.url.clone())
            .bearer_auth(&self.personal_api_key);
        if let Some(etag) = &self.etag {
            request = request.header(header::IF_NONE_MATCH, etag);
        }
        let response = request.send()?;

        if response.status() == StatusCode::NOT_MODIFIED {
            log::debug!(target: "posthog", "flag definitions not modified");
            return Ok(FetchOutcome::NotModified);
        }

        if !response.status().is_success() {
            let err = status_error(response);
            match err {
                Error::Unauthorized => {
                    log::error!(target: "posthog", "not authorized to fetch flag definitions. Check your personal API key");
                    self.unauthorized = true;
                }
                Error::QuotaLimited => {
                    log::warn!(target: "posthog", "project is quota limited, local flag evaluation unavailable");
                }
                ref err => {
                    log::warn!(target: "posthog", "received non-200 response while fetching flag definitions: {err}");
                }
            }
            return Err(err);
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let definitions: FlagDefinitionsResponse = response.json()?;
        self.etag = etag;

        log::debug!(target: "posthog",
                    flags = definitions.flags.len();
                    "successfully fetched flag definitions");
        Ok(FetchOutcome::Updated(definitions))
    }
}

/// A client for the remote evaluation endpoint.
pub struct RemoteEvaluator {
    client: reqwest::blocking::Client,
    url: Url,
    api_key: String,
}

#[derive(Serialize)]
struct RemoteFlagsRequest<'a> {
    api_key: &'a str,
    distinct_id: &'a str,
    groups: &'a HashMap<String, String>,
    person_properties: &'a Properties,
    group_properties: &'a HashMap<String, Properties>,
    #[serde(skip_serializing_if = "Option::is_none")]
    flag_keys_to_evaluate: Option<&'a [String]>,
}

/// Response of the remote evaluation endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteFlagsResponse {
    /// Evaluated flags by key.
    #[serde(default)]
    pub flags: HashMap<String, RemoteFlag>,
    /// Set if some flags failed to compute on the server. Missing flags should then be retried
    /// later, not treated as disabled.
    #[serde(default, rename = "errorsWhileComputingFlags")]
    pub errors_while_computing_flags: bool,
    /// Resources the project is over quota for.
    #[serde(default, rename = "quotaLimited")]
    pub quota_limited: Vec<String>,
    #[allow(missing_docs)]
    #[serde(default, rename = "requestId")]
    pub request_id: Option<String>,
}

impl RemoteFlagsResponse {
    /// Return `true` if feature flags are quota limited for this project.
    pub fn is_quota_limited(&self) -> bool {
        self.quota_limited.iter().any(|r| r == "feature_flags")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[allow(missing_docs)]
pub struct RemoteFlag {
    pub key: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub reason: Option<RemoteReason>,
    #[serde(default)]
    pub metadata: Option<RemoteMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(missing_docs)]
pub struct RemoteReason {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub condition_index: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(missing_docs)]
pub struct RemoteMetadata {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

impl RemoteFlag {
    /// Resolved value of the flag.
    pub fn value(&self) -> FlagValue {
        match &self.variant {
            Some(variant) if self.enabled => FlagValue::Variant(variant.clone()),
            _ => FlagValue::Boolean(self.enabled),
        }
    }

    /// Convert to a [`FlagDecision`] sourced from the server.
    pub fn to_decision(&self) -> FlagDecision {
        let value = self.value();
        let payload = if value.is_enabled() {
            self.metadata
                .as_ref()
                .and_then(|m| m.payload.as_ref())
                .map(crate::flags::decode_payload)
        } else {
            None
        };

        FlagDecision {
            key: self.key.clone(),
            value,
            payload,
            reason: EvaluationReason::Remote {
                description: self.reason.as_ref().and_then(|r| r.description.clone()),
            },
            source: DecisionSource::Remote,
        }
    }
}

impl RemoteEvaluator {
    pub(crate) fn new(host: &str, api_key: &str, timeout: Duration) -> Result<RemoteEvaluator> {
        Ok(RemoteEvaluator {
            client: http_client(timeout)?,
            url: endpoint_url(host, FLAGS_ENDPOINT, &[("v", "2")])?,
            api_key: api_key.to_owned(),
        })
    }

    /// Ask the server to evaluate flags for `context`. `flag_keys` restricts the response to the
    /// given flags.
    pub fn evaluate(
        &self,
        context: &EvaluationContext,
        flag_keys: Option<&[String]>,
    ) -> Result<RemoteFlagsResponse> {
        let body = RemoteFlagsRequest {
            api_key: &self.api_key,
            distinct_id: &context.distinct_id,
            groups: &context.groups,
            person_properties: &context.person_properties,
            group_properties: &context.group_properties,
            flag_keys_to_evaluate: flag_keys,
        };

        log::debug!(target: "posthog",
                    distinct_id = context.distinct_id.as_str();
                    "evaluating flags remotely");
        let response = self.client.post(self.url.clone()).json(&body).send()?;
        if !response.status().is_success() {
            let err = status_error(response);
            log::warn!(target: "posthog", "remote flag evaluation failed: {err}");
            return Err(err);
        }

        let response: RemoteFlagsResponse = response.json()?;
        if response.errors_while_computing_flags {
            log::debug!(target: "posthog",
                        request_id:? = response.request_id;
                        "server reported errors while computing flags");
        }
        Ok(response)
    }
}
