//! The Rust SDK for PostHog: product analytics event capture and feature flags.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that captures [`Event`]s and evaluates feature flags for
//! subjects described by an [`EvaluationContext`]. Flag evaluation results in a [`FlagDecision`]
//! carrying the resolved [`FlagValue`], its payload, and where the decision came from.
//!
//! With a personal API key, the client polls flag definitions in the background and evaluates
//! flags locally, without a network round-trip. Flags that cannot be decided locally (cohorts
//! that were not served, conditions on properties the caller didn't provide) are evaluated
//! remotely. The last known result for each subject and flag is cached, and a stale result is
//! served if the server can't be reached.
//!
//! Events are queued and delivered in batches by background worker threads. Capture calls never
//! block (unless sync mode is enabled) and never fail because of delivery problems: a full queue
//! is reported with [`EnqueueError`], and batches that can't be delivered are passed to the
//! configured error callback.
//!
//! # Multiple instances
//!
//! Instances of a service can share flag results through a [`CacheBackend`] such as
//! [`RedisBackend`](cache::RedisBackend). With [`ClientConfig::with_shared_definitions`] they also
//! elect a single instance to poll flag definitions and publish them for the others.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Feature flag evaluation never returns an error: when a flag can't be decided, `None` is
//! returned, and the reason is logged. Errors returned from [`Client::new`],
//! [`Client::wait_for_definitions`] and [`Client::shutdown`] usually indicate that developer's
//! attention is needed (e.g., an invalid personal API key).
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages, with the `posthog` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into SDK operations.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

pub mod cache;
mod called_flags;
mod client;
mod config;
mod definition_store;
mod error;
pub mod events;
mod flag_fetcher;
pub mod flags;
mod poller_thread;
mod scope;

pub use cache::{CacheBackend, FlagResultCache};
pub use client::{AllFlags, Client};
pub use config::{CacheBackendConfig, ClientConfig};
pub use definition_store::{DefinitionStore, FlagDefinitions};
pub use error::{EnqueueError, Error, Result};
pub use events::{Envelope, Event};
pub use flag_fetcher::{
    FetchOutcome, RemoteFlag, RemoteFlagsResponse, RemoteMetadata, RemoteReason,
};
pub use flags::{
    DecisionSource, EvaluationContext, EvaluationReason, FlagDecision, FlagValue, Properties,
};
pub use poller_thread::{PollerThread, PollerThreadConfig};
pub use scope::{capture_errors, with_error_capture, Scope, ScopeGuard, ScopeStack};
