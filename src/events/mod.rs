//! Event delivery: envelopes, the bounded delivery queue and the background batching worker.
//!
//! Capture calls turn an [`Event`] into an immutable [`Envelope`] and push it onto the
//! [`DeliveryQueue`]. Worker threads drain the queue into batches and hand them to a
//! [`BatchSender`], retrying transient failures.
use std::sync::Arc;

use crate::Error;

mod envelope;
mod queue;
mod sender;
mod worker;

pub use envelope::{Envelope, Event};
pub use queue::DeliveryQueue;
pub use sender::{BatchSender, HttpBatchSender};

pub(crate) use queue::Popped;
pub(crate) use worker::{deliver_or_report, BatchingWorker, RetryPolicy, WorkerConfig};

/// Called with the final error and the affected envelopes when a batch is dropped.
pub type ErrorCallback = Arc<dyn Fn(&Error, &[Envelope]) + Send + Sync>;
