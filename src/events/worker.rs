use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{BatchSender, DeliveryQueue, Envelope, ErrorCallback, Popped};
use crate::{Error, Result};

/// A single event larger than this is dropped.
pub(crate) const MAX_EVENT_SIZE: usize = 900 * 1024;

/// A batch stops growing once its events add up to this many bytes.
pub(crate) const MAX_BATCH_SIZE: usize = 5 * 1024 * 1024;

/// How failed deliveries are retried.
#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub(crate) const MAX_BACKOFF: Duration = Duration::from_secs(10);

    fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(1 << attempt.min(16))
            .min(self.max_backoff)
    }
}

/// Send `batch`, retrying retryable failures with exponential backoff.
pub(crate) fn deliver(sender: &dyn BatchSender, batch: &[Envelope], retry: &RetryPolicy) -> Result<()> {
    let mut attempt = 0;
    loop {
        match sender.send(batch) {
            Ok(()) => return Ok(()),
            Err(err) if err.is_retryable() && attempt < retry.max_retries => {
                let delay = retry.backoff(attempt);
                log::warn!(target: "posthog",
                           attempt, batch_size = batch.len();
                           "failed to deliver batch, retrying in {delay:?}: {err}");
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Deliver `batch` and report a final failure. Never fails.
pub(crate) fn deliver_or_report(
    sender: &dyn BatchSender,
    batch: &[Envelope],
    retry: &RetryPolicy,
    on_error: Option<&ErrorCallback>,
) {
    if let Err(err) = deliver(sender, batch, retry) {
        log::error!(target: "posthog", batch_size = batch.len(); "dropping batch: {err}");
        if let Some(on_error) = on_error {
            on_error(&err, batch);
        }
    }
}

/// Configuration for [`BatchingWorker`].
#[derive(Debug, Clone)]
pub(crate) struct WorkerConfig {
    pub flush_at: usize,
    pub flush_interval: Duration,
    pub retry: RetryPolicy,
    pub threads: usize,
}

struct Worker {
    queue: Arc<DeliveryQueue>,
    sender: Arc<dyn BatchSender>,
    config: WorkerConfig,
    on_error: Option<ErrorCallback>,
}

impl Worker {
    /// Collect the next batch. Returns `None` once the queue is closed and drained.
    fn next_batch(&self) -> Option<Vec<Envelope>> {
        let deadline = Instant::now() + self.config.flush_interval;
        let mut batch = Vec::new();
        let mut total_size = 0;

        while batch.len() < self.config.flush_at {
            match self.queue.pop_until(deadline) {
                Popped::Item(envelope) => {
                    let size = envelope.serialized_size();
                    if size > MAX_EVENT_SIZE {
                        log::error!(target: "posthog",
                                    event = envelope.event(), size;
                                    "event exceeds 900KiB limit, dropping");
                        self.queue.task_done(1);
                        continue;
                    }
                    batch.push(envelope);
                    total_size += size;
                    if total_size >= MAX_BATCH_SIZE {
                        log::debug!(target: "posthog", total_size; "hit batch size limit");
                        break;
                    }
                }
                Popped::TimedOut => break,
                Popped::Closed if batch.is_empty() => return None,
                Popped::Closed => break,
            }
        }

        Some(batch)
    }

    fn run(&self) {
        log::debug!(target: "posthog", "delivery worker started");
        while let Some(batch) = self.next_batch() {
            if batch.is_empty() {
                continue;
            }
            deliver_or_report(
                self.sender.as_ref(),
                &batch,
                &self.config.retry,
                self.on_error.as_ref(),
            );
            self.queue.task_done(batch.len());
        }
        log::debug!(target: "posthog", "delivery worker exited");
    }
}

/// Background threads draining a [`DeliveryQueue`] into batches.
pub(crate) struct BatchingWorker {
    queue: Arc<DeliveryQueue>,
    handles: Vec<JoinHandle<()>>,
}

impl BatchingWorker {
    /// Start `config.threads` worker threads (at least one).
    pub(crate) fn start(
        queue: Arc<DeliveryQueue>,
        sender: Arc<dyn BatchSender>,
        config: WorkerConfig,
        on_error: Option<ErrorCallback>,
    ) -> std::io::Result<BatchingWorker> {
        let worker = Arc::new(Worker {
            queue: queue.clone(),
            sender,
            config,
            on_error,
        });

        let handles = (0..worker.config.threads.max(1))
            .map(|i| {
                let worker = worker.clone();
                std::thread::Builder::new()
                    .name(format!("posthog-delivery-{i}"))
                    .spawn(move || worker.run())
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(BatchingWorker { queue, handles })
    }

    /// Close the queue, let the workers deliver what it holds, and wait for them until `timeout`.
    ///
    /// Workers still running at the deadline are left to finish on their own.
    ///
    /// # Errors
    ///
    /// - [`Error::WorkerThreadPanicked`] if a worker has panicked.
    pub(crate) fn shutdown(self, timeout: Duration) -> Result<()> {
        self.queue.close();
        let deadline = Instant::now() + timeout;

        let mut result = Ok(());
        for handle in self.handles {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            if !handle.is_finished() {
                log::warn!(target: "posthog", "delivery worker did not finish before shutdown deadline");
                continue;
            }
            if handle.join().is_err() {
                result = Err(Error::WorkerThreadPanicked);
            }
        }
        result
    }
}
