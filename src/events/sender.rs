use std::io::Write;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use reqwest::{header, Url};
use serde::Serialize;

use super::Envelope;
use crate::flag_fetcher::{endpoint_url, http_client, status_error};
use crate::{Error, Result};

const BATCH_ENDPOINT: &str = "/batch/";

/// Transport for a batch of envelopes.
pub trait BatchSender: Send + Sync {
    /// Deliver `batch` in one request.
    ///
    /// Errors for which [`Error`] reports a retryable condition are retried by the caller.
    fn send(&self, batch: &[Envelope]) -> Result<()>;
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    api_key: &'a str,
    batch: &'a [Envelope],
    sent_at: DateTime<Utc>,
}

/// [`BatchSender`] posting to the `/batch/` endpoint.
pub struct HttpBatchSender {
    client: reqwest::blocking::Client,
    url: Url,
    api_key: String,
    gzip: bool,
}

impl HttpBatchSender {
    pub(crate) fn new(
        host: &str,
        api_key: &str,
        timeout: Duration,
        gzip: bool,
    ) -> Result<HttpBatchSender> {
        Ok(HttpBatchSender {
            client: http_client(timeout)?,
            url: endpoint_url(host, BATCH_ENDPOINT, &[])?,
            api_key: api_key.to_owned(),
            gzip,
        })
    }

    fn body(&self, batch: &[Envelope]) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(&BatchRequest {
            api_key: &self.api_key,
            batch,
            sent_at: Utc::now(),
        })?;
        if !self.gzip {
            return Ok(body);
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body)?;
        Ok(encoder.finish()?)
    }
}

impl BatchSender for HttpBatchSender {
    fn send(&self, batch: &[Envelope]) -> Result<()> {
        let mut request = self
            .client
            .post(self.url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .body(self.body(batch)?);
        if self.gzip {
            request = request.header(header::CONTENT_ENCODING, "gzip");
        }

        let response = request.send()?;
        let status = response.status();
        if status.is_success() {
            log::debug!(target: "posthog", batch_size = batch.len(); "delivered batch");
            return Ok(());
        }

        Err(match status_error(response) {
            // Only an explicit rate limit is worth retrying on this endpoint.
            Error::QuotaLimited if status != reqwest::StatusCode::TOO_MANY_REQUESTS => {
                Error::Api {
                    status: status.as_u16(),
                    message: "quota limited".to_owned(),
                }
            }
            Error::QuotaLimited => Error::Api {
                status: status.as_u16(),
                message: "rate limited".to_owned(),
            },
            err => err,
        })
    }
}
