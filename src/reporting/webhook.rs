//! HTTP error reporter.
//!
//! Reports are queued on an unbounded channel and posted as JSON by a
//! background task, so [`ErrorReporter::report`] never waits on the network.
//!
//! # Retry Strategy
//!
//! - Network errors, timeouts and 5xx responses: retry with exponential backoff
//! - 4xx responses: no retry
//! - Default: 3 retries, 500ms base delay (500ms, 1s, 2s)
//!
//! Delivery failures are logged and the report is dropped.

use super::{ErrorReport, ErrorReporter};
use crate::config::redact_url;
use crate::{Error, Resource, Result};
use reqwest::{Client, Url};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Retry settings for report delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub base_delay: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay before retry number `retry` (zero-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Reporter posting JSON reports to an `http(s)` endpoint.
#[derive(Debug)]
pub struct WebhookReporter {
    sender: mpsc::UnboundedSender<ErrorReport>,
    destination: String,
}

impl WebhookReporter {
    /// Creates a reporter for `destination` with the default retry policy.
    ///
    /// Must be called from within a tokio runtime; the delivery task is
    /// spawned on it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for the reporting resource if the
    /// destination is not an `http(s)` URL, no runtime is available, or the
    /// HTTP client cannot be built.
    pub fn new(destination: &str) -> Result<Self> {
        Self::with_retry(destination, RetryPolicy::default())
    }

    /// Creates a reporter with a custom retry policy.
    ///
    /// # Errors
    ///
    /// See [`WebhookReporter::new`].
    pub fn with_retry(destination: &str, retry: RetryPolicy) -> Result<Self> {
        let url = Url::parse(destination).map_err(|e| Error::configuration(Resource::Reporting, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::configuration(
                Resource::Reporting,
                format!("unsupported scheme '{}', expected http or https", url.scheme()),
            ));
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::configuration(Resource::Reporting, e))?;

        let client = Client::builder()
            .user_agent(format!("ctxscope/{}", env!("CARGO_PKG_VERSION")))
            .timeout(retry.timeout)
            .build()
            .map_err(|e| Error::configuration(Resource::Reporting, e))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let delivery = Delivery { client, url, retry };
        runtime.spawn(delivery.run(receiver));

        Ok(Self {
            sender,
            destination: redact_url(destination),
        })
    }

    /// Returns the destination with credentials redacted.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }
}

impl ErrorReporter for WebhookReporter {
    fn report(&self, report: ErrorReport) {
        if self.sender.send(report).is_err() {
            warn!(destination = %self.destination, "error report dropped: delivery task stopped");
        }
    }
}

/// Outcome of one failed delivery attempt.
enum Failure {
    /// Worth retrying (network error, timeout, 5xx).
    Retryable(String),
    /// Rejected by the endpoint (4xx).
    Rejected(u16),
}

struct Delivery {
    client: Client,
    url: Url,
    retry: RetryPolicy,
}

impl Delivery {
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<ErrorReport>) {
        while let Some(report) = receiver.recv().await {
            self.deliver(&report).await;
        }
        debug!("error report delivery task finished");
    }

    async fn deliver(&self, report: &ErrorReport) {
        let mut retry = 0;
        loop {
            match self.attempt(report).await {
                Ok(status) => {
                    debug!(event_id = %report.event_id, status, retries = retry, "error report delivered");
                    return;
                },
                Err(Failure::Rejected(status)) => {
                    warn!(event_id = %report.event_id, status, "error report rejected by destination");
                    return;
                },
                Err(Failure::Retryable(cause)) if retry < self.retry.max_retries => {
                    debug!(event_id = %report.event_id, retry, %cause, "error report delivery failed, retrying");
                    tokio::time::sleep(self.retry.delay_for(retry)).await;
                    retry += 1;
                },
                Err(Failure::Retryable(cause)) => {
                    warn!(event_id = %report.event_id, attempts = retry + 1, %cause, "error report delivery failed");
                    return;
                },
            }
        }
    }

    async fn attempt(&self, report: &ErrorReport) -> std::result::Result<u16, Failure> {
        let response = self
            .client
            .post(self.url.clone())
            .header("X-Ctxscope-Event-Id", report.event_id.to_string())
            .json(report)
            .send()
            .await
            .map_err(|e| Failure::Retryable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else if status.is_client_error() {
            Err(Failure::Rejected(status.as_u16()))
        } else {
            Err(Failure::Retryable(format!("HTTP {status}")))
        }
    }
}
