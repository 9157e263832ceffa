use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;

use crate::error::PseudokitError;

/// Per-request deadline applied when the caller configures none.
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A thin wrapper on an HTTP client. Applies a per-request deadline and
/// User-Agent, and retries transient transport failures (timeouts,
/// connection errors) with exponential backoff.
///
/// HTTP statuses are returned untouched: interpreting them is the protocol
/// layer's job, and status-level failures are never retried here.
#[derive(Debug, Clone)]
pub(crate) struct HttpClient {
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
}

impl HttpClient {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
            max_retries: 3,
        }
    }

    /// Creates a request builder with defaults applied.
    pub(crate) fn req(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url).timeout(self.timeout).header(
            "User-Agent",
            format!("pseudokit-core/{}", env!("CARGO_PKG_VERSION")),
        )
    }

    /// Sends a request built by [`HttpClient::req`], retrying timeouts and
    /// connection failures until the retry budget is exhausted.
    pub(crate) async fn handle(
        &self,
        request_builder: RequestBuilder,
    ) -> Result<ApiResponse, PseudokitError> {
        if request_builder.try_clone().is_none() {
            return execute(request_builder).await.map_err(Into::into);
        }

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(self.max_retries as usize);

        let template = request_builder;
        (|| async {
            let request_builder = template.try_clone().ok_or_else(|| {
                TransportError::permanent(
                    "<unknown>".to_string(),
                    "request cannot be retried because it is not cloneable".to_string(),
                )
            })?;
            execute(request_builder).await
        })
        .retry(backoff)
        .when(TransportError::is_retryable)
        .await
        .map_err(Into::into)
    }
}

/// The raw outcome of an exchange with the service: final URL, status code
/// and body text. Status interpretation is left to the caller.
#[derive(Debug)]
pub(crate) struct ApiResponse {
    url: String,
    status: u16,
    body: String,
}

impl ApiResponse {
    pub(crate) const fn status(&self) -> u16 {
        self.status
    }

    pub(crate) const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    /// Parses the body as JSON. An unparseable body means the service
    /// answered outside its schema, which is a network-level failure.
    pub(crate) fn json<T: DeserializeOwned>(&self) -> Result<T, PseudokitError> {
        serde_json::from_str(&self.body).map_err(|err| PseudokitError::NetworkError {
            url: self.url.clone(),
            status: Some(self.status),
            error: format!("unparseable response body: {err}"),
        })
    }

    /// Converts an unexpected response into a network error carrying the
    /// status and body for diagnostics.
    pub(crate) fn into_network_error(self) -> PseudokitError {
        PseudokitError::NetworkError {
            url: self.url,
            status: Some(self.status),
            error: self.body,
        }
    }
}

#[derive(Debug)]
struct TransportError {
    url: String,
    error: String,
    retryable: bool,
}

impl TransportError {
    fn retryable(url: String, error: String) -> Self {
        Self {
            url,
            error,
            retryable: true,
        }
    }

    fn permanent(url: String, error: String) -> Self {
        Self {
            url,
            error,
            retryable: false,
        }
    }

    const fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<TransportError> for PseudokitError {
    fn from(value: TransportError) -> Self {
        Self::NetworkError {
            url: value.url,
            status: None,
            error: value.error,
        }
    }
}

async fn execute(request_builder: RequestBuilder) -> Result<ApiResponse, TransportError> {
    let (client, request) = request_builder.build_split();
    let request = request.map_err(|err| {
        TransportError::permanent(
            err.url()
                .map_or_else(|| "<unknown>".to_string(), ToString::to_string),
            format!("request build failed: {err}"),
        )
    })?;
    let url = request.url().to_string();

    match client.execute(request).await {
        Ok(response) => {
            let status = response.status().as_u16();
            let body = response.text().await.map_err(|err| {
                TransportError::permanent(
                    url.clone(),
                    format!("failed to read response body: {err}"),
                )
            })?;
            Ok(ApiResponse { url, status, body })
        }
        Err(err) if err.is_timeout() || err.is_connect() => Err(TransportError::retryable(
            url,
            format!("request timeout/connect error: {err}"),
        )),
        Err(err) => Err(TransportError::permanent(
            url,
            format!("request failed: {err}"),
        )),
    }
}
