//! The `http` module provides [`HttpTransport`], which fetches repository files over
//! HTTP(S) with retries and, where the server supports byte ranges, mid-body resume.

use crate::transport::TransportStream;
use crate::{Transport, TransportError, TransportErrorKind};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::trace;
use reqwest::header::{self, HeaderValue, ACCEPT_RANGES};
use reqwest::{Client, ClientBuilder, Method, Response};
use snafu::{ResultExt, Snafu};
use std::time::Duration;
use url::Url;

/// A builder for [`HttpTransport`] which allows settings customization.
///
/// # Example
///
/// ```
/// # use updraft::HttpTransportBuilder;
/// let http_transport = HttpTransportBuilder::new()
///     .tries(3)
///     .backoff_factor(1.5)
///     .build();
/// ```
#[derive(Clone, Copy, Debug)]
pub struct HttpTransportBuilder {
    timeout: Duration,
    connect_timeout: Duration,
    tries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    backoff_factor: f32,
}

impl Default for HttpTransportBuilder {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            // try / 100ms / try / 150ms / try / 225ms / try
            tries: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            backoff_factor: 1.5,
        }
    }
}

impl HttpTransportBuilder {
    /// Create a new `HttpTransportBuilder` with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a timeout for the complete fetch operation.
    #[must_use]
    pub fn timeout(mut self, value: Duration) -> Self {
        self.timeout = value;
        self
    }

    /// Set a timeout for only the connect phase.
    #[must_use]
    pub fn connect_timeout(mut self, value: Duration) -> Self {
        self.connect_timeout = value;
        self
    }

    /// Set the total number of times we will try the fetch operation (in case of retryable
    /// failures).
    #[must_use]
    pub fn tries(mut self, value: u32) -> Self {
        self.tries = value;
        self
    }

    /// Set the pause duration between the first and second try.
    #[must_use]
    pub fn initial_backoff(mut self, value: Duration) -> Self {
        self.initial_backoff = value;
        self
    }

    /// Set the maximum duration of a pause between retries.
    #[must_use]
    pub fn max_backoff(mut self, value: Duration) -> Self {
        self.max_backoff = value;
        self
    }

    /// Set the exponential backoff factor, the factor by which the pause time will increase
    /// after each try until reaching `max_backoff`.
    #[must_use]
    pub fn backoff_factor(mut self, value: f32) -> Self {
        self.backoff_factor = value;
        self
    }

    /// Construct an [`HttpTransport`] from this builder's settings.
    pub fn build(self) -> HttpTransport {
        HttpTransport { settings: self }
    }
}

/// A [`Transport`] over HTTP with retry logic. Use the [`HttpTransportBuilder`] to construct
/// a custom `HttpTransport`, or use `HttpTransport::default()`.
///
/// This transport returns `FileNotFound` for the following HTTP response codes:
/// - 403: Forbidden. (Some services return this code when a file does not exist.)
/// - 404: Not Found.
/// - 410: Gone.
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpTransport {
    settings: HttpTransportBuilder,
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: Url) -> Result<TransportStream, TransportError> {
        let client = ClientBuilder::new()
            .timeout(self.settings.timeout)
            .connect_timeout(self.settings.connect_timeout)
            .build()
            .context(HttpClientSnafu)
            .map_err(|e| TransportError::from((url.clone(), e)))?;

        let fetch = FetchState {
            client,
            settings: self.settings,
            url: url.clone(),
            current_try: 0,
            wait: self.settings.initial_backoff,
            next_byte: 0,
            has_range_support: false,
            body: None,
        };

        Ok(futures::stream::try_unfold(fetch, |mut fetch| async move {
            match fetch.next_chunk().await {
                Ok(Some(chunk)) => Ok(Some((chunk, fetch))),
                Ok(None) => Ok(None),
                Err(e) => Err(TransportError::from((fetch.url.clone(), e))),
            }
        })
        .boxed())
    }
}

struct FetchState {
    client: Client,
    settings: HttpTransportBuilder,
    url: Url,
    current_try: u32,
    wait: Duration,
    next_byte: usize,
    has_range_support: bool,
    body: Option<BoxStream<'static, reqwest::Result<bytes::Bytes>>>,
}

impl FetchState {
    /// Produces the next body chunk, opening (or re-opening) the request as needed.
    async fn next_chunk(&mut self) -> Result<Option<bytes::Bytes>, HttpError> {
        loop {
            if self.body.is_none() {
                let response = self.send_request().await?;
                if let Some(ranges) = response.headers().get(ACCEPT_RANGES) {
                    if ranges.to_str().is_ok_and(|v| v.contains("bytes")) {
                        self.has_range_support = true;
                    }
                }
                self.body = Some(response.bytes_stream().boxed());
            }

            // Unwrap will not panic, body was just set.
            match self.body.as_mut().unwrap().next().await {
                None => return Ok(None),
                Some(Ok(chunk)) => {
                    self.next_byte += chunk.len();
                    return Ok(Some(chunk));
                }
                Some(Err(e)) => {
                    trace!("error streaming response body from '{}': {}", self.url, e);
                    self.body = None;
                    // Only a server with range support can resume mid-body.
                    if !self.may_retry() || (!self.has_range_support && self.next_byte > 0) {
                        return Err(HttpError::FetchFatal { source: e });
                    }
                }
            }
        }
    }

    /// Sends the GET request, retrying per the settings, until a success response streams.
    async fn send_request(&mut self) -> Result<Response, HttpError> {
        loop {
            if self.current_try > 0 {
                tokio::time::sleep(self.wait).await;
            }
            let result = self.build_request()?.send().await;
            match classify(result) {
                HttpResult::Ok(response) => return Ok(response),
                HttpResult::Err(ErrorClass::Fatal(source)) => {
                    trace!("fatal error fetching '{}': {}", self.url, source);
                    return Err(HttpError::FetchFatal { source });
                }
                HttpResult::Err(ErrorClass::FileNotFound(source)) => {
                    trace!("file not found at '{}': {}", self.url, source);
                    return Err(HttpError::FetchFileNotFound { source });
                }
                HttpResult::Err(ErrorClass::Retryable(source)) => {
                    trace!("retryable error fetching '{}': {}", self.url, source);
                    if !self.may_retry() {
                        return Err(HttpError::FetchNoMoreRetries {
                            tries: self.settings.tries,
                            source,
                        });
                    }
                }
            }
        }
    }

    fn build_request(&self) -> Result<reqwest::RequestBuilder, HttpError> {
        let mut request = self.client.request(Method::GET, self.url.as_str());
        if self.next_byte > 0 {
            let range = format!("bytes={}-", self.next_byte);
            let value = HeaderValue::from_str(&range).context(InvalidHeaderSnafu {
                header_value: &range,
            })?;
            request = request.header(header::RANGE, value);
        }
        Ok(request)
    }

    /// Checks all criteria for a retry and accounts for it.
    fn may_retry(&mut self) -> bool {
        let tries_left = self.settings.tries.saturating_sub(self.current_try + 1);
        if self.current_try > 0 {
            self.wait = std::cmp::min(
                self.wait.mul_f32(self.settings.backoff_factor),
                self.settings.max_backoff,
            );
        }
        self.current_try += 1;
        tries_left > 0
    }
}

/// A newtype result for ergonomic conversions.
enum HttpResult {
    Ok(Response),
    Err(ErrorClass),
}

/// Groups reqwest errors into the cases the retry loop distinguishes.
enum ErrorClass {
    /// An error (other than file-not-found) we will not retry.
    Fatal(reqwest::Error),
    /// The file could not be found (HTTP status 403, 404, or 410).
    FileNotFound(reqwest::Error),
    /// A timeout, send failure, or server error that may clear on retry.
    Retryable(reqwest::Error),
}

fn classify(result: reqwest::Result<Response>) -> HttpResult {
    let response = match result {
        Ok(response) => response,
        Err(e) if e.is_timeout() || e.is_request() => {
            return HttpResult::Err(ErrorClass::Retryable(e))
        }
        Err(e) => return HttpResult::Err(ErrorClass::Fatal(e)),
    };

    match response.error_for_status() {
        Ok(ok) => HttpResult::Ok(ok),
        Err(err) => match err.status() {
            Some(status) if status.is_server_error() => {
                HttpResult::Err(ErrorClass::Retryable(err))
            }
            Some(status) if matches!(status.as_u16(), 403 | 404 | 410) => {
                HttpResult::Err(ErrorClass::FileNotFound(err))
            }
            _ => HttpResult::Err(ErrorClass::Fatal(err)),
        },
    }
}

/// The error type for the HTTP transport module.
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum HttpError {
    #[snafu(display("A non-retryable error occurred: {}", source))]
    FetchFatal { source: reqwest::Error },

    #[snafu(display("File not found: {}", source))]
    FetchFileNotFound { source: reqwest::Error },

    #[snafu(display("Fetch failed after {} retries: {}", tries, source))]
    FetchNoMoreRetries { tries: u32, source: reqwest::Error },

    #[snafu(display("The HTTP client could not be built: {}", source))]
    HttpClient { source: reqwest::Error },

    #[snafu(display("Invalid header value '{}': {}", header_value, source))]
    InvalidHeader {
        header_value: String,
        source: reqwest::header::InvalidHeaderValue,
    },
}

impl From<(Url, HttpError)> for TransportError {
    fn from((url, e): (Url, HttpError)) -> Self {
        match e {
            HttpError::FetchFileNotFound { .. } => {
                TransportError::new_with_cause(TransportErrorKind::FileNotFound, url, e)
            }
            _ => TransportError::new_with_cause(TransportErrorKind::Other, url, e),
        }
    }
}
