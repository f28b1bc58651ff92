use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response, header};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::observability::{SCORING_REQUEST_ERRORS, SCORING_REQUESTS};
use crate::resolver::EndpointDescriptor;
use crate::sse::process_sse;
use crate::trace::{self, HttpTraceLogger, TraceDirection};
use crate::types::{ScoringRequest, SimpleResponse, StreamedChunk};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_REPLAY_DELAY: Duration = Duration::from_millis(10);
const DEPLOYMENT_HEADER: &str = "azureml-model-deployment";
const EVENT_STREAM: &str = "text/event-stream";
const APPLICATION_JSON: &str = "application/json";

/// A lazily evaluated sequence of answer fragments.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamedChunk>> + Send>>;

/// Something that can score a chat request, whole or incrementally.
#[async_trait::async_trait]
pub trait Scorer: Send + Sync {
    /// Score `request` and return the complete answer.
    async fn score(&self, request: &ScoringRequest) -> Result<SimpleResponse>;

    /// Score `request` and return its answer as a stream of fragments.
    async fn score_stream(&self, request: &ScoringRequest) -> Result<ChunkStream>;
}

/// Client for a resolved scoring endpoint.
///
/// Cloning is cheap; clones share the underlying connection pool.
#[derive(Clone)]
pub struct ScoringClient {
    client: ReqwestClient,
    endpoint: Arc<EndpointDescriptor>,
    timeout: Duration,
    replay_delay: Duration,
    trace: Option<Arc<dyn HttpTraceLogger>>,
}

impl fmt::Debug for ScoringClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScoringClient")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("replay_delay", &self.replay_delay)
            .field("traced", &self.trace.is_some())
            .finish()
    }
}

impl ScoringClient {
    /// Create a new client for `endpoint` with default settings.
    pub fn new(endpoint: EndpointDescriptor) -> Result<Self> {
        Self::with_options(endpoint, None, None)
    }

    /// Create a new client with custom settings.
    ///
    /// `replay_delay` paces the replay of a complete answer when a streaming request is answered
    /// with a plain JSON document.
    pub fn with_options(
        endpoint: EndpointDescriptor,
        timeout: Option<Duration>,
        replay_delay: Option<Duration>,
    ) -> Result<Self> {
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
        let client = ReqwestClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;

        Ok(Self {
            client,
            endpoint: Arc::new(endpoint),
            timeout,
            replay_delay: replay_delay.unwrap_or(DEFAULT_REPLAY_DELAY),
            trace: None,
        })
    }

    /// Return a clone of this client that reports raw HTTP lines to `logger`.
    pub fn with_trace_logger(&self, logger: Arc<dyn HttpTraceLogger>) -> Self {
        Self {
            trace: Some(logger),
            ..self.clone()
        }
    }

    /// The endpoint this client talks to.
    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.endpoint
    }

    /// Create the headers for a scoring request.
    fn headers(&self, accept: &'static str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(APPLICATION_JSON),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static(accept));
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", self.endpoint.key))
            .map_err(|_| {
                Error::validation(
                    "endpoint key contains characters not allowed in a header",
                    Some("key".to_string()),
                )
            })?;
        bearer.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, bearer);
        headers.insert(
            DEPLOYMENT_HEADER,
            HeaderValue::from_str(&self.endpoint.deployment).map_err(|_| {
                Error::validation(
                    "deployment name contains characters not allowed in a header",
                    Some("deployment".to_string()),
                )
            })?,
        );
        Ok(headers)
    }

    fn trace_block(&self, direction: TraceDirection, block: &str) {
        if let Some(trace) = &self.trace {
            trace.log_block(direction, block);
        }
    }

    fn trace_request(&self, request: &ScoringRequest, accept: &str) {
        let Some(trace) = &self.trace else {
            return;
        };
        trace.start_call();
        for line in trace::request_head(&self.endpoint.scoring_uri, &self.endpoint.deployment, accept)
        {
            trace.log_line(TraceDirection::Request, &line);
        }
        match serde_json::to_string_pretty(request) {
            Ok(body) => trace.log_block(TraceDirection::Request, &body),
            Err(e) => trace.log_line(TraceDirection::Note, &format!("<unprintable body: {e}>")),
        }
    }

    fn trace_response_head(&self, response: &Response) {
        let Some(trace) = &self.trace else {
            return;
        };
        let status = response.status();
        trace.log_line(
            TraceDirection::Response,
            &format!(
                "HTTP/1.1 {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or_default()
            ),
        );
        if let Some(content_type) = content_type(response) {
            trace.log_line(
                TraceDirection::Response,
                &format!("Content-Type: {content_type}"),
            );
        }
        trace.log_line(TraceDirection::Response, "");
    }

    /// Process API response errors and convert to our Error type
    async fn process_error_response(&self, response: Response) -> Error {
        let status = response.status();
        let status_code = status.as_u16();

        let request_id = ["x-request-id", "x-ms-request-id"]
            .iter()
            .find_map(|name| response.headers().get(*name))
            .and_then(|val| val.to_str().ok())
            .map(String::from);

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|val| val.to_str().ok())
            .and_then(|val| val.parse::<u64>().ok());

        #[derive(Deserialize)]
        struct ErrorResponse {
            message: Option<String>,
            error: Option<ErrorDetail>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum ErrorDetail {
            Object { message: Option<String> },
            Text(String),
        }

        let error_body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return Error::http_client(
                    format!("Failed to read error response: {e}"),
                    Some(Box::new(e)),
                );
            }
        };
        self.trace_block(TraceDirection::Response, &error_body);

        let parsed = serde_json::from_str::<ErrorResponse>(&error_body).ok();
        let message = parsed
            .and_then(|e| match e.error {
                Some(ErrorDetail::Object { message }) => message.or(e.message),
                Some(ErrorDetail::Text(text)) => Some(text),
                None => e.message,
            })
            .unwrap_or_else(|| {
                if error_body.trim().is_empty() {
                    status.canonical_reason().unwrap_or("no body").to_string()
                } else {
                    error_body.clone()
                }
            });

        match status_code {
            400 => Error::bad_request(message),
            401 => Error::authentication(message),
            403 => Error::permission(message),
            404 => Error::not_found(message, Some("scoring endpoint".to_string()), None),
            408 => Error::timeout(message, None),
            424 | 500 => Error::internal_server(message, request_id),
            429 => Error::rate_limit(message, retry_after),
            502..=504 => Error::service_unavailable(message, retry_after),
            _ => Error::api(status_code, message, request_id),
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::timeout(
                format!("Request timed out: {e}"),
                Some(self.timeout.as_secs_f64()),
            )
        } else if e.is_connect() {
            Error::connection(format!("Connection error: {e}"), Some(Box::new(e)))
        } else {
            Error::http_client(format!("Request failed: {e}"), Some(Box::new(e)))
        }
    }

    async fn post(&self, request: &ScoringRequest, accept: &'static str) -> Result<Response> {
        SCORING_REQUESTS.click();
        let headers = self.headers(accept)?;
        self.trace_request(request, accept);
        tracing::info!(
            endpoint = %self.endpoint.scoring_uri,
            stream = request.stream,
            "Calling ML online endpoint..."
        );

        let response = self
            .client
            .post(self.endpoint.scoring_uri.clone())
            .headers(headers)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                let err = self.map_send_error(e);
                if let Some(trace) = &self.trace {
                    trace.log_line(TraceDirection::Note, &err.to_string());
                }
                err
            });
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                SCORING_REQUEST_ERRORS.click();
                tracing::error!("scoring request failed: {err}");
                return Err(err);
            }
        };

        self.trace_response_head(&response);
        tracing::info!(
            "Got response: {} {}",
            response.status().as_u16(),
            response.status().canonical_reason().unwrap_or_default()
        );
        tracing::info!(
            "Response Content-Type: {}",
            content_type(&response).unwrap_or("<none>")
        );

        if !response.status().is_success() {
            SCORING_REQUEST_ERRORS.click();
            let err = self.process_error_response(response).await;
            tracing::error!("error: {err}");
            return Err(err);
        }
        Ok(response)
    }

    async fn read_simple(&self, response: Response) -> Result<SimpleResponse> {
        let body = response.text().await.map_err(|e| {
            Error::http_client(
                format!("Failed to read response: {e}"),
                Some(Box::new(e)),
            )
        })?;
        self.trace_block(TraceDirection::Response, &body);
        SimpleResponse::from_json(&body).inspect_err(|err| {
            SCORING_REQUEST_ERRORS.click();
            tracing::error!("Failed to validate response: {err}");
        })
    }

    /// Send a request to the endpoint and get a non-streaming response.
    pub async fn send(&self, request: &ScoringRequest) -> Result<SimpleResponse> {
        let mut request = request.clone();
        request.stream = false;
        let response = self.post(&request, APPLICATION_JSON).await?;
        self.read_simple(response).await
    }

    /// Send a request to the endpoint and get a streaming response.
    ///
    /// Returns a stream of [`StreamedChunk`]s that can be processed incrementally.  If the
    /// endpoint answers with a complete JSON document instead of an event stream, that answer is
    /// validated and replayed one character at a time.
    pub async fn stream(&self, request: &ScoringRequest) -> Result<ChunkStream> {
        let mut request = request.clone();
        request.stream = true;
        let response = self.post(&request, EVENT_STREAM).await?;

        if content_type(&response).is_some_and(|ct| ct.starts_with(EVENT_STREAM)) {
            let byte_stream = response.bytes_stream().map(|result| {
                result.map_err(|e| {
                    Error::streaming(format!("Error in HTTP stream: {e}"), Some(Box::new(e)))
                })
            });
            return Ok(Box::pin(process_sse(byte_stream, self.trace.clone())));
        }

        tracing::debug!("endpoint answered a streaming request with a complete document");
        let answer = self.read_simple(response).await?.answer;
        Ok(replay(answer, self.replay_delay))
    }
}

#[async_trait::async_trait]
impl Scorer for ScoringClient {
    async fn score(&self, request: &ScoringRequest) -> Result<SimpleResponse> {
        self.send(request).await
    }

    async fn score_stream(&self, request: &ScoringRequest) -> Result<ChunkStream> {
        self.stream(request).await
    }
}

/// Replay a complete answer as a stream of one-character chunks.
pub(crate) fn replay(answer: String, delay: Duration) -> ChunkStream {
    let fragments: Vec<String> = answer.chars().map(String::from).collect();
    Box::pin(stream::iter(fragments).then(move |fragment| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(StreamedChunk::new(fragment))
    }))
}

fn content_type(response: &Response) -> Option<&str> {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|val| val.to_str().ok())
}
