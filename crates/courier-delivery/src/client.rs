//! HTTP client for webhook delivery with per-request deadlines.
//!
//! Sends a fully prepared POST and reports either the endpoint's response or
//! a transport error. Whether a response counts as success is left to the
//! caller.

use std::time::{Duration, Instant};

use bytes::Bytes;
use courier_core::{DeliveryId, MessageId};
use reqwest::{header::HeaderMap, Response};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
    /// Upper bound on establishing a connection. The per-delivery attempt
    /// timeout still bounds the whole exchange.
    pub connect_timeout: Duration,
    /// Response bodies longer than this are truncated before storage.
    pub max_response_body_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: "Courier-Webhook-Delivery/1.0".to_string(),
            max_redirects: 3,
            verify_tls: true,
            connect_timeout: Duration::from_secs(10),
            max_response_body_bytes: 64 * 1024,
        }
    }
}

/// Shared HTTP client for all workers of an engine.
///
/// Cloning is cheap; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// A prepared webhook request.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Delivery being attempted.
    pub delivery_id: DeliveryId,
    /// Message carried by the delivery.
    pub message_id: MessageId,
    /// Destination URL.
    pub url: String,
    /// Headers in the order they are sent.
    pub headers: Vec<(String, String)>,
    /// Exact body bytes; the signature covers these.
    pub body: Bytes,
    /// 1-based number of this attempt.
    pub attempt_number: i32,
    /// Wall-clock bound on the whole exchange.
    pub timeout: Duration,
}

/// Response from a webhook endpoint.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Canonical reason phrase, if the status has one.
    pub reason: Option<&'static str>,
    /// Response headers in received order.
    pub headers: Vec<(String, String)>,
    /// Response body, possibly truncated.
    pub body: String,
    /// Time from sending to the end of the body.
    pub duration: Duration,
    /// Whether the status is 2xx.
    pub is_success: bool,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built from the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends a webhook and waits for the full response.
    ///
    /// Connecting, sending and reading the body all count against
    /// `request.timeout`.
    ///
    /// # Errors
    ///
    /// - `Timeout` when the deadline passes before the body is read
    /// - `NetworkError` for connection and protocol failures
    ///
    /// Non-2xx responses are returned as `Ok`.
    pub async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryResponse> {
        let span = info_span!(
            "webhook_delivery",
            delivery_id = %request.delivery_id,
            message_id = %request.message_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            tracing::debug!("starting webhook delivery");
            let start_time = Instant::now();

            let exchange = async {
                let mut http_request = self
                    .client
                    .post(&request.url)
                    .timeout(request.timeout)
                    .body(request.body.clone());
                for (name, value) in &request.headers {
                    http_request = http_request.header(name, value);
                }

                let response =
                    http_request.send().await.map_err(|e| map_error(&e, request.timeout))?;
                self.parse_response(response, start_time, request).await
            };

            let result = match tokio::time::timeout(request.timeout, exchange).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::timeout(request.timeout)),
            };

            match &result {
                Ok(response) if response.is_success => {
                    tracing::info!(
                        status = response.status_code,
                        duration_ms = response.duration.as_millis(),
                        "webhook delivered"
                    );
                },
                Ok(response) => {
                    tracing::warn!(
                        status = response.status_code,
                        duration_ms = response.duration.as_millis(),
                        "webhook rejected by endpoint"
                    );
                },
                Err(e) => {
                    tracing::warn!(
                        duration_ms = start_time.elapsed().as_millis(),
                        error = %e,
                        "webhook request failed"
                    );
                },
            }

            result
        }
        .instrument(span)
        .await
    }

    async fn parse_response(
        &self,
        response: Response,
        start_time: Instant,
        request: &DeliveryRequest,
    ) -> Result<DeliveryResponse> {
        let status = response.status();
        let headers = extract_headers(response.headers());

        let body = match response.bytes().await {
            Ok(bytes) => truncate_body(&bytes, self.config.max_response_body_bytes),
            Err(e) if e.is_timeout() => return Err(DeliveryError::timeout(request.timeout)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read response body");
                format!("[failed to read response body: {e}]")
            },
        };

        Ok(DeliveryResponse {
            status_code: status.as_u16(),
            reason: status.canonical_reason(),
            headers,
            body,
            duration: start_time.elapsed(),
            is_success: status.is_success(),
        })
    }
}

fn map_error(error: &reqwest::Error, timeout: Duration) -> DeliveryError {
    if error.is_timeout() {
        DeliveryError::timeout(timeout)
    } else if error.is_connect() {
        DeliveryError::network(format!("connection failed: {error}"))
    } else {
        DeliveryError::network(error.to_string())
    }
}

fn truncate_body(bytes: &[u8], limit: usize) -> String {
    if bytes.len() > limit {
        let truncated = String::from_utf8_lossy(&bytes[..limit]);
        format!("{truncated}{TRUNCATION_SUFFIX}")
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

fn extract_headers(header_map: &HeaderMap) -> Vec<(String, String)> {
    header_map
        .iter()
        .filter_map(|(key, value)| {
            value.to_str().ok().map(|value| (key.to_string(), value.to_string()))
        })
        .collect()
}
