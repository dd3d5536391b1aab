//! Single-attempt webhook execution.
//!
//! Builds the signed JSON envelope for a claimed delivery, sends it and
//! condenses the exchange into an [`AttemptOutcome`]. The outcome is always
//! produced; transport failures are data, not errors.

use std::{
    fmt::Write as _,
    time::{Duration, Instant},
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_core::{
    models::duration_to_millis, Delivery, DeliveryAttempt, DeliveryAttemptId, DeliveryId, Message,
    MessageId, SubscriptionId, TopicId,
};
use serde::{Deserialize, Serialize};

use crate::{
    client::{DeliveryClient, DeliveryRequest, DeliveryResponse},
    error::{DeliveryError, Result},
    signing::{self, SIGNATURE_HEADER},
};

/// Header carrying the delivery id receivers deduplicate on.
pub const DELIVERY_ID_HEADER: &str = "X-Courier-Delivery-Id";

/// Header carrying the message id.
pub const MESSAGE_ID_HEADER: &str = "X-Courier-Message-Id";

/// Header carrying the 1-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Courier-Attempt";

/// JSON body POSTed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    /// Delivery identifier, stable across retries.
    pub delivery_id: DeliveryId,
    /// Message identifier.
    pub message_id: MessageId,
    /// Subscription the delivery belongs to.
    pub subscription_id: SubscriptionId,
    /// Topic the message was published to.
    pub topic_id: TopicId,
    /// Content type of the original payload.
    pub content_type: String,
    /// Base64-encoded payload bytes.
    pub data: String,
    /// When the message was published.
    pub created_at: DateTime<Utc>,
}

impl WebhookEnvelope {
    /// Builds the envelope for a delivery of `message`.
    pub fn new(delivery: &Delivery, message: &Message) -> Self {
        Self {
            delivery_id: delivery.id,
            message_id: message.id,
            subscription_id: delivery.subscription_id,
            topic_id: message.topic_id,
            content_type: message.content_type.clone(),
            data: BASE64.encode(&message.payload),
            created_at: message.created_at,
        }
    }

    /// Decodes the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` is not valid base64.
    pub fn decode_data(&self) -> std::result::Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.data)
    }
}

/// Result of one HTTP attempt, ready to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    /// Rendered request as sent.
    pub request: String,
    /// Rendered response; empty when no response was received.
    pub response: String,
    /// Response status, absent on transport failure.
    pub status_code: Option<u16>,
    /// Wall-clock time spent on the attempt.
    pub duration: Duration,
    /// Whether a 2xx response was received.
    pub success: bool,
    /// Transport error description; absent whenever a response arrived.
    pub error: Option<String>,
}

impl AttemptOutcome {
    /// Converts the outcome into an attempt row.
    pub fn into_attempt(
        self,
        delivery_id: DeliveryId,
        attempt_number: i32,
        created_at: DateTime<Utc>,
    ) -> DeliveryAttempt {
        DeliveryAttempt {
            id: DeliveryAttemptId::new(),
            delivery_id,
            attempt_number,
            request: self.request,
            response: self.response,
            response_status_code: self.status_code.map(i32::from),
            execution_duration_ms: duration_to_millis(self.duration),
            success: self.success,
            error: self.error,
            created_at,
        }
    }

    fn transport_failure(request: String, duration: Duration, error: &DeliveryError) -> Self {
        Self {
            request,
            response: String::new(),
            status_code: None,
            duration,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Performs webhook attempts over a shared client.
#[derive(Debug, Clone)]
pub struct WebhookExecutor {
    client: DeliveryClient,
}

impl WebhookExecutor {
    /// Creates an executor sending through `client`.
    pub fn new(client: DeliveryClient) -> Self {
        Self { client }
    }

    /// Builds the signed request for the next attempt of `delivery`.
    ///
    /// # Errors
    ///
    /// Returns `InternalError` if the envelope cannot be serialized and
    /// `ConfigurationError` if the secret is rejected by the signer.
    pub fn build_request(&self, delivery: &Delivery, message: &Message) -> Result<DeliveryRequest> {
        let envelope = WebhookEnvelope::new(delivery, message);
        let body = serde_json::to_vec(&envelope)
            .map_err(|e| DeliveryError::internal(format!("failed to encode envelope: {e}")))?;
        let signature = signing::sign(&delivery.secret_token, &body)
            .map_err(|e| DeliveryError::configuration(e.to_string()))?;

        let attempt_number = delivery.attempt_count.saturating_add(1);
        let headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            (DELIVERY_ID_HEADER.to_string(), delivery.id.to_string()),
            (MESSAGE_ID_HEADER.to_string(), message.id.to_string()),
            (ATTEMPT_HEADER.to_string(), attempt_number.to_string()),
            (SIGNATURE_HEADER.to_string(), signature),
        ];

        Ok(DeliveryRequest {
            delivery_id: delivery.id,
            message_id: message.id,
            url: delivery.url.clone(),
            headers,
            body: Bytes::from(body),
            attempt_number,
            timeout: delivery.delivery_attempt_timeout(),
        })
    }

    /// Attempts `delivery` once.
    ///
    /// Success means a 2xx response within the delivery's timeout. A non-2xx
    /// response keeps its rendering and status with no error; a transport
    /// failure or timeout carries an error and no response.
    pub async fn attempt(&self, delivery: &Delivery, message: &Message) -> AttemptOutcome {
        let start = Instant::now();

        let request = match self.build_request(delivery, message) {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(delivery_id = %delivery.id, error = %e, "failed to build webhook");
                return AttemptOutcome::transport_failure(String::new(), start.elapsed(), &e);
            },
        };
        let rendered_request = render_request(&request);

        match self.client.deliver(&request).await {
            Ok(response) => AttemptOutcome {
                request: rendered_request,
                response: render_response(&response),
                status_code: Some(response.status_code),
                duration: start.elapsed(),
                success: response.is_success,
                error: None,
            },
            Err(e) => AttemptOutcome::transport_failure(rendered_request, start.elapsed(), &e),
        }
    }
}

/// Renders a request in HTTP/1.1 message form for the attempt log.
pub fn render_request(request: &DeliveryRequest) -> String {
    let mut rendered = format!("POST {} HTTP/1.1\r\n", request.url);
    for (name, value) in &request.headers {
        let _ = write!(rendered, "{name}: {value}\r\n");
    }
    rendered.push_str("\r\n");
    rendered.push_str(&String::from_utf8_lossy(&request.body));
    rendered
}

/// Renders a response in HTTP/1.1 message form for the attempt log.
pub fn render_response(response: &DeliveryResponse) -> String {
    let mut rendered =
        format!("HTTP/1.1 {} {}\r\n", response.status_code, response.reason.unwrap_or_default());
    for (name, value) in &response.headers {
        let _ = write!(rendered, "{name}: {value}\r\n");
    }
    rendered.push_str("\r\n");
    rendered.push_str(&response.body);
    rendered
}

#[cfg(test)]
mod tests {
    use courier_core::{DeliveryStatus, Subscription};
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::signing::verify_signature;

    fn fixture(url: &str) -> (Delivery, Message) {
        let now = Utc::now();
        let subscription = Subscription {
            id: SubscriptionId::new(),
            topic_id: TopicId::new(),
            name: "orders".to_string(),
            url: url.to_string(),
            secret_token: "whsec_test".to_string(),
            max_delivery_attempts: 3,
            delivery_attempt_delay_ms: 1000,
            delivery_attempt_timeout_ms: 2000,
            created_at: now,
            updated_at: now,
        };
        let message = Message {
            id: MessageId::new(),
            topic_id: subscription.topic_id,
            content_type: "text/plain".to_string(),
            payload: b"hello".to_vec(),
            created_at: now,
            updated_at: now,
        };
        let delivery = Delivery::for_subscription(&message, &subscription, now);
        (delivery, message)
    }

    fn executor() -> WebhookExecutor {
        WebhookExecutor::new(DeliveryClient::with_defaults().unwrap())
    }

    #[test]
    fn request_is_signed_over_exact_body() {
        let (delivery, message) = fixture("http://localhost/hook");
        let request = executor().build_request(&delivery, &message).unwrap();

        let signature = request
            .headers
            .iter()
            .find(|(name, _)| name == SIGNATURE_HEADER)
            .map(|(_, value)| value.clone())
            .unwrap();
        assert!(verify_signature("whsec_test", &request.body, &signature).is_ok());

        let envelope: WebhookEnvelope = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(envelope.delivery_id, delivery.id);
        assert_eq!(envelope.content_type, "text/plain");
        assert_eq!(envelope.decode_data().unwrap(), b"hello");
        assert_eq!(request.attempt_number, 1);
        assert_eq!(request.timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn success_outcome_carries_response() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::header(ATTEMPT_HEADER, "1"))
            .and(matchers::header("Content-Type", "application/json"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let (delivery, message) = fixture(&format!("{}/hook", server.uri()));
        assert_eq!(delivery.status, DeliveryStatus::Pending);

        let outcome = executor().attempt(&delivery, &message).await;
        assert!(outcome.success);
        assert_eq!(outcome.status_code, Some(204));
        assert!(outcome.error.is_none());
        assert!(outcome.response.starts_with("HTTP/1.1 204"));
        assert!(outcome.request.starts_with("POST "));
    }

    #[tokio::test]
    async fn non_2xx_is_failure_without_error() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let (delivery, message) = fixture(&format!("{}/hook", server.uri()));
        let outcome = executor().attempt(&delivery, &message).await;

        assert!(!outcome.success);
        assert_eq!(outcome.status_code, Some(503));
        assert!(outcome.error.is_none());
        assert!(outcome.response.ends_with("busy"));
    }

    #[tokio::test]
    async fn timeout_is_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let (mut delivery, message) = fixture(&format!("{}/hook", server.uri()));
        delivery.delivery_attempt_timeout_ms = 100;

        let outcome = executor().attempt(&delivery, &message).await;
        assert!(!outcome.success);
        assert_eq!(outcome.status_code, None);
        assert!(outcome.response.is_empty());
        assert!(outcome.error.is_some());
        assert!(outcome.duration < Duration::from_secs(3));
    }

    #[test]
    fn outcome_converts_to_attempt_row() {
        let delivery_id = DeliveryId::new();
        let now = Utc::now();
        let outcome = AttemptOutcome {
            request: "POST / HTTP/1.1\r\n\r\n".to_string(),
            response: String::new(),
            status_code: None,
            duration: Duration::from_millis(42),
            success: false,
            error: Some("connection refused".to_string()),
        };

        let attempt = outcome.into_attempt(delivery_id, 2, now);
        assert_eq!(attempt.delivery_id, delivery_id);
        assert_eq!(attempt.attempt_number, 2);
        assert_eq!(attempt.execution_duration_ms, 42);
        assert_eq!(attempt.response_status_code, None);
        assert_eq!(attempt.error.as_deref(), Some("connection refused"));
    }
}
