//! HTTP mocking utilities for webhook testing.

use std::{net::TcpListener, time::Duration};

use anyhow::{Context, Result};
use courier_delivery::{executor::WebhookEnvelope, signing};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, Request, ResponseTemplate,
};

/// One scripted response of a mock endpoint.
#[derive(Debug, Clone, Copy)]
pub enum MockResponse {
    /// Respond immediately with the status.
    Status(u16),
    /// Respond with the status after a delay.
    Delayed(u16, Duration),
}

impl MockResponse {
    fn template(self) -> ResponseTemplate {
        match self {
            Self::Status(status) => ResponseTemplate::new(status),
            Self::Delayed(status, delay) => ResponseTemplate::new(status).set_delay(delay),
        }
    }
}

/// Mounts a POST endpoint at `endpoint_path` always answering `status`.
pub async fn mock_status(server: &MockServer, endpoint_path: &str, status: u16) {
    Mock::given(method("POST"))
        .and(path(endpoint_path))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

/// Mounts a POST endpoint answering each request with the next scripted
/// response; the last one repeats forever.
pub async fn mock_sequence(server: &MockServer, endpoint_path: &str, responses: &[MockResponse]) {
    let Some((last, scripted)) = responses.split_last() else {
        return;
    };

    for response in scripted {
        Mock::given(method("POST"))
            .and(path(endpoint_path))
            .respond_with(response.template())
            .up_to_n_times(1)
            .mount(server)
            .await;
    }

    Mock::given(method("POST"))
        .and(path(endpoint_path))
        .respond_with(last.template())
        .mount(server)
        .await;
}

/// Requests received on `endpoint_path`, in arrival order.
pub async fn received_on(server: &MockServer, endpoint_path: &str) -> Result<Vec<Request>> {
    let requests = server.received_requests().await.context("request recording is disabled")?;
    Ok(requests.into_iter().filter(|request| request.url.path() == endpoint_path).collect())
}

/// Verifies the signature of a received webhook and decodes its envelope.
pub fn verify_webhook(request: &Request, secret: &str) -> Result<WebhookEnvelope> {
    let signature = request
        .headers
        .get(signing::SIGNATURE_HEADER)
        .context("signature header missing")?
        .to_str()
        .context("signature header is not ASCII")?;

    signing::verify_signature(secret, &request.body, signature)
        .context("signature does not match body")?;

    serde_json::from_slice(&request.body).context("body is not a webhook envelope")
}

/// Returns a localhost port with nothing listening on it.
///
/// The port is bound and released immediately, so connections to it are
/// refused unless another process grabs it in between.
pub fn unused_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").context("failed to bind scratch socket")?;
    let port = listener.local_addr().context("scratch socket has no address")?.port();
    drop(listener);
    Ok(port)
}

/// Starts a mock server listening on `port`.
///
/// Pairs with [`unused_port`]: an endpoint refuses connections until the
/// server is started on its port.
pub async fn start_on_port(port: u16) -> Result<MockServer> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .with_context(|| format!("failed to bind mock server to port {port}"))?;
    Ok(MockServer::builder().listener(listener).start().await)
}
