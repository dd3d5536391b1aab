//! End-to-end dispatch behavior: claiming, HTTP attempts, retry scheduling
//! and failure handling against a mock subscriber.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{DeliveryStatus, RealClock, Topic};
use courier_delivery::{
    executor::{ATTEMPT_HEADER, DELIVERY_ID_HEADER},
    DeliveryConfig, DeliveryEngine, DeliveryError, RetryPolicy,
};
use courier_testing::{
    fixtures::TEST_SECRET,
    http::{self, MockResponse},
    Invariants, SubscriptionBuilder, TestEnv,
};

async fn topic_with_endpoint(env: &TestEnv, path: &str, attempts: i32) -> Result<Topic> {
    let topic = env.create_topic("orders").await?;
    env.create_subscription(
        SubscriptionBuilder::new(topic.id, env.webhook_url(path)).max_attempts(attempts),
    )
    .await?;
    Ok(topic)
}

#[tokio::test]
async fn delivery_succeeds_after_retries() -> Result<()> {
    let env = TestEnv::new().await?;
    http::mock_sequence(
        &env.http_mock,
        "/hook",
        &[MockResponse::Status(500), MockResponse::Status(503), MockResponse::Status(200)],
    )
    .await;
    let topic = topic_with_endpoint(&env, "/hook", 3).await?;
    let engine = env.engine(TestEnv::delivery_config())?;

    let fan_out = env.broker.publish(topic.id, None, br#"{"order":42}"#.to_vec()).await?;
    let delivery_id = fan_out.deliveries[0].id;

    let delivery = env.run_until_terminal(&engine, delivery_id, 10).await?;
    let attempts = env.attempts(delivery_id).await?;

    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempt_count, 3);
    let statuses: Vec<_> = attempts.iter().map(|a| a.response_status_code).collect();
    assert_eq!(statuses, vec![Some(500), Some(503), Some(200)]);
    Invariants::check_delivery(&delivery, &attempts)?;
    Invariants::retry_spacing(&delivery, &attempts, &RetryPolicy::default())?;

    let requests = http::received_on(&env.http_mock, "/hook").await?;
    assert_eq!(requests.len(), 3);
    for (index, request) in requests.iter().enumerate() {
        let id = request.headers.get(DELIVERY_ID_HEADER).context("delivery id header")?;
        assert_eq!(id.to_str()?, delivery_id.to_string());
        let attempt = request.headers.get(ATTEMPT_HEADER).context("attempt header")?;
        assert_eq!(attempt.to_str()?, (index + 1).to_string());
    }

    let stats = engine.stats().await;
    assert_eq!(stats.attempts_made, 3);
    assert_eq!(stats.retries_scheduled, 2);
    assert_eq!(stats.successful_deliveries, 1);
    Ok(())
}

#[tokio::test]
async fn delivery_fails_when_budget_is_exhausted() -> Result<()> {
    let env = TestEnv::new().await?;
    http::mock_status(&env.http_mock, "/hook", 500).await;
    let topic = topic_with_endpoint(&env, "/hook", 3).await?;
    let engine = env.engine(TestEnv::delivery_config())?;

    let fan_out = env.broker.publish(topic.id, None, b"{}".to_vec()).await?;
    let delivery_id = fan_out.deliveries[0].id;

    let delivery = env.run_until_terminal(&engine, delivery_id, 10).await?;
    let attempts = env.attempts(delivery_id).await?;

    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(attempts.len(), 3);
    for attempt in &attempts {
        assert!(!attempt.success);
        assert_eq!(attempt.response_status_code, Some(500));
        assert!(attempt.error.is_none(), "non-2xx recorded an error: {:?}", attempt.error);
        assert!(attempt.response.starts_with("HTTP/1.1 500"), "response: {}", attempt.response);
    }
    Invariants::check_delivery(&delivery, &attempts)?;

    // Terminal deliveries are never attempted again.
    env.advance_time(Duration::from_secs(86_400));
    assert_eq!(env.drain(&engine).await?, 0);
    assert_eq!(http::received_on(&env.http_mock, "/hook").await?.len(), 3);
    assert_eq!(engine.stats().await.permanent_failures, 1);
    Ok(())
}

#[tokio::test]
async fn single_attempt_budget_fails_without_retry() -> Result<()> {
    let env = TestEnv::new().await?;
    http::mock_status(&env.http_mock, "/hook", 404).await;
    let topic = topic_with_endpoint(&env, "/hook", 1).await?;
    let engine = env.engine(TestEnv::delivery_config())?;

    let fan_out = env.broker.publish(topic.id, None, b"{}".to_vec()).await?;
    env.drain(&engine).await?;

    let delivery = env.delivery(fan_out.deliveries[0].id).await?;
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempt_count, 1);
    assert_eq!(engine.stats().await.retries_scheduled, 0);
    Ok(())
}

#[tokio::test]
async fn slow_endpoint_times_out() -> Result<()> {
    let env = TestEnv::new().await?;
    http::mock_sequence(
        &env.http_mock,
        "/slow",
        &[MockResponse::Delayed(200, Duration::from_secs(2))],
    )
    .await;
    let topic = env.create_topic("orders").await?;
    env.create_subscription(
        SubscriptionBuilder::new(topic.id, env.webhook_url("/slow"))
            .max_attempts(1)
            .timeout(Duration::from_millis(200)),
    )
    .await?;
    let engine = env.engine(TestEnv::delivery_config())?;

    let fan_out = env.broker.publish(topic.id, None, b"{}".to_vec()).await?;
    env.drain(&engine).await?;

    let delivery_id = fan_out.deliveries[0].id;
    let delivery = env.delivery(delivery_id).await?;
    let attempts = env.attempts(delivery_id).await?;

    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(attempts.len(), 1);
    assert!(!attempts[0].success);
    assert_eq!(attempts[0].response_status_code, None);
    assert!(attempts[0].response.is_empty());
    let error = attempts[0].error.as_deref().context("timeout recorded without error")?;
    assert!(error.contains("timeout"), "unexpected error: {error}");
    let elapsed = attempts[0].execution_duration_ms;
    assert!((200..1000).contains(&elapsed), "attempt took {elapsed}ms for a 200ms budget");
    Invariants::check_delivery(&delivery, &attempts)?;
    Ok(())
}

#[tokio::test]
async fn refused_connection_is_a_failed_attempt() -> Result<()> {
    let env = TestEnv::new().await?;
    let port = http::unused_port()?;
    let topic = env.create_topic("orders").await?;
    env.create_subscription(
        SubscriptionBuilder::new(topic.id, format!("http://127.0.0.1:{port}/hook"))
            .max_attempts(2),
    )
    .await?;
    let engine = env.engine(TestEnv::delivery_config())?;

    let fan_out = env.broker.publish(topic.id, None, b"{}".to_vec()).await?;
    let delivery_id = fan_out.deliveries[0].id;
    let delivery = env.run_until_terminal(&engine, delivery_id, 5).await?;
    let attempts = env.attempts(delivery_id).await?;

    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|a| a.error.is_some() && a.response.is_empty()));
    Invariants::check_delivery(&delivery, &attempts)?;
    Ok(())
}

#[tokio::test]
async fn delivery_recovers_after_refused_connections() -> Result<()> {
    let env = TestEnv::new().await?;
    let port = http::unused_port()?;
    let topic = env.create_topic("orders").await?;
    env.create_subscription(
        SubscriptionBuilder::new(topic.id, format!("http://127.0.0.1:{port}/hook"))
            .max_attempts(3)
            .delay(Duration::from_secs(1)),
    )
    .await?;
    let engine = env.engine(TestEnv::delivery_config())?;

    let fan_out = env.broker.publish(topic.id, None, b"{}".to_vec()).await?;
    let delivery_id = fan_out.deliveries[0].id;

    for expected in 1..=2 {
        env.drain(&engine).await?;
        let delivery = env.delivery(delivery_id).await?;
        assert_eq!(delivery.status, DeliveryStatus::Pending);
        assert_eq!(delivery.attempt_count, expected);

        let now = courier_core::Clock::now_utc(&env.clock);
        let wait = (delivery.next_attempt_at - now).to_std().unwrap_or_default();
        env.advance_time(wait + Duration::from_millis(1));
    }

    let endpoint = http::start_on_port(port).await?;
    http::mock_status(&endpoint, "/hook", 200).await;

    let delivery = env.run_until_terminal(&engine, delivery_id, 3).await?;
    let attempts = env.attempts(delivery_id).await?;

    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempt_count, 3);
    let outcomes: Vec<_> = attempts.iter().map(|a| a.success).collect();
    assert_eq!(outcomes, vec![false, false, true]);
    for refused in &attempts[..2] {
        assert!(refused.error.is_some());
        assert!(refused.response.is_empty());
        assert_eq!(refused.response_status_code, None);
    }
    assert_eq!(attempts[2].response_status_code, Some(200));
    assert!(attempts[2].error.is_none());
    Invariants::check_delivery(&delivery, &attempts)?;
    Invariants::retry_spacing(&delivery, &attempts, &RetryPolicy::default())?;
    assert_eq!(http::received_on(&endpoint, "/hook").await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn failing_subscriber_does_not_hold_back_others() -> Result<()> {
    let env = TestEnv::new().await?;
    http::mock_status(&env.http_mock, "/ok", 204).await;
    http::mock_status(&env.http_mock, "/broken", 500).await;

    let topic = env.create_topic("orders").await?;
    let ok = env
        .create_subscription(SubscriptionBuilder::new(topic.id, env.webhook_url("/ok")).name("ok"))
        .await?;
    env.create_subscription(
        SubscriptionBuilder::new(topic.id, env.webhook_url("/broken")).name("broken"),
    )
    .await?;
    let engine = env.engine(TestEnv::delivery_config())?;

    let fan_out = env.broker.publish(topic.id, None, b"{}".to_vec()).await?;
    assert_eq!(env.drain(&engine).await?, 2);

    for delivery in &fan_out.deliveries {
        let delivery = env.delivery(delivery.id).await?;
        assert_eq!(delivery.attempt_count, 1);
        if delivery.subscription_id == ok.id {
            assert_eq!(delivery.status, DeliveryStatus::Success);
        } else {
            assert_eq!(delivery.status, DeliveryStatus::Pending);
            assert!(delivery.claim_token.is_none());
        }
    }
    Ok(())
}

#[tokio::test]
async fn receiver_can_verify_signature_and_payload() -> Result<()> {
    let env = TestEnv::new().await?;
    http::mock_status(&env.http_mock, "/hook", 200).await;
    let topic = topic_with_endpoint(&env, "/hook", 3).await?;
    let engine = env.engine(TestEnv::delivery_config())?;

    let payload = b"\x00binary\xffpayload".to_vec();
    let fan_out =
        env.broker.publish(topic.id, Some("application/octet-stream"), payload.clone()).await?;
    env.drain(&engine).await?;

    let requests = http::received_on(&env.http_mock, "/hook").await?;
    let envelope = http::verify_webhook(&requests[0], TEST_SECRET)?;
    assert_eq!(envelope.message_id, fan_out.message.id);
    assert_eq!(envelope.topic_id, topic.id);
    assert_eq!(envelope.content_type, "application/octet-stream");
    assert_eq!(envelope.decode_data()?, payload);

    assert!(http::verify_webhook(&requests[0], "another-secret").is_err());
    Ok(())
}

#[tokio::test]
async fn claim_failure_surfaces_and_recovers() -> Result<()> {
    let env = TestEnv::new().await?;
    http::mock_status(&env.http_mock, "/hook", 200).await;
    let topic = topic_with_endpoint(&env, "/hook", 3).await?;
    let engine = env.engine(TestEnv::delivery_config())?;
    let fan_out = env.broker.publish(topic.id, None, b"{}".to_vec()).await?;

    env.memory()?.fail_next_claims(1).await;
    let failed = engine.process_batch().await;
    assert!(matches!(failed, Err(DeliveryError::DatabaseError { .. })));
    assert_eq!(engine.stats().await.store_errors, 1);

    env.drain(&engine).await?;
    let delivery = env.delivery(fan_out.deliveries[0].id).await?;
    assert_eq!(delivery.status, DeliveryStatus::Success);
    Ok(())
}

#[tokio::test]
async fn transient_completion_failures_are_retried() -> Result<()> {
    let env = TestEnv::new().await?;
    http::mock_status(&env.http_mock, "/hook", 200).await;
    let topic = topic_with_endpoint(&env, "/hook", 3).await?;
    let engine = env.engine(TestEnv::delivery_config())?;
    let fan_out = env.broker.publish(topic.id, None, b"{}".to_vec()).await?;

    env.memory()?.fail_next_completions(2).await;
    env.drain(&engine).await?;

    let delivery_id = fan_out.deliveries[0].id;
    let delivery = env.delivery(delivery_id).await?;
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempt_count, 1);
    Invariants::check_delivery(&delivery, &env.attempts(delivery_id).await?)?;
    assert_eq!(http::received_on(&env.http_mock, "/hook").await?.len(), 1);
    assert_eq!(engine.stats().await.store_errors, 2);
    Ok(())
}

#[tokio::test]
async fn unrecorded_attempt_is_redelivered_after_lease_expiry() -> Result<()> {
    let env = TestEnv::new().await?;
    http::mock_status(&env.http_mock, "/hook", 200).await;
    let topic = topic_with_endpoint(&env, "/hook", 3).await?;
    let config = DeliveryConfig { max_completion_retries: 2, ..TestEnv::delivery_config() };
    let engine = env.engine(config)?;
    let fan_out = env.broker.publish(topic.id, None, b"{}".to_vec()).await?;
    let delivery_id = fan_out.deliveries[0].id;

    // First try plus both retries fail; the attempt is never recorded.
    env.memory()?.fail_next_completions(3).await;
    env.drain(&engine).await?;

    let stuck = env.delivery(delivery_id).await?;
    assert_eq!(stuck.status, DeliveryStatus::Pending);
    assert_eq!(stuck.attempt_count, 0);
    assert!(stuck.claim_token.is_some(), "lease is kept until it expires");
    assert_eq!(env.drain(&engine).await?, 0);

    // Attempt timeout (5s) plus lease grace (1s).
    env.advance_time(Duration::from_secs(7));
    env.drain(&engine).await?;

    let delivery = env.delivery(delivery_id).await?;
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempt_count, 1);
    Invariants::check_delivery(&delivery, &env.attempts(delivery_id).await?)?;
    assert_eq!(http::received_on(&env.http_mock, "/hook").await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn lost_claim_writes_nothing() -> Result<()> {
    let env = TestEnv::new().await?;
    http::mock_sequence(
        &env.http_mock,
        "/hook",
        &[MockResponse::Delayed(200, Duration::from_millis(300))],
    )
    .await;
    let topic = topic_with_endpoint(&env, "/hook", 3).await?;
    let engine = env.engine(TestEnv::delivery_config())?;
    let fan_out = env.broker.publish(topic.id, None, b"{}".to_vec()).await?;
    let delivery_id = fan_out.deliveries[0].id;

    let batch = engine.process_batch();
    let steal = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut stolen = env.delivery(delivery_id).await?;
        let manual_worker = format!("{}-manual", engine.instance_id());
        assert_eq!(stolen.claimed_by.as_deref(), Some(manual_worker.as_str()));
        stolen.claim_token = Some(uuid::Uuid::new_v4());
        stolen.claimed_by = Some("other-worker".to_string());
        env.memory()?.replace_delivery(stolen).await;
        anyhow::Ok(())
    };
    let (claimed, stolen) = tokio::join!(batch, steal);
    assert_eq!(claimed?, 1);
    stolen?;

    let delivery = env.delivery(delivery_id).await?;
    assert_eq!(delivery.attempt_count, 0);
    assert_eq!(delivery.claimed_by.as_deref(), Some("other-worker"));
    assert!(env.attempts(delivery_id).await?.is_empty());
    assert_eq!(engine.stats().await.lost_claims, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn started_engine_delivers_and_shuts_down() -> Result<()> {
    let env = TestEnv::new().await?;
    http::mock_status(&env.http_mock, "/hook", 200).await;
    let topic = topic_with_endpoint(&env, "/hook", 3).await?;

    // Idle workers sleep on the clock; a real one keeps leases from lapsing
    // while requests are in flight.
    let config = DeliveryConfig { worker_count: 2, ..TestEnv::delivery_config() };
    let mut engine = DeliveryEngine::new(env.storage.clone(), config, Arc::new(RealClock::new()))?;
    engine.start().await?;
    assert!(engine.is_running());
    assert_eq!(engine.stats().await.active_workers, 2);

    let mut published = Vec::new();
    for index in 0..5 {
        let payload = format!("{{\"n\":{index}}}").into_bytes();
        published.push(env.broker.publish(topic.id, None, payload).await?.deliveries[0].id);
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while engine.stats().await.successful_deliveries < 5 {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "deliveries not finished in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    engine.shutdown().await?;

    for id in published {
        let delivery = env.delivery(id).await?;
        assert_eq!(delivery.status, DeliveryStatus::Success);
        Invariants::check_delivery(&delivery, &env.attempts(id).await?)?;
    }
    Ok(())
}
