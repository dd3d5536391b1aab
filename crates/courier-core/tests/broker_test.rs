//! Broker API behavior over the in-memory store.

use std::time::Duration;

use anyhow::Result;
use courier_core::{
    Comparison, CoreError, DeliveryFilter, DeliveryStatus, ListOptions, MessageFilter,
    SubscriptionFilter, SubscriptionId, TopicFilter, TopicId, TopicParams, MAX_POLICY_DURATION,
};
use courier_testing::{fixtures::TEST_SECRET, Invariants, SubscriptionBuilder, TestEnv};
use proptest::prelude::*;

#[tokio::test]
async fn topic_lifecycle() -> Result<()> {
    let env = TestEnv::new().await?;

    let id = TopicId::new();
    let topic =
        env.broker.create_topic(TopicParams { id: Some(id), name: "orders".into() }).await?;
    assert_eq!(topic.id, id);

    let duplicate =
        env.broker.create_topic(TopicParams { id: Some(id), name: "other".into() }).await;
    assert!(matches!(duplicate, Err(CoreError::AlreadyExists(_))));

    env.advance_time(Duration::from_secs(5));
    let renamed = env.broker.update_topic(id, TopicParams::new("orders-v2")).await?;
    assert_eq!(renamed.name, "orders-v2");
    assert_eq!(renamed.created_at, topic.created_at);
    assert!(renamed.updated_at > topic.updated_at);

    let found = env.broker.find_topic(id).await?;
    assert_eq!(found.map(|t| t.name), Some("orders-v2".to_string()));

    env.broker.delete_topic(id).await?;
    assert!(env.broker.find_topic(id).await?.is_none());
    assert!(matches!(env.broker.delete_topic(id).await, Err(CoreError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn update_of_missing_entities_is_not_found() -> Result<()> {
    let env = TestEnv::new().await?;
    let topic = env.create_topic("orders").await?;

    let missing_topic = env.broker.update_topic(TopicId::new(), TopicParams::new("x")).await;
    assert!(matches!(missing_topic, Err(CoreError::NotFound(_))));

    let params = SubscriptionBuilder::new(topic.id, env.webhook_url("/hook")).build();
    let missing_subscription = env.broker.update_subscription(SubscriptionId::new(), params).await;
    assert!(matches!(missing_subscription, Err(CoreError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn invalid_subscription_writes_nothing() -> Result<()> {
    let env = TestEnv::new().await?;
    let topic = env.create_topic("orders").await?;

    let invalid = [
        SubscriptionBuilder::new(topic.id, "ftp://example.com/hook"),
        SubscriptionBuilder::new(topic.id, "not a url"),
        SubscriptionBuilder::new(topic.id, env.webhook_url("/hook")).max_attempts(0),
        SubscriptionBuilder::new(topic.id, env.webhook_url("/hook")).delay(Duration::ZERO),
        SubscriptionBuilder::new(topic.id, env.webhook_url("/hook")).timeout(Duration::ZERO),
        SubscriptionBuilder::new(topic.id, env.webhook_url("/hook")).secret(""),
        SubscriptionBuilder::new(topic.id, env.webhook_url("/hook")).name("  "),
    ];
    for builder in invalid {
        let result = env.broker.create_subscription(builder.build()).await;
        assert!(matches!(result, Err(CoreError::InvalidInput(_))), "accepted: {result:?}");
    }

    let orphan = SubscriptionBuilder::new(TopicId::new(), env.webhook_url("/hook")).build();
    let unknown_topic = env.broker.create_subscription(orphan).await;
    assert!(matches!(unknown_topic, Err(CoreError::NotFound(_))));

    let stored = env.broker.list_subscriptions(ListOptions::new()).await?;
    assert!(stored.is_empty());
    Ok(())
}

#[tokio::test]
async fn oversized_policy_durations_are_rejected() -> Result<()> {
    let env = TestEnv::new().await?;
    let topic = env.create_topic("orders").await?;
    let healthy =
        env.create_subscription(SubscriptionBuilder::new(topic.id, env.webhook_url("/ok"))).await?;

    let endless = Duration::from_secs(u64::MAX / 1000);
    let oversized = [
        SubscriptionBuilder::new(topic.id, env.webhook_url("/slow")).timeout(endless),
        SubscriptionBuilder::new(topic.id, env.webhook_url("/slow"))
            .timeout(MAX_POLICY_DURATION + Duration::from_secs(1)),
        SubscriptionBuilder::new(topic.id, env.webhook_url("/slow")).delay(endless),
    ];
    for builder in oversized {
        let result = env.broker.create_subscription(builder.build()).await;
        assert!(matches!(result, Err(CoreError::InvalidInput(_))), "accepted: {result:?}");
    }

    let update = env
        .broker
        .update_subscription(
            healthy.id,
            SubscriptionBuilder::new(topic.id, env.webhook_url("/ok")).timeout(endless).build(),
        )
        .await;
    assert!(matches!(update, Err(CoreError::InvalidInput(_))));
    let unchanged = env.broker.find_subscription(healthy.id).await?;
    assert_eq!(
        unchanged.map(|s| s.delivery_attempt_timeout_ms),
        Some(healthy.delivery_attempt_timeout_ms)
    );

    let fan_out = env.broker.publish(topic.id, None, b"{}".to_vec()).await?;
    assert_eq!(fan_out.deliveries.len(), 1);
    assert_eq!(fan_out.deliveries[0].subscription_id, healthy.id);
    Ok(())
}

#[tokio::test]
async fn subscription_update_does_not_touch_scheduled_deliveries() -> Result<()> {
    let env = TestEnv::new().await?;
    let topic = env.create_topic("orders").await?;
    let builder = SubscriptionBuilder::new(topic.id, env.webhook_url("/a")).max_attempts(3);
    let subscription = env.create_subscription(builder).await?;

    let fan_out = env.broker.publish(topic.id, None, b"{}".to_vec()).await?;

    env.broker
        .update_subscription(
            subscription.id,
            SubscriptionBuilder::new(topic.id, env.webhook_url("/b")).max_attempts(9).build(),
        )
        .await?;

    let delivery = env.delivery(fan_out.deliveries[0].id).await?;
    assert_eq!(delivery.url, env.webhook_url("/a"));
    assert_eq!(delivery.max_delivery_attempts, 3);
    Ok(())
}

#[tokio::test]
async fn publish_fans_out_to_every_subscription() -> Result<()> {
    let env = TestEnv::new().await?;
    let topic = env.create_topic("orders").await?;
    let other = env.create_topic("invoices").await?;

    let mut subscriptions = Vec::new();
    for (index, attempts) in [1, 3, 5].into_iter().enumerate() {
        let url = env.webhook_url(&format!("/hook/{index}"));
        let builder = SubscriptionBuilder::new(topic.id, url)
            .name(format!("sub-{index}"))
            .max_attempts(attempts);
        subscriptions.push(env.create_subscription(builder).await?);
        env.advance_time(Duration::from_millis(10));
    }
    env.create_subscription(SubscriptionBuilder::new(other.id, env.webhook_url("/other"))).await?;

    let fan_out = env.broker.publish(topic.id, Some("text/plain"), b"hello".to_vec()).await?;

    Invariants::fan_out_complete(&fan_out, &subscriptions)?;
    assert_eq!(fan_out.message.content_type, "text/plain");
    for delivery in &fan_out.deliveries {
        assert_eq!(delivery.next_attempt_at, fan_out.message.created_at);
    }

    let listed = env
        .broker
        .list_deliveries(ListOptions::new().filter(DeliveryFilter::MessageId(fan_out.message.id)))
        .await?;
    assert_eq!(listed.len(), 3);
    Ok(())
}

#[tokio::test]
async fn publish_without_subscriptions_stores_message_only() -> Result<()> {
    let env = TestEnv::new().await?;
    let topic = env.create_topic("quiet").await?;

    let fan_out = env.broker.publish(topic.id, None, b"{}".to_vec()).await?;

    assert!(fan_out.deliveries.is_empty());
    assert_eq!(fan_out.message.content_type, "application/json");
    assert!(env.broker.find_message(fan_out.message.id).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn publish_to_missing_topic_writes_nothing() -> Result<()> {
    let env = TestEnv::new().await?;

    let result = env.broker.publish(TopicId::new(), None, b"{}".to_vec()).await;
    assert!(matches!(result, Err(CoreError::NotFound(_))));

    let blank = env.create_topic("t").await?;
    let result = env.broker.publish(blank.id, Some(" "), b"{}".to_vec()).await;
    assert!(matches!(result, Err(CoreError::InvalidInput(_))));

    assert!(env.broker.list_messages(ListOptions::new()).await?.is_empty());
    assert!(env.broker.list_deliveries(ListOptions::new()).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn deleting_configuration_keeps_history() -> Result<()> {
    let env = TestEnv::new().await?;
    let topic = env.create_topic("orders").await?;
    let builder = SubscriptionBuilder::new(topic.id, env.webhook_url("/hook"));
    let subscription = env.create_subscription(builder).await?;
    let fan_out = env.broker.publish(topic.id, None, b"{}".to_vec()).await?;

    env.broker.delete_topic(topic.id).await?;

    assert!(env.broker.find_subscription(subscription.id).await?.is_none());
    assert!(env.broker.find_message(fan_out.message.id).await?.is_some());
    let delivery = env.delivery(fan_out.deliveries[0].id).await?;
    assert_eq!(delivery.status, DeliveryStatus::Pending);
    assert_eq!(delivery.secret_token, TEST_SECRET);
    Ok(())
}

#[tokio::test]
async fn list_filters_select_matching_rows() -> Result<()> {
    let env = TestEnv::new().await?;
    let orders = env.create_topic("orders").await?;
    let start = orders.created_at;
    env.advance_time(Duration::from_secs(1));
    let invoices = env.create_topic("invoices").await?;

    let by_name = env
        .broker
        .list_topics(ListOptions::new().filter(TopicFilter::Name("invoices".into())))
        .await?;
    assert_eq!(by_name.iter().map(|t| t.id).collect::<Vec<_>>(), vec![invoices.id]);

    let after_start = env
        .broker
        .list_topics(ListOptions::new().filter(TopicFilter::CreatedAt(Comparison::Gt, start)))
        .await?;
    assert_eq!(after_start.len(), 1);

    env.create_subscription(SubscriptionBuilder::new(orders.id, env.webhook_url("/o"))).await?;
    env.create_subscription(SubscriptionBuilder::new(invoices.id, env.webhook_url("/i"))).await?;
    let of_orders = env
        .broker
        .list_subscriptions(ListOptions::new().filter(SubscriptionFilter::TopicId(orders.id)))
        .await?;
    assert_eq!(of_orders.len(), 1);
    assert_eq!(of_orders[0].topic_id, orders.id);

    env.broker.publish(orders.id, None, b"1".to_vec()).await?;
    env.broker.publish(invoices.id, None, b"2".to_vec()).await?;
    let invoice_messages = env
        .broker
        .list_messages(ListOptions::new().filter(MessageFilter::TopicId(invoices.id)))
        .await?;
    assert_eq!(invoice_messages.len(), 1);
    assert_eq!(invoice_messages[0].payload, b"2");
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn pagination_windows_are_deterministic(
        count in 0usize..30,
        limit in -5i64..40,
        offset in -5i64..40,
    ) {
        let runtime =
            tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let env = TestEnv::new().await.unwrap();
            let mut created = Vec::new();
            for index in 0..count {
                created.push(env.create_topic(&format!("topic-{index}")).await.unwrap().id);
                env.advance_time(Duration::from_millis(1));
            }

            let options = ListOptions::<TopicFilter>::new().limit(limit).offset(offset);
            let page: Vec<_> = env
                .broker
                .list_topics(options.clone())
                .await
                .unwrap()
                .into_iter()
                .map(|t| t.id)
                .collect();

            let skip = usize::try_from(options.effective_offset()).unwrap();
            let take = usize::try_from(options.effective_limit()).unwrap();
            let expected: Vec<_> = created.iter().copied().skip(skip).take(take).collect();
            assert_eq!(page, expected);
        });
    }
}
