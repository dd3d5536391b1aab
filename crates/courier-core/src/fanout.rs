//! Fan-out planning.
//!
//! Turns a freshly published message and the subscriptions of its topic into
//! the delivery rows to insert. Persistence, and the transaction that makes
//! the message and its deliveries visible together, live in the storage
//! backends; this module only decides what to write.

use chrono::{DateTime, Utc};

use crate::models::{Delivery, Message, Subscription};

/// Plans one pending delivery per subscription bound to the message's topic.
///
/// Subscriptions of other topics are ignored. Every delivery copies the
/// subscription's policy fields verbatim and is due at `now`.
pub fn plan_deliveries(
    message: &Message,
    subscriptions: &[Subscription],
    now: DateTime<Utc>,
) -> Vec<Delivery> {
    subscriptions
        .iter()
        .filter(|subscription| subscription.topic_id == message.topic_id)
        .map(|subscription| Delivery::for_subscription(message, subscription, now))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::models::{DeliveryStatus, MessageId, SubscriptionId, TopicId};

    fn message(topic_id: TopicId, now: DateTime<Utc>) -> Message {
        Message {
            id: MessageId::new(),
            topic_id,
            content_type: "application/json".to_string(),
            payload: br#"{"order":42}"#.to_vec(),
            created_at: now,
            updated_at: now,
        }
    }

    fn subscription(topic_id: TopicId, attempts: i32, now: DateTime<Utc>) -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            topic_id,
            name: format!("sub-{attempts}"),
            url: format!("https://receiver.test/{attempts}"),
            secret_token: format!("secret-{attempts}"),
            max_delivery_attempts: attempts,
            delivery_attempt_delay_ms: i64::from(attempts) * 100,
            delivery_attempt_timeout_ms: 2_000,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn one_pending_delivery_per_subscription() {
        let now = Utc::now();
        let topic = TopicId::new();
        let msg = message(topic, now);
        let subs: Vec<_> = (1..=4).map(|n| subscription(topic, n, now)).collect();

        let deliveries = plan_deliveries(&msg, &subs, now);

        assert_eq!(deliveries.len(), 4);
        let targets: HashSet<_> = deliveries.iter().map(|d| d.subscription_id).collect();
        assert_eq!(targets.len(), 4);
        for delivery in &deliveries {
            assert_eq!(delivery.message_id, msg.id);
            assert_eq!(delivery.status, DeliveryStatus::Pending);
            assert_eq!(delivery.attempt_count, 0);
            assert_eq!(delivery.next_attempt_at, now);
        }
    }

    #[test]
    fn policy_fields_are_copied_verbatim() {
        let now = Utc::now();
        let topic = TopicId::new();
        let msg = message(topic, now);
        let sub = subscription(topic, 7, now);

        let deliveries = plan_deliveries(&msg, std::slice::from_ref(&sub), now);
        let delivery = &deliveries[0];

        assert_eq!(delivery.url, sub.url);
        assert_eq!(delivery.secret_token, sub.secret_token);
        assert_eq!(delivery.max_delivery_attempts, sub.max_delivery_attempts);
        assert_eq!(delivery.delivery_attempt_delay_ms, sub.delivery_attempt_delay_ms);
        assert_eq!(delivery.delivery_attempt_timeout_ms, sub.delivery_attempt_timeout_ms);
    }

    #[test]
    fn zero_subscriptions_plan_zero_deliveries() {
        let now = Utc::now();
        let msg = message(TopicId::new(), now);

        assert!(plan_deliveries(&msg, &[], now).is_empty());
    }

    #[test]
    fn subscriptions_of_other_topics_are_skipped() {
        let now = Utc::now();
        let topic = TopicId::new();
        let msg = message(topic, now);
        let subs = vec![subscription(topic, 1, now), subscription(TopicId::new(), 2, now)];

        let deliveries = plan_deliveries(&msg, &subs, now);

        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].subscription_id, subs[0].id);
    }
}
