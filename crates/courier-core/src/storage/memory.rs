//! In-process `BrokerStorage` backend.
//!
//! All state sits behind one mutex, so every operation is atomic with
//! respect to every other. Claim and completion failures can be injected to
//! exercise the engine's error handling without a database.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BrokerStorage, ClaimRequest, Completion, FanOut, StorageFuture};
use crate::{
    error::{CoreError, Result},
    fanout,
    filter::{
        DeliveryAttemptFilter, DeliveryFilter, ListOptions, MessageFilter, SubscriptionFilter,
        TopicFilter,
    },
    models::{
        duration_to_millis, ClaimedDelivery, Delivery, DeliveryAttempt, DeliveryAttemptId,
        DeliveryId, DeliveryStatus, Message, MessageId, Subscription, SubscriptionId, Topic,
        TopicId,
    },
};

#[derive(Default)]
struct State {
    topics: HashMap<TopicId, Topic>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    messages: HashMap<MessageId, Message>,
    deliveries: HashMap<DeliveryId, Delivery>,
    attempts: HashMap<DeliveryAttemptId, DeliveryAttempt>,
    failing_claims: usize,
    failing_completions: usize,
}

/// Broker storage held entirely in memory.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls to `claim_due` fail with a database
    /// error.
    pub async fn fail_next_claims(&self, count: usize) {
        self.state.lock().await.failing_claims = count;
    }

    /// Makes the next `count` calls to `complete_attempt` fail with a
    /// database error, writing nothing.
    pub async fn fail_next_completions(&self, count: usize) {
        self.state.lock().await.failing_completions = count;
    }

    /// Overwrites a stored delivery.
    ///
    /// Lets tests put a delivery into states that are otherwise reached only
    /// through elapsed time or crashed workers.
    pub async fn replace_delivery(&self, delivery: Delivery) {
        self.state.lock().await.deliveries.insert(delivery.id, delivery);
    }

    /// Returns every stored delivery attempt, ordered by creation.
    pub async fn all_attempts(&self) -> Vec<DeliveryAttempt> {
        let state = self.state.lock().await;
        let mut attempts: Vec<_> = state.attempts.values().cloned().collect();
        attempts.sort_by_key(|a| (a.created_at, a.delivery_id, a.attempt_number));
        attempts
    }
}

fn injected_failure(counter: &mut usize, operation: &str) -> Result<()> {
    if *counter > 0 {
        *counter -= 1;
        return Err(CoreError::Database(format!("injected {operation} failure")));
    }
    Ok(())
}

/// Saturates at the end of time rather than overflowing.
fn lease_expiry(delivery: &Delivery, request: &ClaimRequest) -> DateTime<Utc> {
    let lease_ms = delivery
        .delivery_attempt_timeout_ms
        .saturating_add(duration_to_millis(request.lease_grace));
    chrono::Duration::try_milliseconds(lease_ms)
        .and_then(|lease| request.now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl BrokerStorage for MemoryStorage {
    fn create_topic(&self, topic: Topic) -> StorageFuture<'_, Topic> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.topics.contains_key(&topic.id) {
                return Err(CoreError::already_exists("topic", topic.id));
            }
            state.topics.insert(topic.id, topic.clone());
            Ok(topic)
        })
    }

    fn update_topic(&self, topic: Topic) -> StorageFuture<'_, Topic> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let stored = state
                .topics
                .get_mut(&topic.id)
                .ok_or_else(|| CoreError::not_found("topic", topic.id))?;
            stored.name = topic.name;
            stored.updated_at = topic.updated_at;
            Ok(stored.clone())
        })
    }

    fn delete_topic(&self, id: TopicId) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.topics.remove(&id).is_none() {
                return Err(CoreError::not_found("topic", id));
            }
            state.subscriptions.retain(|_, subscription| subscription.topic_id != id);
            Ok(())
        })
    }

    fn find_topic(&self, id: TopicId) -> StorageFuture<'_, Option<Topic>> {
        Box::pin(async move { Ok(self.state.lock().await.topics.get(&id).cloned()) })
    }

    fn list_topics(&self, options: ListOptions<TopicFilter>) -> StorageFuture<'_, Vec<Topic>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(options.apply(state.topics.values(), |t: &Topic| (t.created_at, t.id)))
        })
    }

    fn create_subscription(
        &self,
        subscription: Subscription,
    ) -> StorageFuture<'_, Subscription> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.subscriptions.contains_key(&subscription.id) {
                return Err(CoreError::already_exists("subscription", subscription.id));
            }
            if !state.topics.contains_key(&subscription.topic_id) {
                return Err(CoreError::not_found("topic", subscription.topic_id));
            }
            state.subscriptions.insert(subscription.id, subscription.clone());
            Ok(subscription)
        })
    }

    fn update_subscription(
        &self,
        subscription: Subscription,
    ) -> StorageFuture<'_, Subscription> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.topics.contains_key(&subscription.topic_id) {
                return Err(CoreError::not_found("topic", subscription.topic_id));
            }
            let stored = state
                .subscriptions
                .get_mut(&subscription.id)
                .ok_or_else(|| CoreError::not_found("subscription", subscription.id))?;
            let created_at = stored.created_at;
            *stored = Subscription { created_at, ..subscription };
            Ok(stored.clone())
        })
    }

    fn delete_subscription(&self, id: SubscriptionId) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state
                .subscriptions
                .remove(&id)
                .map(|_| ())
                .ok_or_else(|| CoreError::not_found("subscription", id))
        })
    }

    fn find_subscription(&self, id: SubscriptionId) -> StorageFuture<'_, Option<Subscription>> {
        Box::pin(async move { Ok(self.state.lock().await.subscriptions.get(&id).cloned()) })
    }

    fn list_subscriptions(
        &self,
        options: ListOptions<SubscriptionFilter>,
    ) -> StorageFuture<'_, Vec<Subscription>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(options.apply(state.subscriptions.values(), |s: &Subscription| (s.created_at, s.id)))
        })
    }

    fn publish(&self, message: Message, now: DateTime<Utc>) -> StorageFuture<'_, FanOut> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.topics.contains_key(&message.topic_id) {
                return Err(CoreError::not_found("topic", message.topic_id));
            }
            if state.messages.contains_key(&message.id) {
                return Err(CoreError::already_exists("message", message.id));
            }

            let mut subscriptions: Vec<Subscription> = state
                .subscriptions
                .values()
                .filter(|s| s.topic_id == message.topic_id)
                .cloned()
                .collect();
            subscriptions.sort_by_key(|s| (s.created_at, s.id));

            let deliveries = fanout::plan_deliveries(&message, &subscriptions, now);

            state.messages.insert(message.id, message.clone());
            for delivery in &deliveries {
                state.deliveries.insert(delivery.id, delivery.clone());
            }
            Ok(FanOut { message, deliveries })
        })
    }

    fn find_message(&self, id: MessageId) -> StorageFuture<'_, Option<Message>> {
        Box::pin(async move { Ok(self.state.lock().await.messages.get(&id).cloned()) })
    }

    fn list_messages(
        &self,
        options: ListOptions<MessageFilter>,
    ) -> StorageFuture<'_, Vec<Message>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(options.apply(state.messages.values(), |m: &Message| (m.created_at, m.id)))
        })
    }

    fn find_delivery(&self, id: DeliveryId) -> StorageFuture<'_, Option<Delivery>> {
        Box::pin(async move { Ok(self.state.lock().await.deliveries.get(&id).cloned()) })
    }

    fn list_deliveries(
        &self,
        options: ListOptions<DeliveryFilter>,
    ) -> StorageFuture<'_, Vec<Delivery>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(options.apply(state.deliveries.values(), |d: &Delivery| (d.created_at, d.id)))
        })
    }

    fn find_delivery_attempt(
        &self,
        id: DeliveryAttemptId,
    ) -> StorageFuture<'_, Option<DeliveryAttempt>> {
        Box::pin(async move { Ok(self.state.lock().await.attempts.get(&id).cloned()) })
    }

    fn list_delivery_attempts(
        &self,
        options: ListOptions<DeliveryAttemptFilter>,
    ) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(options.apply(state.attempts.values(), |a: &DeliveryAttempt| (a.created_at, a.id)))
        })
    }

    fn claim_due(&self, request: ClaimRequest) -> StorageFuture<'_, Vec<ClaimedDelivery>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            injected_failure(&mut state.failing_claims, "claim")?;

            let mut due: Vec<(DateTime<Utc>, DeliveryId)> = state
                .deliveries
                .values()
                .filter(|d| d.is_claimable(request.now))
                .map(|d| (d.next_attempt_at, d.id))
                .collect();
            due.sort_unstable();
            due.truncate(request.limit);

            let claim_token = Uuid::new_v4();
            let mut claimed = Vec::with_capacity(due.len());
            for (_, id) in due {
                let Some(delivery) = state.deliveries.get_mut(&id) else { continue };
                delivery.claimed_by = Some(request.worker_id.clone());
                delivery.claim_token = Some(claim_token);
                delivery.claim_expires_at = Some(lease_expiry(delivery, &request));
                delivery.updated_at = request.now;
                let delivery = delivery.clone();

                if let Some(message) = state.messages.get(&delivery.message_id) {
                    claimed.push(ClaimedDelivery { message: message.clone(), delivery });
                }
            }
            Ok(claimed)
        })
    }

    fn complete_attempt(&self, completion: Completion) -> StorageFuture<'_, Delivery> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            injected_failure(&mut state.failing_completions, "completion")?;

            let Completion { delivery_id, claim_token, mut attempt, transition, completed_at } =
                completion;

            let delivery = state
                .deliveries
                .get_mut(&delivery_id)
                .filter(|d| {
                    d.claim_token == Some(claim_token)
                        && d.status == DeliveryStatus::Pending
                        && d.attempt_count < d.max_delivery_attempts
                })
                .ok_or_else(|| CoreError::ClaimLost(format!("delivery {delivery_id}")))?;

            delivery.status = transition.status();
            delivery.attempt_count += 1;
            if let Some(next_attempt_at) = transition.next_attempt_at() {
                delivery.next_attempt_at = next_attempt_at;
            }
            delivery.claimed_by = None;
            delivery.claim_token = None;
            delivery.claim_expires_at = None;
            delivery.updated_at = completed_at;
            let delivery = delivery.clone();

            attempt.delivery_id = delivery.id;
            attempt.attempt_number = delivery.attempt_count;
            state.attempts.insert(attempt.id, attempt);
            Ok(delivery)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::DeliveryTransition;

    async fn seeded(store: &MemoryStorage, subscribers: usize) -> FanOut {
        let now = Utc::now();
        let topic =
            Topic { id: TopicId::new(), name: "orders".into(), created_at: now, updated_at: now };
        store.create_topic(topic.clone()).await.unwrap();
        for n in 0..subscribers {
            store
                .create_subscription(Subscription {
                    id: SubscriptionId::new(),
                    topic_id: topic.id,
                    name: format!("sub-{n}"),
                    url: format!("http://127.0.0.1:9/{n}"),
                    secret_token: "secret".into(),
                    max_delivery_attempts: 2,
                    delivery_attempt_delay_ms: 10,
                    delivery_attempt_timeout_ms: 1_000,
                    created_at: now,
                    updated_at: now,
                })
                .await
                .unwrap();
        }
        let message = Message {
            id: MessageId::new(),
            topic_id: topic.id,
            content_type: "application/json".into(),
            payload: b"{}".to_vec(),
            created_at: now,
            updated_at: now,
        };
        store.publish(message, now).await.unwrap()
    }

    fn claim(worker: &str, now: DateTime<Utc>) -> ClaimRequest {
        ClaimRequest {
            worker_id: worker.into(),
            now,
            limit: 10,
            lease_grace: Duration::from_secs(5),
        }
    }

    fn attempt_for(delivery: &Delivery, now: DateTime<Utc>) -> DeliveryAttempt {
        DeliveryAttempt {
            id: DeliveryAttemptId::new(),
            delivery_id: delivery.id,
            attempt_number: 0,
            request: "POST / HTTP/1.1".into(),
            response: String::new(),
            response_status_code: None,
            execution_duration_ms: 3,
            success: false,
            error: Some("connection refused".into()),
            created_at: now,
        }
    }

    #[tokio::test]
    async fn second_claim_sees_nothing_while_lease_is_live() {
        let store = MemoryStorage::new();
        let fan_out = seeded(&store, 3).await;
        let now = Utc::now();

        let first = store.claim_due(claim("w-1", now)).await.unwrap();
        let second = store.claim_due(claim("w-2", now)).await.unwrap();

        assert_eq!(first.len(), fan_out.deliveries.len());
        assert!(second.is_empty());
        assert!(first.iter().all(|c| c.delivery.claimed_by.as_deref() == Some("w-1")));
    }

    #[tokio::test]
    async fn expired_lease_can_be_reclaimed_and_old_token_is_rejected() {
        let store = MemoryStorage::new();
        seeded(&store, 1).await;
        let now = Utc::now();

        let first = store.claim_due(claim("w-1", now)).await.unwrap().remove(0);
        let later = now + chrono::Duration::seconds(7);
        let second = store.claim_due(claim("w-2", later)).await.unwrap().remove(0);
        assert_eq!(first.delivery.id, second.delivery.id);

        let stale = Completion {
            delivery_id: first.delivery.id,
            claim_token: first.claim_token().unwrap(),
            attempt: attempt_for(&first.delivery, later),
            transition: DeliveryTransition::Succeeded,
            completed_at: later,
        };
        let err = store.complete_attempt(stale).await.unwrap_err();
        assert!(matches!(err, CoreError::ClaimLost(_)));
        assert!(store.all_attempts().await.is_empty());
    }

    #[tokio::test]
    async fn completion_numbers_attempts_and_clears_lease() {
        let store = MemoryStorage::new();
        seeded(&store, 1).await;
        let now = Utc::now();

        let claimed = store.claim_due(claim("w-1", now)).await.unwrap().remove(0);
        let retry_at = now + chrono::Duration::milliseconds(10);
        let delivery = store
            .complete_attempt(Completion {
                delivery_id: claimed.delivery.id,
                claim_token: claimed.claim_token().unwrap(),
                attempt: attempt_for(&claimed.delivery, now),
                transition: DeliveryTransition::Retry { next_attempt_at: retry_at },
                completed_at: now,
            })
            .await
            .unwrap();

        assert_eq!(delivery.status, DeliveryStatus::Pending);
        assert_eq!(delivery.attempt_count, 1);
        assert_eq!(delivery.next_attempt_at, retry_at);
        assert!(delivery.claim_token.is_none());
        assert_eq!(store.all_attempts().await[0].attempt_number, 1);
    }

    #[tokio::test]
    async fn unbounded_lease_saturates_without_blocking_siblings() {
        let store = MemoryStorage::new();
        let fan_out = seeded(&store, 2).await;
        let mut stuck = fan_out.deliveries[0].clone();
        stuck.delivery_attempt_timeout_ms = i64::MAX;
        store.replace_delivery(stuck.clone()).await;

        let claimed = store.claim_due(claim("w-1", Utc::now())).await.unwrap();

        assert_eq!(claimed.len(), 2);
        let lease_of = |id: DeliveryId| {
            claimed.iter().find(|c| c.delivery.id == id).and_then(|c| c.delivery.claim_expires_at)
        };
        assert_eq!(lease_of(stuck.id), Some(DateTime::<Utc>::MAX_UTC));
        assert!(lease_of(fan_out.deliveries[1].id) < Some(DateTime::<Utc>::MAX_UTC));
    }

    #[tokio::test]
    async fn injected_claim_failures_are_consumed() {
        let store = MemoryStorage::new();
        seeded(&store, 1).await;
        store.fail_next_claims(1).await;

        let err = store.claim_due(claim("w-1", Utc::now())).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.claim_due(claim("w-1", Utc::now())).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_topic_removes_subscriptions_but_keeps_history() {
        let store = MemoryStorage::new();
        let fan_out = seeded(&store, 2).await;

        store.delete_topic(fan_out.message.topic_id).await.unwrap();

        assert!(store.list_subscriptions(ListOptions::new()).await.unwrap().is_empty());
        assert!(store.find_message(fan_out.message.id).await.unwrap().is_some());
        assert_eq!(store.list_deliveries(ListOptions::new()).await.unwrap().len(), 2);
    }
}
