//! `BrokerStorage` over the PostgreSQL repositories.
//!
//! Multi-row operations run in one transaction that commits only after every
//! statement succeeded; an early return drops the transaction and rolls it
//! back.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BrokerStorage, ClaimRequest, Completion, FanOut, Storage, StorageFuture};
use crate::{
    error::CoreError,
    fanout,
    filter::{
        DeliveryAttemptFilter, DeliveryFilter, ListOptions, MessageFilter, SubscriptionFilter,
        TopicFilter,
    },
    models::{
        ClaimedDelivery, Delivery, DeliveryAttempt, DeliveryAttemptId, DeliveryId, Message,
        MessageId, Subscription, SubscriptionId, Topic, TopicId,
    },
};

impl BrokerStorage for Storage {
    fn create_topic(&self, topic: Topic) -> StorageFuture<'_, Topic> {
        Box::pin(async move { self.topics.create(&topic).await })
    }

    fn update_topic(&self, topic: Topic) -> StorageFuture<'_, Topic> {
        Box::pin(async move { self.topics.update(&topic).await })
    }

    fn delete_topic(&self, id: TopicId) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.topics.delete(id).await })
    }

    fn find_topic(&self, id: TopicId) -> StorageFuture<'_, Option<Topic>> {
        Box::pin(async move { self.topics.find_by_id(id).await })
    }

    fn list_topics(&self, options: ListOptions<TopicFilter>) -> StorageFuture<'_, Vec<Topic>> {
        Box::pin(async move { self.topics.list(&options).await })
    }

    fn create_subscription(
        &self,
        subscription: Subscription,
    ) -> StorageFuture<'_, Subscription> {
        Box::pin(async move { self.subscriptions.create(&subscription).await })
    }

    fn update_subscription(
        &self,
        subscription: Subscription,
    ) -> StorageFuture<'_, Subscription> {
        Box::pin(async move { self.subscriptions.update(&subscription).await })
    }

    fn delete_subscription(&self, id: SubscriptionId) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.subscriptions.delete(id).await })
    }

    fn find_subscription(&self, id: SubscriptionId) -> StorageFuture<'_, Option<Subscription>> {
        Box::pin(async move { self.subscriptions.find_by_id(id).await })
    }

    fn list_subscriptions(
        &self,
        options: ListOptions<SubscriptionFilter>,
    ) -> StorageFuture<'_, Vec<Subscription>> {
        Box::pin(async move { self.subscriptions.list(&options).await })
    }

    fn publish(&self, message: Message, now: DateTime<Utc>) -> StorageFuture<'_, FanOut> {
        Box::pin(async move {
            let mut tx = self.begin().await?;

            // Holds off a concurrent topic delete until the fan-out commits.
            self.topics.lock_for_share_in_tx(&mut tx, message.topic_id).await?;

            let message = self.messages.create_in_tx(&mut tx, &message).await?;
            let subscriptions =
                self.subscriptions.find_by_topic_in_tx(&mut tx, message.topic_id).await?;
            let deliveries = fanout::plan_deliveries(&message, &subscriptions, now);
            self.deliveries.create_many_in_tx(&mut tx, &deliveries).await?;

            tx.commit().await?;

            debug!(
                message_id = %message.id,
                topic_id = %message.topic_id,
                deliveries = deliveries.len(),
                "message fanned out"
            );
            Ok(FanOut { message, deliveries })
        })
    }

    fn find_message(&self, id: MessageId) -> StorageFuture<'_, Option<Message>> {
        Box::pin(async move { self.messages.find_by_id(id).await })
    }

    fn list_messages(
        &self,
        options: ListOptions<MessageFilter>,
    ) -> StorageFuture<'_, Vec<Message>> {
        Box::pin(async move { self.messages.list(&options).await })
    }

    fn find_delivery(&self, id: DeliveryId) -> StorageFuture<'_, Option<Delivery>> {
        Box::pin(async move { self.deliveries.find_by_id(id).await })
    }

    fn list_deliveries(
        &self,
        options: ListOptions<DeliveryFilter>,
    ) -> StorageFuture<'_, Vec<Delivery>> {
        Box::pin(async move { self.deliveries.list(&options).await })
    }

    fn find_delivery_attempt(
        &self,
        id: DeliveryAttemptId,
    ) -> StorageFuture<'_, Option<DeliveryAttempt>> {
        Box::pin(async move { self.delivery_attempts.find_by_id(id).await })
    }

    fn list_delivery_attempts(
        &self,
        options: ListOptions<DeliveryAttemptFilter>,
    ) -> StorageFuture<'_, Vec<DeliveryAttempt>> {
        Box::pin(async move { self.delivery_attempts.list(&options).await })
    }

    fn claim_due(&self, request: ClaimRequest) -> StorageFuture<'_, Vec<ClaimedDelivery>> {
        Box::pin(async move {
            if request.limit == 0 {
                return Ok(Vec::new());
            }

            let mut tx = self.begin().await?;
            let deliveries =
                self.deliveries.claim_due_in_tx(&mut tx, &request, Uuid::new_v4()).await?;

            let mut message_ids: Vec<MessageId> = deliveries.iter().map(|d| d.message_id).collect();
            message_ids.sort_unstable();
            message_ids.dedup();
            let messages: HashMap<MessageId, Message> = self
                .messages
                .find_by_ids_in_tx(&mut tx, &message_ids)
                .await?
                .into_iter()
                .map(|message| (message.id, message))
                .collect();

            tx.commit().await?;

            let claimed = deliveries
                .into_iter()
                .filter_map(|delivery| match messages.get(&delivery.message_id) {
                    Some(message) => Some(ClaimedDelivery { message: message.clone(), delivery }),
                    None => {
                        warn!(
                            delivery_id = %delivery.id,
                            message_id = %delivery.message_id,
                            "claimed delivery references a missing message"
                        );
                        None
                    },
                })
                .collect();
            Ok(claimed)
        })
    }

    fn complete_attempt(&self, completion: Completion) -> StorageFuture<'_, Delivery> {
        Box::pin(async move {
            let Completion { delivery_id, claim_token, mut attempt, transition, completed_at } =
                completion;

            let mut tx = self.begin().await?;
            let delivery = self
                .deliveries
                .complete_in_tx(&mut tx, delivery_id, claim_token, &transition, completed_at)
                .await?
                .ok_or_else(|| CoreError::ClaimLost(format!("delivery {delivery_id}")))?;

            attempt.delivery_id = delivery.id;
            attempt.attempt_number = delivery.attempt_count;
            self.delivery_attempts.create_in_tx(&mut tx, &attempt).await?;

            tx.commit().await?;
            Ok(delivery)
        })
    }
}
