//! Invariant checks for delivery guarantees.
//!
//! Each check inspects stored state and fails with a description of the
//! first violation found.

use std::collections::HashSet;

use anyhow::{ensure, Result};
use courier_core::{Delivery, DeliveryAttempt, DeliveryStatus, FanOut, Subscription};
use courier_delivery::RetryPolicy;

/// Core delivery invariants that must always hold.
pub struct Invariants;

impl Invariants {
    /// Every delivery has exactly as many attempt rows as its attempt
    /// count, numbered `1..=attempt_count`, and never more than its budget.
    pub fn attempts_accounted(delivery: &Delivery, attempts: &[DeliveryAttempt]) -> Result<()> {
        ensure!(
            delivery.attempt_count <= delivery.max_delivery_attempts,
            "delivery {} used {} attempts of {}",
            delivery.id,
            delivery.attempt_count,
            delivery.max_delivery_attempts
        );
        ensure!(
            attempts.len() == usize::try_from(delivery.attempt_count).unwrap_or(usize::MAX),
            "delivery {} has attempt_count {} but {} attempt rows",
            delivery.id,
            delivery.attempt_count,
            attempts.len()
        );

        let mut numbers: Vec<i32> = attempts.iter().map(|a| a.attempt_number).collect();
        numbers.sort_unstable();
        let expected: Vec<i32> = (1..=delivery.attempt_count).collect();
        ensure!(
            numbers == expected,
            "delivery {} attempt numbers {:?} are not contiguous from 1",
            delivery.id,
            numbers
        );

        for attempt in attempts {
            ensure!(
                attempt.delivery_id == delivery.id,
                "attempt {} belongs to {} not {}",
                attempt.id,
                attempt.delivery_id,
                delivery.id
            );
        }
        Ok(())
    }

    /// The status agrees with the attempt history.
    ///
    /// `success` requires the last attempt to have succeeded and none
    /// before it; `failed` requires the budget exhausted without success;
    /// `pending` requires no successful attempt.
    pub fn status_matches_history(delivery: &Delivery, attempts: &[DeliveryAttempt]) -> Result<()> {
        let mut ordered: Vec<&DeliveryAttempt> = attempts.iter().collect();
        ordered.sort_by_key(|a| a.attempt_number);
        let successes = ordered.iter().filter(|a| a.success).count();

        match delivery.status {
            DeliveryStatus::Success => {
                ensure!(successes == 1, "delivery {} succeeded {successes} times", delivery.id);
                ensure!(
                    ordered.last().is_some_and(|a| a.success),
                    "delivery {} is success but its last attempt failed",
                    delivery.id
                );
            },
            DeliveryStatus::Failed => {
                ensure!(successes == 0, "failed delivery {} has a successful attempt", delivery.id);
                ensure!(
                    delivery.attempt_count == delivery.max_delivery_attempts,
                    "delivery {} failed after {} of {} attempts",
                    delivery.id,
                    delivery.attempt_count,
                    delivery.max_delivery_attempts
                );
            },
            DeliveryStatus::Pending => {
                ensure!(
                    successes == 0,
                    "pending delivery {} has a successful attempt",
                    delivery.id
                );
            },
        }
        Ok(())
    }

    /// Terminal deliveries hold no claim.
    pub fn terminal_unclaimed(delivery: &Delivery) -> Result<()> {
        if delivery.is_terminal() {
            ensure!(
                delivery.claim_token.is_none() && delivery.claim_expires_at.is_none(),
                "terminal delivery {} still holds a claim",
                delivery.id
            );
        }
        Ok(())
    }

    /// Attempt outcomes are internally consistent: a transport failure has an
    /// error and no response, a received response has a status and no error.
    pub fn outcomes_well_formed(attempts: &[DeliveryAttempt]) -> Result<()> {
        for attempt in attempts {
            match attempt.response_status_code {
                Some(status) => {
                    ensure!(
                        attempt.error.is_none(),
                        "attempt {} has status {status} and an error",
                        attempt.id
                    );
                    ensure!(
                        attempt.success == (200..300).contains(&status),
                        "attempt {} success flag disagrees with status {status}",
                        attempt.id
                    );
                },
                None => {
                    ensure!(!attempt.success, "attempt {} succeeded without a status", attempt.id);
                    ensure!(
                        attempt.error.is_some() && attempt.response.is_empty(),
                        "attempt {} has no status but lacks an error or has a response",
                        attempt.id
                    );
                },
            }
        }
        Ok(())
    }

    /// Consecutive attempts are spaced by at least the policy's backoff.
    pub fn retry_spacing(
        delivery: &Delivery,
        attempts: &[DeliveryAttempt],
        policy: &RetryPolicy,
    ) -> Result<()> {
        let mut ordered: Vec<&DeliveryAttempt> = attempts.iter().collect();
        ordered.sort_by_key(|a| a.attempt_number);

        for pair in ordered.windows(2) {
            let gap = (pair[1].created_at - pair[0].created_at).to_std().unwrap_or_default();
            let backoff = policy.backoff(pair[0].attempt_number, delivery.delivery_attempt_delay());
            ensure!(
                gap >= backoff,
                "attempt {} followed attempt {} after {gap:?}, backoff is {backoff:?}",
                pair[1].attempt_number,
                pair[0].attempt_number
            );
        }
        Ok(())
    }

    /// Publishing produced exactly one pending delivery per subscription,
    /// each carrying the subscription's policy.
    pub fn fan_out_complete(fan_out: &FanOut, subscriptions: &[Subscription]) -> Result<()> {
        ensure!(
            fan_out.deliveries.len() == subscriptions.len(),
            "{} deliveries for {} subscriptions",
            fan_out.deliveries.len(),
            subscriptions.len()
        );

        let mut seen = HashSet::new();
        for delivery in &fan_out.deliveries {
            ensure!(
                seen.insert(delivery.subscription_id),
                "subscription {} received two deliveries",
                delivery.subscription_id
            );
            ensure!(delivery.message_id == fan_out.message.id, "delivery of another message");
            ensure!(
                delivery.status == DeliveryStatus::Pending && delivery.attempt_count == 0,
                "delivery {} is not fresh",
                delivery.id
            );

            let subscription = subscriptions
                .iter()
                .find(|s| s.id == delivery.subscription_id)
                .ok_or_else(|| anyhow::anyhow!("delivery for unknown subscription"))?;
            ensure!(
                delivery.url == subscription.url
                    && delivery.secret_token == subscription.secret_token
                    && delivery.max_delivery_attempts == subscription.max_delivery_attempts
                    && delivery.delivery_attempt_delay_ms == subscription.delivery_attempt_delay_ms
                    && delivery.delivery_attempt_timeout_ms
                        == subscription.delivery_attempt_timeout_ms,
                "delivery {} does not carry the policy of subscription {}",
                delivery.id,
                subscription.id
            );
        }
        Ok(())
    }

    /// Runs every per-delivery check.
    pub fn check_delivery(delivery: &Delivery, attempts: &[DeliveryAttempt]) -> Result<()> {
        Self::attempts_accounted(delivery, attempts)?;
        Self::status_matches_history(delivery, attempts)?;
        Self::terminal_unclaimed(delivery)?;
        Self::outcomes_well_formed(attempts)
    }
}
