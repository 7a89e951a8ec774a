//! Per-message bandwidth metering
//!
//! Runs after every recipient of a message has been routed. Each user with
//! at least one forwarded outcome is charged the message size once.

use crate::config::{LimitsConfig, NearLimitPolicy};
use crate::model::BandwidthUsage;
use crate::notify::{NotificationEvent, Notifier};
use crate::router::RouteOutcome;
use crate::store::AliasStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// One applied bandwidth increment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandwidthCharge {
    pub user_id: Uuid,
    pub bytes: u64,
    pub before: u64,
    pub after: u64,
    pub limit: u64,
    pub notified: bool,
}

/// Whether `usage` warrants a near-limit notice
pub fn crosses_near_limit(usage: &BandwidthUsage, ratio: f64, policy: NearLimitPolicy) -> bool {
    if usage.limit == 0 || usage.ratio_after() <= ratio {
        return false;
    }

    match policy {
        NearLimitPolicy::EveryMessage => true,
        NearLimitPolicy::OnCrossing => usage.ratio_before() <= ratio,
    }
}

pub struct BandwidthAccountant {
    store: Arc<dyn AliasStore>,
    notifier: Arc<dyn Notifier>,
    near_limit_ratio: f64,
    policy: NearLimitPolicy,
}

impl BandwidthAccountant {
    pub fn new(
        store: Arc<dyn AliasStore>,
        notifier: Arc<dyn Notifier>,
        limits: &LimitsConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            near_limit_ratio: limits.near_limit_ratio,
            policy: limits.near_limit_policy,
        }
    }

    /// Charge `size` bytes once to every user with a forwarded outcome
    ///
    /// A failure for one user is logged and does not stop the others.
    pub async fn charge(&self, outcomes: &[RouteOutcome], size: u64) -> Vec<BandwidthCharge> {
        let mut users: Vec<Uuid> = Vec::new();
        for user_id in outcomes.iter().filter_map(RouteOutcome::forwarded_user) {
            if !users.contains(&user_id) {
                users.push(user_id);
            }
        }

        let mut charges = Vec::with_capacity(users.len());
        for user_id in users {
            let usage = match self.store.add_bandwidth(user_id, size).await {
                Ok(usage) => usage,
                Err(e) => {
                    error!("Failed to charge {} bytes to user {}: {}", size, user_id, e);
                    continue;
                }
            };

            let notified = if crosses_near_limit(&usage, self.near_limit_ratio, self.policy) {
                self.notify_near_limit(user_id, &usage).await
            } else {
                false
            };

            charges.push(BandwidthCharge {
                user_id,
                bytes: size,
                before: usage.before,
                after: usage.after,
                limit: usage.limit,
                notified,
            });
        }

        charges
    }

    async fn notify_near_limit(&self, user_id: Uuid, usage: &BandwidthUsage) -> bool {
        let user = match self.store.find_user(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                warn!("User {} vanished before near-limit notice", user_id);
                return false;
            }
            Err(e) => {
                error!("Failed to load user {} for near-limit notice: {}", user_id, e);
                return false;
            }
        };

        let event = NotificationEvent::NearBandwidthLimit {
            bandwidth: usage.after,
            limit: usage.limit,
        };

        match self.notifier.notify(&user, event).await {
            Ok(()) => {
                info!(
                    "User {} is near the bandwidth limit ({:.2}MB of {:.2}MB)",
                    user.username,
                    user.bandwidth_mb(),
                    user.bandwidth_limit_mb()
                );
                true
            }
            Err(e) => {
                error!("Failed to queue near-limit notice for {}: {}", user.username, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AliasError;
    use crate::model::User;
    use crate::notify::MockNotifier;
    use crate::router::{BlockReason, RejectReason};
    use crate::store::MockAliasStore;
    use chrono::Utc;
    use mockall::predicate::eq;

    fn usage(before: u64, after: u64, limit: u64) -> BandwidthUsage {
        BandwidthUsage {
            before,
            after,
            limit,
        }
    }

    fn forwarded(user: u128, alias: u128) -> RouteOutcome {
        RouteOutcome::Forwarded {
            user_id: Uuid::from_u128(user),
            alias_id: Uuid::from_u128(alias),
        }
    }

    fn user(id: Uuid) -> User {
        User {
            id,
            username: "johndoe".to_string(),
            default_recipient_id: None,
            bandwidth: 100_944_820,
            bandwidth_limit: 112_148_689,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_near_limit_policies() {
        let above = usage(100_943_820, 100_944_820, 104_857_600);
        assert!(crosses_near_limit(&above, 0.9, NearLimitPolicy::EveryMessage));
        assert!(!crosses_near_limit(&above, 0.9, NearLimitPolicy::OnCrossing));

        let crossing = usage(94_371_000, 94_372_000, 104_857_600);
        assert!(crosses_near_limit(&crossing, 0.9, NearLimitPolicy::OnCrossing));
        assert!(crosses_near_limit(&crossing, 0.9, NearLimitPolicy::EveryMessage));

        let below = usage(0, 1000, 104_857_600);
        assert!(!crosses_near_limit(&below, 0.9, NearLimitPolicy::EveryMessage));

        let unlimited = usage(5, 10, 0);
        assert!(!crosses_near_limit(&unlimited, 0.9, NearLimitPolicy::EveryMessage));
    }

    #[tokio::test]
    async fn test_charged_once_per_user() {
        let mut store = MockAliasStore::new();
        store
            .expect_add_bandwidth()
            .with(eq(Uuid::from_u128(1)), eq(1217u64))
            .times(1)
            .returning(|_, bytes| Ok(usage(0, bytes, 104_857_600)));
        store
            .expect_add_bandwidth()
            .with(eq(Uuid::from_u128(5)), eq(1217u64))
            .times(1)
            .returning(|_, bytes| Ok(usage(0, bytes, 104_857_600)));
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().never();

        let accountant = BandwidthAccountant::new(
            Arc::new(store),
            Arc::new(notifier),
            &LimitsConfig::default(),
        );
        let outcomes = vec![
            forwarded(1, 10),
            forwarded(1, 11),
            RouteOutcome::Blocked {
                alias_id: Uuid::from_u128(12),
                reason: BlockReason::Unverified,
            },
            forwarded(5, 13),
            RouteOutcome::Rejected {
                reason: RejectReason::NoMatchingUser,
            },
        ];

        let charges = accountant.charge(&outcomes, 1217).await;
        assert_eq!(charges.len(), 2);
        assert_eq!(charges[0].user_id, Uuid::from_u128(1));
        assert_eq!(charges[1].user_id, Uuid::from_u128(5));
        assert!(charges.iter().all(|c| c.after == 1217 && !c.notified));
    }

    #[tokio::test]
    async fn test_no_forward_no_charge() {
        let mut store = MockAliasStore::new();
        store.expect_add_bandwidth().never();
        let accountant = BandwidthAccountant::new(
            Arc::new(store),
            Arc::new(MockNotifier::new()),
            &LimitsConfig::default(),
        );

        let outcomes = vec![RouteOutcome::Unsubscribed {
            alias_id: Uuid::from_u128(3),
        }];
        assert!(accountant.charge(&outcomes, 1000).await.is_empty());
    }

    #[tokio::test]
    async fn test_near_limit_notifies_once() {
        let user_id = Uuid::from_u128(1);
        let mut store = MockAliasStore::new();
        store
            .expect_add_bandwidth()
            .times(1)
            .returning(|_, _| Ok(usage(100_943_820, 100_944_820, 112_148_689)));
        store
            .expect_find_user()
            .with(eq(user_id))
            .returning(|id| Ok(Some(user(id))));

        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(|_, event| {
                *event
                    == NotificationEvent::NearBandwidthLimit {
                        bandwidth: 100_944_820,
                        limit: 112_148_689,
                    }
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let accountant = BandwidthAccountant::new(
            Arc::new(store),
            Arc::new(notifier),
            &LimitsConfig::default(),
        );
        let charges = accountant.charge(&[forwarded(1, 10)], 1000).await;

        assert_eq!(charges.len(), 1);
        assert!(charges[0].notified);
        assert_eq!(charges[0].after, 100_944_820);
    }

    #[tokio::test]
    async fn test_store_failure_skips_user() {
        let mut store = MockAliasStore::new();
        store
            .expect_add_bandwidth()
            .with(eq(Uuid::from_u128(1)), eq(1000u64))
            .returning(|_, _| Err(AliasError::NotFound("user".to_string())));
        store
            .expect_add_bandwidth()
            .with(eq(Uuid::from_u128(2)), eq(1000u64))
            .returning(|_, bytes| Ok(usage(0, bytes, 104_857_600)));

        let accountant = BandwidthAccountant::new(
            Arc::new(store),
            Arc::new(MockNotifier::new()),
            &LimitsConfig::default(),
        );
        let charges = accountant
            .charge(&[forwarded(1, 10), forwarded(2, 11)], 1000)
            .await;

        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0].user_id, Uuid::from_u128(2));
    }
}
