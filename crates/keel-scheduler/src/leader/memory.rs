//! Process-local [`LeaderElector`].
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: leases are not shared across processes
//! - **No persistence**: leases vanish with the process

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ulid::Ulid;

use super::{LeaderElector, LeadershipResult, RenewalResult};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    token: String,
    expires_at: DateTime<Utc>,
}

impl Lease {
    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// In-memory [`LeaderElector`] for tests and single-process setups.
#[derive(Debug)]
pub struct InMemoryLeaderElector {
    leases: RwLock<HashMap<String, Lease>>,
    lease_duration: Duration,
}

impl Default for InMemoryLeaderElector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    keel_core::Error::storage("lease table lock poisoned").into()
}

impl InMemoryLeaderElector {
    /// Creates an elector granting leases of `lease_duration`.
    #[must_use]
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
            lease_duration,
        }
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    fn grant(&self, holder: &str, now: DateTime<Utc>) -> Lease {
        Lease {
            holder: holder.to_string(),
            token: Ulid::new().to_string(),
            expires_at: self.expiry_from(now),
        }
    }
}

#[async_trait]
impl LeaderElector for InMemoryLeaderElector {
    async fn try_acquire(&self, lock_key: &str, node_id: &str) -> Result<LeadershipResult> {
        let now = Utc::now();
        let mut leases = self.leases.write().map_err(poison_err)?;

        if let Some(lease) = leases.get(lock_key) {
            if lease.is_valid_at(now) && lease.holder != node_id {
                return Ok(LeadershipResult::NotLeader {
                    current_leader: Some(lease.holder.clone()),
                });
            }
        }

        let lease = self.grant(node_id, now);
        let lease_token = lease.token.clone();
        leases.insert(lock_key.to_string(), lease);
        drop(leases);

        Ok(LeadershipResult::Acquired {
            lease_token,
            lease_duration: self.lease_duration,
        })
    }

    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult> {
        let now = Utc::now();
        let mut leases = self.leases.write().map_err(poison_err)?;

        let Some(lease) = leases.get_mut(lock_key) else {
            return Ok(RenewalResult::Lost);
        };
        if lease.token != lease_token {
            return Ok(RenewalResult::InvalidToken);
        }
        if !lease.is_valid_at(now) {
            return Ok(RenewalResult::Lost);
        }
        lease.expires_at = self.expiry_from(now);

        Ok(RenewalResult::Renewed {
            lease_duration: self.lease_duration,
        })
    }

    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<bool> {
        let mut leases = self.leases.write().map_err(poison_err)?;
        if leases.get(lock_key).is_some_and(|lease| lease.token == lease_token) {
            leases.remove(lock_key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn current_leader(&self, lock_key: &str) -> Result<Option<String>> {
        let now = Utc::now();
        let leases = self.leases.read().map_err(poison_err)?;
        Ok(leases
            .get(lock_key)
            .filter(|lease| lease.is_valid_at(now))
            .map(|lease| lease.holder.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "keel/leader";

    #[tokio::test]
    async fn second_node_waits_for_release() -> Result<()> {
        let elector = InMemoryLeaderElector::default();

        let first = elector.try_acquire(KEY, "node-a").await?;
        let token = first.lease_token().map(str::to_string).unwrap();
        assert_eq!(
            elector.try_acquire(KEY, "node-b").await?,
            LeadershipResult::NotLeader {
                current_leader: Some("node-a".to_string())
            }
        );
        assert_eq!(elector.current_leader(KEY).await?, Some("node-a".to_string()));

        assert!(elector.release(KEY, &token).await?);
        assert!(!elector.release(KEY, &token).await?);
        assert!(elector.try_acquire(KEY, "node-b").await?.is_leader());
        Ok(())
    }

    #[tokio::test]
    async fn reacquire_rotates_token() -> Result<()> {
        let elector = InMemoryLeaderElector::default();
        let first = elector.try_acquire(KEY, "node-a").await?;
        let second = elector.try_acquire(KEY, "node-a").await?;
        assert_ne!(first.lease_token(), second.lease_token());

        let stale = first.lease_token().unwrap();
        assert_eq!(elector.renew(KEY, stale).await?, RenewalResult::InvalidToken);
        assert!(elector.renew(KEY, second.lease_token().unwrap()).await?.is_renewed());
        Ok(())
    }

    #[tokio::test]
    async fn expired_lease_is_lost_and_free() -> Result<()> {
        let elector = InMemoryLeaderElector::new(Duration::from_millis(10));
        let first = elector.try_acquire(KEY, "node-a").await?;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(
            elector.renew(KEY, first.lease_token().unwrap()).await?,
            RenewalResult::Lost
        );
        assert_eq!(elector.current_leader(KEY).await?, None);
        assert!(elector.try_acquire(KEY, "node-b").await?.is_leader());
        Ok(())
    }
}
