//! Per-cluster lease lock over object-store conditional writes
//!
//! A lease is a small JSON record at `locks/<resource>`. Acquisition is a
//! create-if-absent; stale leases are fenced by replacing the exact version
//! that was observed expired. The fencing counter only ever grows.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{
    LockAcquisition, LockService, LockState, ObjectStore, StoreError, WritePrecondition,
};

fn lock_key(resource: &str) -> String {
    format!("locks/{}", resource)
}

/// Interval between acquisition attempts while waiting
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseRecord {
    owner: String,
    fence: u64,
    expires_at: DateTime<Utc>,
}

/// Lock service storing leases next to the cluster documents
pub struct S3LockService {
    store: Arc<dyn ObjectStore>,
}

impl S3LockService {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    async fn try_acquire(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<LockAcquisition>> {
        let key = lock_key(resource);
        let now = Utc::now();
        let expires_at =
            now + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(30));

        let existing = self.store.get(&key).await?;
        let (fence, precondition) = match &existing {
            None => (1, WritePrecondition::IfAbsent),
            Some(obj) => {
                // An unreadable record counts as expired: fence it
                let record: Option<LeaseRecord> = serde_json::from_slice(&obj.body).ok();
                match record {
                    Some(r) if r.owner == owner => {
                        // Renewal keeps the fence
                        (r.fence, WritePrecondition::IfMatch(obj.etag.clone()))
                    }
                    Some(r) if r.expires_at > now => {
                        tracing::trace!(
                            resource,
                            holder = %r.owner,
                            "lock held, waiting"
                        );
                        return Ok(None);
                    }
                    Some(r) => (r.fence + 1, WritePrecondition::IfMatch(obj.etag.clone())),
                    None => (1, WritePrecondition::IfMatch(obj.etag.clone())),
                }
            }
        };

        let record = LeaseRecord {
            owner: owner.to_string(),
            fence,
            expires_at,
        };
        let body = serde_json::to_vec(&record).context("failed to encode lease record")?;

        match self.store.put(&key, &body, precondition).await {
            Ok(_) => Ok(Some(LockAcquisition {
                fencing_token: fence,
            })),
            // Lost the race; the caller's wait loop re-reads
            Err(StoreError::PreconditionFailed { .. }) => Ok(None),
            Err(StoreError::Other(e)) => Err(e),
        }
    }
}

#[async_trait]
impl LockService for S3LockService {
    async fn acquire(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<LockAcquisition>> {
        let deadline = std::time::Instant::now() + wait;
        loop {
            if let Some(acquisition) = self.try_acquire(resource, owner, ttl).await? {
                return Ok(Some(acquisition));
            }
            if std::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(wait)).await;
        }
    }

    async fn release(&self, resource: &str, owner: &str) -> Result<()> {
        let key = lock_key(resource);
        let Some(obj) = self.store.get(&key).await? else {
            return Ok(());
        };
        let record: Option<LeaseRecord> = serde_json::from_slice(&obj.body).ok();
        if record.is_some_and(|r| r.owner == owner) {
            self.store.delete(&key).await?;
        }
        Ok(())
    }

    async fn is_locked(&self, resource: &str) -> Result<LockState> {
        let Some(obj) = self.store.get(&lock_key(resource)).await? else {
            return Ok(LockState::default());
        };
        let Ok(record) = serde_json::from_slice::<LeaseRecord>(&obj.body) else {
            return Ok(LockState::default());
        };
        if record.expires_at <= Utc::now() {
            return Ok(LockState::default());
        }
        Ok(LockState {
            locked: true,
            owner: Some(record.owner),
            expires_at: Some(record.expires_at),
        })
    }
}
