//! Content-addressed, reference-counted blob cache.
//!
//! Blobs live at `resource:{hash}` with a companion `resource:{hash}:counter`.
//! A blob is deleted exactly when its counter reaches zero. Counter
//! mutations that must observe the current value go through WATCH/MULTI
//! with bounded retry; a plain INCR never conflicts and needs neither.

use redis::AsyncCommands;
use sha2::{Digest, Sha256};

use prism_proto::{resource_counter_key, resource_key, ResourceRef};

use crate::retry::{attempt, RetryPolicy};
use crate::{Result, Store, StoreError};

/// What a release does once it has observed the current refcount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseAction {
    /// More references remain: write the decremented counter.
    Decrement(i64),
    /// Last reference: delete blob and counter together.
    Delete,
}

impl ReleaseAction {
    pub fn for_count(count: i64) -> Self {
        if count > 1 {
            Self::Decrement(count - 1)
        } else {
            Self::Delete
        }
    }
}

pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

impl Store {
    /// Store `content` under its hash and take one reference. Identical
    /// bytes always land on the same key, so the SET cannot conflict and
    /// the INCR is atomic on its own.
    pub async fn put_resource(&self, content: &[u8]) -> Result<String> {
        let hash = content_hash(content);
        let mut conn = self.conn();
        redis::pipe()
            .atomic()
            .set(resource_key(&hash), content)
            .ignore()
            .incr(resource_counter_key(&hash), 1)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(hash)
    }

    pub async fn fetch_resource(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn();
        Ok(conn.get(resource_key(hash)).await?)
    }

    pub async fn resource_exists(&self, hash: &str) -> Result<bool> {
        let mut conn = self.conn();
        Ok(conn.exists(resource_key(hash)).await?)
    }

    /// Existence checks for a batch of hashes, in input order.
    pub async fn resources_exist(&self, hashes: &[String]) -> Result<Vec<bool>> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for hash in hashes {
            pipe.exists(resource_key(hash));
        }
        Ok(pipe.query_async(&mut conn).await?)
    }

    pub async fn refcount(&self, hash: &str) -> Result<Option<i64>> {
        let mut conn = self.conn();
        Ok(conn.get(resource_counter_key(hash)).await?)
    }

    /// Take one extra reference on every resource in a dispatch snapshot,
    /// keeping the blobs alive for the job even if the session is mutated
    /// or deleted meanwhile.
    pub async fn retain_resources(&self, resources: &[ResourceRef]) -> Result<()> {
        if resources.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for resource in resources {
            pipe.incr(resource_counter_key(&resource.hash), 1).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Drop one reference; deletes blob and counter when the last one goes.
    /// Conflicts are retried per the default policy.
    pub async fn release_resource(&self, hash: &str) -> Result<()> {
        attempt(RetryPolicy::default(), || self.try_release(hash)).await
    }

    /// Release where exhausted retries are an accepted leak: logged, never
    /// propagated. The periodic worker-side sweep bounds the damage.
    pub async fn release_resource_lossy(&self, hash: &str) {
        if let Err(err) = self.release_resource(hash).await {
            tracing::warn!(%hash, %err, "failed to release resource, leaving it for the sweep");
        }
    }

    async fn try_release(&self, hash: &str) -> Result<()> {
        let mut conn = self.dedicated().await?;
        redis::cmd("WATCH")
            .arg(resource_key(hash))
            .arg(resource_counter_key(hash))
            .query_async::<()>(&mut conn)
            .await?;

        let count: Option<i64> = conn.get(resource_counter_key(hash)).await?;
        let Some(count) = count else {
            // Already released by someone else.
            redis::cmd("UNWATCH").query_async::<()>(&mut conn).await?;
            return Ok(());
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        match ReleaseAction::for_count(count) {
            ReleaseAction::Decrement(next) => {
                pipe.set(resource_counter_key(hash), next).ignore();
            }
            ReleaseAction::Delete => {
                pipe.del(resource_key(hash)).ignore();
                pipe.del(resource_counter_key(hash)).ignore();
            }
        }

        // A nil EXEC means a watched key moved under us.
        let committed: Option<()> = pipe.query_async(&mut conn).await?;
        committed.ok_or(StoreError::Conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_decrements_until_last_reference() {
        assert_eq!(ReleaseAction::for_count(3), ReleaseAction::Decrement(2));
        assert_eq!(ReleaseAction::for_count(2), ReleaseAction::Decrement(1));
        assert_eq!(ReleaseAction::for_count(1), ReleaseAction::Delete);
        // A counter can never be observed below one by a live reference
        // holder; if it is, deleting is the only safe recovery.
        assert_eq!(ReleaseAction::for_count(0), ReleaseAction::Delete);
    }

    #[test]
    fn identical_content_shares_a_hash() {
        let a = content_hash(b"teapot");
        let b = content_hash(b"teapot");
        let c = content_hash(b"not a teapot");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
