//! Session metadata and named-resource bindings.
//!
//! A session is a scene reference plus a set of named resources, each name
//! bound to a content hash in the shared cache. Ids come from a monotonic
//! counter and are never reused.

use std::time::{SystemTime, UNIX_EPOCH};

use redis::AsyncCommands;
use tracing::warn;

use prism_proto::{
    resource_counter_key, resource_key, session_modified_key, session_resource_key,
    session_resource_set_key, session_scene_key, ResourceRef, SESSION_COUNTER, SESSION_SET,
};

use crate::cache::content_hash;
use crate::{Result, Store};

/// Outcome of binding a resource into a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundResource {
    pub hash: String,
    pub size: usize,
}

/// A point-in-time view of a session taken at dispatch.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub input_json: String,
    pub resources: Vec<ResourceRef>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl Store {
    /// Seed the session-id counter if this is a fresh store.
    pub async fn init_session_counter(&self) -> Result<()> {
        let mut conn = self.conn();
        conn.set_nx::<_, _, ()>(SESSION_COUNTER, 0).await?;
        Ok(())
    }

    /// Allocate the next session id and record the scene reference.
    pub async fn create_session(&self, input_json: &str) -> Result<String> {
        let mut conn = self.conn();
        let id: i64 = conn.incr(SESSION_COUNTER, 1).await?;
        let session_id = id.to_string();

        redis::pipe()
            .atomic()
            .sadd(SESSION_SET, &session_id)
            .ignore()
            .set(session_modified_key(&session_id), unix_now())
            .ignore()
            .set(session_scene_key(&session_id), input_json)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(session_id)
    }

    pub async fn session_exists(&self, session_id: &str) -> Result<bool> {
        let mut conn = self.conn();
        Ok(conn.exists(session_scene_key(session_id)).await?)
    }

    /// Bind `name` to `content` in the session, releasing whatever hash the
    /// name previously pointed at. Rebinding the same bytes to the same
    /// name only refreshes the modified stamp; the refcount is untouched.
    pub async fn bind_resource(
        &self,
        session_id: &str,
        name: &str,
        content: &[u8],
    ) -> Result<BoundResource> {
        let hash = content_hash(content);
        let mut conn = self.conn();

        let prev: Option<String> = conn.get(session_resource_key(session_id, name)).await?;
        if prev.as_deref() == Some(hash.as_str()) {
            conn.set::<_, _, ()>(session_modified_key(session_id), unix_now())
                .await?;
            return Ok(BoundResource {
                hash,
                size: content.len(),
            });
        }
        if let Some(prev_hash) = prev {
            self.release_resource_lossy(&prev_hash).await;
        }

        redis::pipe()
            .atomic()
            .set(resource_key(&hash), content)
            .ignore()
            .incr(resource_counter_key(&hash), 1)
            .ignore()
            .set(session_resource_key(session_id, name), &hash)
            .ignore()
            .sadd(session_resource_set_key(session_id), name)
            .ignore()
            .set(session_modified_key(session_id), unix_now())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(BoundResource {
            hash,
            size: content.len(),
        })
    }

    /// Remove the session and release every resource it bound. Per-resource
    /// failures are logged and skipped so one stuck resource cannot wedge
    /// the deletion.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let names: Vec<String> = conn.smembers(session_resource_set_key(session_id)).await?;

        redis::pipe()
            .atomic()
            .del(session_scene_key(session_id))
            .ignore()
            .del(session_resource_set_key(session_id))
            .ignore()
            .del(session_modified_key(session_id))
            .ignore()
            .srem(SESSION_SET, session_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        for name in names {
            let binding = session_resource_key(session_id, &name);
            let taken: redis::RedisResult<(Option<String>,)> = redis::pipe()
                .atomic()
                .get(&binding)
                .del(&binding)
                .ignore()
                .query_async(&mut conn)
                .await;

            match taken {
                Ok((Some(hash),)) => self.release_resource_lossy(&hash).await,
                Ok((None,)) => {
                    warn!(session = %session_id, %name, "resource binding already gone");
                }
                Err(err) => {
                    warn!(session = %session_id, %name, %err, "failed to unbind resource");
                }
            }
        }

        Ok(())
    }

    /// Atomically read the scene and resource names (touching the modified
    /// stamp), then resolve each name to its hash. Returns `None` when the
    /// session does not exist.
    pub async fn snapshot_session(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let mut conn = self.conn();
        let (input_json, names): (Option<String>, Vec<String>) = redis::pipe()
            .atomic()
            .get(session_scene_key(session_id))
            .smembers(session_resource_set_key(session_id))
            .set(session_modified_key(session_id), unix_now())
            .ignore()
            .query_async(&mut conn)
            .await?;

        let Some(input_json) = input_json else {
            return Ok(None);
        };

        let mut resources = Vec::with_capacity(names.len());
        for name in names {
            let hash: Option<String> = conn.get(session_resource_key(session_id, &name)).await?;
            match hash {
                Some(hash) => resources.push(ResourceRef { name, hash }),
                None => {
                    warn!(session = %session_id, %name, "binding vanished during snapshot");
                }
            }
        }

        Ok(Some(SessionSnapshot {
            input_json,
            resources,
        }))
    }
}
