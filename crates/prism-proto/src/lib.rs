//! Shared protocol definitions for master ↔ worker communication.
//! Keeping this in a dedicated crate lets the master and worker binaries
//! agree on queue names and payload shapes without pulling in the store
//! layer.

use serde::{Deserialize, Serialize};

/// FIFO carrying serialized [`RenderJob`]s, consumed by workers.
pub const RENDER_QUEUE: &str = "render-queue";

/// FIFO carrying serialized [`JobAck`]s, consumed by the master's ack
/// listener.
pub const ACK_QUEUE: &str = "render-ack";

/// FIFO carrying fleet command tokens, consumed by the fleet manager.
pub const MASTER_COMMAND_QUEUE: &str = "cmd:master";

/// Set of live session ids.
pub const SESSION_SET: &str = "session";

/// Monotonic session id counter, initialised with SETNX at master startup.
pub const SESSION_COUNTER: &str = "render-counter";

pub fn worker_command_queue(worker: &str) -> String {
    format!("cmd:{worker}")
}

pub fn resource_key(hash: &str) -> String {
    format!("resource:{hash}")
}

pub fn resource_counter_key(hash: &str) -> String {
    format!("resource:{hash}:counter")
}

pub fn render_image_key(render_id: &str) -> String {
    format!("render-image:{render_id}")
}

pub fn session_scene_key(session_id: &str) -> String {
    format!("session:{session_id}:input-json")
}

pub fn session_resource_set_key(session_id: &str) -> String {
    format!("session:{session_id}:resource")
}

pub fn session_resource_key(session_id: &str, name: &str) -> String {
    format!("session:{session_id}:resource:{name}")
}

pub fn session_modified_key(session_id: &str) -> String {
    format!("session:{session_id}:modified")
}

/// A named resource reference carried inside a render job. The hash is the
/// content address; the name is the path the renderer sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceRef {
    pub name: String,
    pub hash: String,
}

/// One render sample dispatched to the worker pool. The resource list is a
/// snapshot of the session's bindings at dispatch time; each entry holds a
/// refcount on the shared store until the worker has materialized it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RenderJob {
    pub render_id: String,
    pub session_id: String,
    pub input_json: String,
    #[serde(default)]
    pub resources: Vec<ResourceRef>,
}

/// Acknowledgement statuses a worker can report for a render job.
///
/// `Start` is informational (the waiter stays registered); `Ok` and
/// `LinkError` are terminal. Anything else on the wire decodes to
/// `Unknown` and is dropped by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    Start,
    Ok,
    LinkError,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct JobAck {
    pub render_id: String,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl JobAck {
    pub fn start(render_id: &str) -> Self {
        Self {
            render_id: render_id.to_string(),
            status: AckStatus::Start,
            log: None,
        }
    }

    pub fn ok(render_id: &str) -> Self {
        Self {
            render_id: render_id.to_string(),
            status: AckStatus::Ok,
            log: None,
        }
    }

    pub fn link_error(render_id: &str, log: String) -> Self {
        Self {
            render_id: render_id.to_string(),
            status: AckStatus::LinkError,
            log: Some(log),
        }
    }
}

/// Envelope under which a worker stores a finished sample, keyed by
/// `render-image:{renderId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEnvelope {
    #[serde(rename = "jpegdata")]
    pub jpeg_data: String,
}

/// Control tokens carried on the per-worker command queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    Stop,
    Restart,
}

impl WorkerCommand {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            _ => None,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }
}

/// Tokens carried on the master command queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetCommand {
    /// Create `count` worker instances.
    Create { count: u32 },
    /// A liveness ping from a named worker.
    Ping { worker: String },
    /// Send a restart command to every known worker.
    RestartWorkers,
}

impl FleetCommand {
    pub fn parse(token: &str) -> Option<Self> {
        if token == "restart_workers" {
            return Some(Self::RestartWorkers);
        }
        if let Some(worker) = token.strip_prefix("ping:") {
            if worker.is_empty() {
                return None;
            }
            return Some(Self::Ping {
                worker: worker.to_string(),
            });
        }
        if token == "create" {
            return Some(Self::Create { count: 1 });
        }
        if let Some(count) = token.strip_prefix("create:") {
            return count.parse().ok().map(|count| Self::Create { count });
        }
        None
    }

    pub fn token(&self) -> String {
        match self {
            Self::Create { count: 1 } => "create".to_string(),
            Self::Create { count } => format!("create:{count}"),
            Self::Ping { worker } => format!("ping:{worker}"),
            Self::RestartWorkers => "restart_workers".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_uses_wire_field_names() {
        let job = RenderJob {
            render_id: "42".into(),
            session_id: "7".into(),
            input_json: "scene.json".into(),
            resources: vec![ResourceRef {
                name: "teapot.mesh".into(),
                hash: "abc".into(),
            }],
        };
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["RenderId"], "42");
        assert_eq!(json["InputJson"], "scene.json");
        assert_eq!(json["Resources"][0]["Name"], "teapot.mesh");
        assert_eq!(json["Resources"][0]["Hash"], "abc");
    }

    #[test]
    fn unknown_ack_status_decodes_to_unknown() {
        let ack: JobAck =
            serde_json::from_str(r#"{"RenderId":"1","Status":"Exploded"}"#).unwrap();
        assert_eq!(ack.status, AckStatus::Unknown);

        let ack: JobAck =
            serde_json::from_str(r#"{"RenderId":"1","Status":"LinkError","Log":"boom"}"#)
                .unwrap();
        assert_eq!(ack.status, AckStatus::LinkError);
        assert_eq!(ack.log.as_deref(), Some("boom"));
    }

    #[test]
    fn fleet_command_round_trips() {
        assert_eq!(
            FleetCommand::parse("create"),
            Some(FleetCommand::Create { count: 1 })
        );
        assert_eq!(
            FleetCommand::parse("create:4"),
            Some(FleetCommand::Create { count: 4 })
        );
        assert_eq!(
            FleetCommand::parse("ping:render-worker-1"),
            Some(FleetCommand::Ping {
                worker: "render-worker-1".into()
            })
        );
        assert_eq!(
            FleetCommand::parse("restart_workers"),
            Some(FleetCommand::RestartWorkers)
        );
        assert_eq!(FleetCommand::parse("ping:"), None);
        assert_eq!(FleetCommand::parse("create:x"), None);
        assert_eq!(FleetCommand::parse("bogus"), None);

        let cmd = FleetCommand::Create { count: 4 };
        assert_eq!(FleetCommand::parse(&cmd.token()), Some(cmd));
    }

    #[test]
    fn worker_command_tokens() {
        assert_eq!(WorkerCommand::parse("stop"), Some(WorkerCommand::Stop));
        assert_eq!(
            WorkerCommand::parse("restart"),
            Some(WorkerCommand::Restart)
        );
        assert_eq!(WorkerCommand::parse("halt"), None);
        assert_eq!(WorkerCommand::Stop.token(), "stop");
    }
}
