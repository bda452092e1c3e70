//! Queue plumbing over the shared store: the render work queue, the ack
//! channel, fleet/worker command queues, and the per-render image slots.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use prism_proto::{
    render_image_key, worker_command_queue, ImageEnvelope, JobAck, RenderJob, WorkerCommand,
    ACK_QUEUE, MASTER_COMMAND_QUEUE, RENDER_QUEUE,
};

use crate::{Result, Store};

/// What a worker's blocking pop can yield.
#[derive(Debug)]
pub enum WorkerInput {
    Job(RenderJob),
    Command(WorkerCommand),
    /// A token on the command queue that parsed to nothing.
    UnknownCommand(String),
}

impl Store {
    pub async fn enqueue_job(&self, job: &RenderJob) -> Result<()> {
        let mut conn = self.conn();
        let payload = serde_json::to_string(job)?;
        conn.rpush::<_, _, ()>(RENDER_QUEUE, payload).await?;
        Ok(())
    }

    pub async fn push_ack(&self, ack: &JobAck) -> Result<()> {
        let mut conn = self.conn();
        let payload = serde_json::to_string(ack)?;
        conn.rpush::<_, _, ()>(ACK_QUEUE, payload).await?;
        Ok(())
    }

    pub async fn push_master_command(&self, token: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.rpush::<_, _, ()>(MASTER_COMMAND_QUEUE, token).await?;
        Ok(())
    }

    pub async fn push_worker_command(&self, worker: &str, command: WorkerCommand) -> Result<()> {
        let mut conn = self.conn();
        conn.rpush::<_, _, ()>(worker_command_queue(worker), command.token())
            .await?;
        Ok(())
    }

    /// Store a finished sample for pickup by the ack listener.
    pub async fn store_render_image(&self, render_id: &str, jpeg: &[u8]) -> Result<()> {
        let envelope = ImageEnvelope {
            jpeg_data: STANDARD.encode(jpeg),
        };
        let mut conn = self.conn();
        conn.set::<_, _, ()>(render_image_key(render_id), serde_json::to_string(&envelope)?)
            .await?;
        Ok(())
    }

    /// Fetch and delete a finished sample. `None` if nothing was stored.
    pub async fn take_render_image(&self, render_id: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn();
        let key = render_image_key(render_id);
        let raw: Option<String> = conn.get(&key).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        conn.del::<_, ()>(&key).await?;
        let envelope: ImageEnvelope = serde_json::from_str(&raw)?;
        Ok(Some(STANDARD.decode(envelope.jpeg_data)?))
    }

    /// A blocking-pop consumer with its own connection, so BLPOP never
    /// stalls the shared pipeline.
    pub async fn consumer(&self) -> Result<QueueConsumer> {
        Ok(QueueConsumer {
            conn: self.dedicated().await?,
        })
    }
}

pub struct QueueConsumer {
    conn: MultiplexedConnection,
}

impl QueueConsumer {
    /// Pop one ack, waiting up to `timeout_secs` (0.0 blocks forever).
    pub async fn pop_ack(&mut self, timeout_secs: f64) -> Result<Option<JobAck>> {
        let popped: Option<(String, String)> = self.conn.blpop(ACK_QUEUE, timeout_secs).await?;
        match popped {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    /// Pop one fleet-command token, waiting up to `timeout_secs`.
    pub async fn pop_master_command(&mut self, timeout_secs: f64) -> Result<Option<String>> {
        let popped: Option<(String, String)> =
            self.conn.blpop(MASTER_COMMAND_QUEUE, timeout_secs).await?;
        Ok(popped.map(|(_, token)| token))
    }

    /// Block on the work queue and this worker's control queue at once.
    pub async fn pop_worker_input(
        &mut self,
        worker: &str,
        timeout_secs: f64,
    ) -> Result<Option<WorkerInput>> {
        let queues = [RENDER_QUEUE.to_string(), worker_command_queue(worker)];
        let popped: Option<(String, String)> = self.conn.blpop(&queues[..], timeout_secs).await?;
        let Some((list, payload)) = popped else {
            return Ok(None);
        };
        if list == RENDER_QUEUE {
            return Ok(Some(WorkerInput::Job(serde_json::from_str(&payload)?)));
        }
        Ok(Some(match WorkerCommand::parse(&payload) {
            Some(command) => WorkerInput::Command(command),
            None => WorkerInput::UnknownCommand(payload),
        }))
    }
}
