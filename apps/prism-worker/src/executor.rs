//! The worker's job loop: block on the shared work queue and this
//! worker's control queue, execute jobs, and report acks.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use prism_proto::{JobAck, RenderJob, WorkerCommand};
use prism_store::{Store, WorkerInput};

use crate::config::Config;
use crate::renderer::{self, RenderOutput};
use crate::sandbox;

/// Run until a control command asks for an exit; the return value is the
/// process exit code (0 = stop, 1 = restart, so the supervisor relaunches).
pub async fn run(store: Store, config: Config) -> i32 {
    let mut consumer = loop {
        match store.consumer().await {
            Ok(consumer) => break consumer,
            Err(err) => {
                error!(%err, "job queue consumer connect failed");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    };

    info!(worker = %config.worker_name, "worker ready");

    loop {
        match consumer.pop_worker_input(&config.worker_name, 0.0).await {
            Ok(Some(WorkerInput::Job(job))) => handle_job(&store, &config, job).await,
            Ok(Some(WorkerInput::Command(WorkerCommand::Stop))) => {
                info!("stop command received");
                return 0;
            }
            Ok(Some(WorkerInput::Command(WorkerCommand::Restart))) => {
                info!("restart command received");
                return 1;
            }
            Ok(Some(WorkerInput::UnknownCommand(token))) => {
                warn!(%token, "unrecognized control command, dropped");
            }
            Ok(None) => {}
            // A payload that fails to decode is dropped; only connection
            // trouble backs off.
            Err(err) if matches!(err, prism_store::StoreError::Payload(_)) => {
                warn!(%err, "malformed job payload, dropped");
            }
            Err(err) => {
                error!(%err, "job queue read failed");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

/// One job, start to finish. Local filesystem failures abandon the job
/// without a terminal ack; only the renderer's own exit status produces a
/// LinkError.
async fn handle_job(store: &Store, config: &Config, job: RenderJob) {
    debug!(render_id = %job.render_id, session = %job.session_id, "job received");

    if let Err(err) = store.push_ack(&JobAck::start(&job.render_id)).await {
        error!(render_id = %job.render_id, %err, "failed to ack job start, abandoning");
        return;
    }

    let sandbox = match sandbox::materialize(store, &config.work_dir, &job).await {
        Ok(sandbox) => sandbox,
        Err(err) => {
            error!(render_id = %job.render_id, %err, "failed to materialize resources, abandoning job");
            sandbox::remove_job_dir(&sandbox::job_dir(&config.work_dir, &job.render_id)).await;
            return;
        }
    };

    // The local cache now holds the bytes; the per-job references taken at
    // dispatch are no longer needed. The session's own bindings are
    // untouched.
    for resource in &job.resources {
        store.release_resource_lossy(&resource.hash).await;
    }

    match renderer::invoke(&config.renderer_path, &sandbox, &job).await {
        Ok(RenderOutput::Image(jpeg)) => {
            debug!(render_id = %job.render_id, bytes = jpeg.len(), "sample rendered");
            match store.store_render_image(&job.render_id, &jpeg).await {
                Ok(()) => {
                    if let Err(err) = store.push_ack(&JobAck::ok(&job.render_id)).await {
                        error!(render_id = %job.render_id, %err, "failed to ack job completion");
                    }
                }
                Err(err) => {
                    error!(render_id = %job.render_id, %err, "failed to store render image");
                }
            }
        }
        Ok(RenderOutput::LinkError(log)) => {
            info!(render_id = %job.render_id, "renderer reported a link error");
            if let Err(err) = store
                .push_ack(&JobAck::link_error(&job.render_id, log))
                .await
            {
                error!(render_id = %job.render_id, %err, "failed to ack link error");
            }
        }
        Err(err) => {
            error!(render_id = %job.render_id, %err, "renderer invocation failed, abandoning job");
        }
    }

    sandbox.cleanup().await;
}
