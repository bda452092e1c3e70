//! Render dispatch and result correlation.
//!
//! Each HTTP render request snapshots the session once per sample, takes a
//! refcount on every referenced resource, enqueues the job, and registers
//! a waiter. One background listener owns the waiter registry: it blocks
//! on the ack queue, drains pending registrations before every ack, and
//! demultiplexes by render id.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, warn};

use prism_proto::{AckStatus, RenderJob};
use prism_store::Store;

/// Poll granularity for the ack queue; long enough to stay off the wire,
/// short enough that registry housekeeping interleaves.
const ACK_POLL_SECS: f64 = 1.0;

/// Terminal outcome of a single sample.
#[derive(Debug)]
pub enum SampleResult {
    Image(Vec<u8>),
    LinkError(String),
    Failed(String),
}

/// Everything N samples of one render request resolved to.
#[derive(Debug)]
pub enum RenderOutcome {
    /// All samples produced an image.
    Images(Vec<Vec<u8>>),
    /// A sample failed to resolve the scene; remaining samples are not
    /// waited for.
    LinkError(String),
}

pub struct WaiterRegistration {
    render_id: String,
    begin: Instant,
    tx: mpsc::Sender<SampleResult>,
}

struct Waiter {
    begin: Instant,
    tx: mpsc::Sender<SampleResult>,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Store,
    registrations: mpsc::Sender<WaiterRegistration>,
    render_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        registrations: mpsc::Sender<WaiterRegistration>,
        render_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registrations,
            render_timeout,
        }
    }

    /// Dispatch `samples` jobs for the session and wait for all terminal
    /// results (or the first link error). The wait is bounded by the
    /// configured render timeout.
    pub async fn render(&self, session_id: &str, samples: usize) -> Result<RenderOutcome> {
        let (tx, rx) = mpsc::channel(samples.max(1));

        for _ in 0..samples {
            let render_id = self.dispatch_one(session_id).await?;
            self.registrations
                .send(WaiterRegistration {
                    render_id,
                    begin: Instant::now(),
                    tx: tx.clone(),
                })
                .await
                .map_err(|_| anyhow!("ack listener is not running"))?;
        }
        drop(tx);

        match time::timeout(self.render_timeout, collect_results(rx, samples)).await {
            Ok(outcome) => outcome,
            Err(_) => bail!(
                "render for session {session_id} timed out after {:?}",
                self.render_timeout
            ),
        }
    }

    async fn dispatch_one(&self, session_id: &str) -> Result<String> {
        let snapshot = self
            .store
            .snapshot_session(session_id)
            .await
            .context("session snapshot failed")?
            .ok_or_else(|| anyhow!("session {session_id} deleted during dispatch"))?;

        let render_id = next_render_id();
        self.store
            .retain_resources(&snapshot.resources)
            .await
            .context("failed to pin job resources")?;

        let job = RenderJob {
            render_id: render_id.clone(),
            session_id: session_id.to_string(),
            input_json: snapshot.input_json,
            resources: snapshot.resources,
        };
        self.store
            .enqueue_job(&job)
            .await
            .context("failed to enqueue render job")?;

        debug!(render_id = %job.render_id, session = %session_id, "job dispatched");
        Ok(render_id)
    }
}

async fn collect_results(
    mut rx: mpsc::Receiver<SampleResult>,
    samples: usize,
) -> Result<RenderOutcome> {
    let mut images = Vec::with_capacity(samples);
    for _ in 0..samples {
        match rx.recv().await {
            Some(SampleResult::Image(bytes)) => images.push(bytes),
            Some(SampleResult::LinkError(log)) => return Ok(RenderOutcome::LinkError(log)),
            Some(SampleResult::Failed(message)) => bail!(message),
            None => bail!("ack listener dropped the result channel"),
        }
    }
    Ok(RenderOutcome::Images(images))
}

/// Render ids are time-derived and unique per the clock's nanosecond
/// resolution; the worker also derives its RNG seed from them.
fn next_render_id() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_string()
}

/// Spawn the single ack-listener task and hand back the registration side.
pub fn spawn_ack_listener(
    store: Store,
    latency_tx: mpsc::Sender<Duration>,
) -> mpsc::Sender<WaiterRegistration> {
    let (reg_tx, reg_rx) = mpsc::channel(256);
    tokio::spawn(ack_listener(store, reg_rx, latency_tx));
    reg_tx
}

async fn ack_listener(
    store: Store,
    mut registrations: mpsc::Receiver<WaiterRegistration>,
    latency_tx: mpsc::Sender<Duration>,
) {
    let mut consumer = loop {
        match store.consumer().await {
            Ok(consumer) => break consumer,
            Err(err) => {
                error!(%err, "ack consumer connect failed");
                time::sleep(Duration::from_secs(5)).await;
            }
        }
    };

    let mut waiters: HashMap<String, Waiter> = HashMap::new();

    loop {
        let popped = consumer.pop_ack(ACK_POLL_SECS).await;

        // Register before demultiplexing so a fast worker's ack cannot
        // outrun its own waiter.
        while let Ok(registration) = registrations.try_recv() {
            waiters.insert(
                registration.render_id,
                Waiter {
                    begin: registration.begin,
                    tx: registration.tx,
                },
            );
        }

        let ack = match popped {
            Ok(Some(ack)) => ack,
            Ok(None) => {
                // Idle poll: shed waiters whose request has gone away
                // (timed out or the client hung up).
                waiters.retain(|_, waiter| !waiter.tx.is_closed());
                continue;
            }
            // A payload that fails to decode is dropped; only connection
            // trouble backs off.
            Err(err) if matches!(err, prism_store::StoreError::Payload(_)) => {
                warn!(%err, "malformed ack payload, dropped");
                continue;
            }
            Err(err) => {
                error!(%err, "ack queue read failed");
                time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        let Some(waiter) = waiters.remove(&ack.render_id) else {
            warn!(render_id = %ack.render_id, "ack for unknown render, dropped");
            continue;
        };

        match ack.status {
            AckStatus::Start => {
                let _ = latency_tx.send(waiter.begin.elapsed()).await;
                // Not terminal; the waiter stays registered.
                waiters.insert(ack.render_id, waiter);
            }
            AckStatus::Ok => {
                let result = match store.take_render_image(&ack.render_id).await {
                    Ok(Some(bytes)) => SampleResult::Image(bytes),
                    Ok(None) => {
                        SampleResult::Failed(format!("render image {} missing", ack.render_id))
                    }
                    Err(err) => SampleResult::Failed(format!(
                        "failed to fetch render image {}: {err}",
                        ack.render_id
                    )),
                };
                if waiter.tx.send(result).await.is_err() {
                    debug!(render_id = %ack.render_id, "waiter gone before result delivery");
                }
            }
            AckStatus::LinkError => {
                let log = ack.log.unwrap_or_default();
                if waiter
                    .tx
                    .send(SampleResult::LinkError(log))
                    .await
                    .is_err()
                {
                    debug!(render_id = %ack.render_id, "waiter gone before link error delivery");
                }
            }
            AckStatus::Unknown => {
                warn!(render_id = %ack.render_id, "ack with unknown status, dropped");
                waiters.insert(ack.render_id, waiter);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_ids_are_monotonic_nanoseconds() {
        let a: u128 = next_render_id().parse().unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let b: u128 = next_render_id().parse().unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn collect_short_circuits_on_link_error() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(SampleResult::Image(vec![1])).await.unwrap();
        tx.send(SampleResult::LinkError("missing mesh".into()))
            .await
            .unwrap();

        let outcome = collect_results(rx, 4).await.unwrap();
        assert!(matches!(
            outcome,
            RenderOutcome::LinkError(log) if log == "missing mesh"
        ));
    }

    #[tokio::test]
    async fn collect_gathers_all_images() {
        let (tx, rx) = mpsc::channel(2);
        tx.send(SampleResult::Image(vec![1])).await.unwrap();
        tx.send(SampleResult::Image(vec![2])).await.unwrap();
        drop(tx);

        match collect_results(rx, 2).await.unwrap() {
            RenderOutcome::Images(images) => assert_eq!(images.len(), 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn collect_fails_when_listener_goes_away() {
        let (tx, rx) = mpsc::channel::<SampleResult>(1);
        drop(tx);
        assert!(collect_results(rx, 1).await.is_err());
    }
}
