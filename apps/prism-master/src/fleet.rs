//! Fleet manager: worker bookkeeping, zombie reaping, and the autoscale
//! control loop.
//!
//! All mutable fleet state is owned by the single task inside
//! [`FleetManager::run`]; everything else talks to it through channels or
//! the fleet command queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use prism_proto::{FleetCommand, WorkerCommand};
use prism_store::Store;

use crate::config::FleetConfig;
use crate::provision::InstanceProvider;

const COMMAND_POLL_SECS: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub name: String,
    pub created_at: Instant,
    /// `None` until the first ping arrives.
    pub last_ping_at: Option<Instant>,
    /// Set once a stop command has been queued; never signaled twice.
    pub stopped: bool,
}

impl WorkerRecord {
    fn new(name: String, now: Instant) -> Self {
        Self {
            name,
            created_at: now,
            last_ping_at: None,
            stopped: false,
        }
    }
}

pub struct FleetManager {
    config: FleetConfig,
    provider: Arc<dyn InstanceProvider>,
    store: Store,
    workers: HashMap<String, WorkerRecord>,
    latency_sum: Duration,
    latency_count: u32,
}

impl FleetManager {
    pub fn new(config: FleetConfig, provider: Arc<dyn InstanceProvider>, store: Store) -> Self {
        Self {
            config,
            provider,
            store,
            workers: HashMap::new(),
            latency_sum: Duration::ZERO,
            latency_count: 0,
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<FleetCommand>,
        mut latencies: mpsc::Receiver<Duration>,
    ) {
        info!(
            min = self.config.instance_min,
            max = self.config.instance_max,
            "fleet manager started"
        );

        // Reconcile right away; hold the first autoscale for a full cycle
        // so it sees a populated worker list.
        let mut list_timer = time::interval(self.config.instance_list_interval);
        let mut adjust_timer = time::interval_at(
            Instant::now() + self.config.instance_adjust_interval,
            self.config.instance_adjust_interval,
        );

        loop {
            tokio::select! {
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(sample) = latencies.recv() => {
                    self.latency_sum += sample;
                    self.latency_count += 1;
                }
                _ = list_timer.tick() => self.reconcile().await,
                _ = adjust_timer.tick() => self.autoscale().await,
            }
        }
    }

    async fn handle_command(&mut self, command: FleetCommand) {
        match command {
            FleetCommand::Ping { worker } => match self.workers.get_mut(&worker) {
                Some(record) => record.last_ping_at = Some(Instant::now()),
                None => {
                    info!(%worker, "ping from unknown worker, waiting for list reconciliation");
                }
            },
            FleetCommand::Create { count } => self.spawn_create(count as usize),
            FleetCommand::RestartWorkers => {
                info!(workers = self.workers.len(), "restarting all workers");
                for name in self.workers.keys() {
                    if let Err(err) = self
                        .store
                        .push_worker_command(name, WorkerCommand::Restart)
                        .await
                    {
                        warn!(worker = %name, %err, "failed to queue restart");
                    }
                }
            }
        }
    }

    /// Fetch the live instance list and fold it into the worker map, then
    /// reap zombies. An empty fleet triggers an immediate autoscale cycle.
    async fn reconcile(&mut self) {
        let listed = match self.provider.list_instances().await {
            Ok(listed) => listed,
            Err(err) => {
                warn!(%err, "instance list fetch failed");
                return;
            }
        };

        let now = Instant::now();
        self.workers = reconcile_records(std::mem::take(&mut self.workers), &listed, now);
        debug!(known = self.workers.len(), "worker list reconciled");

        if self.workers.is_empty() {
            self.autoscale().await;
        }
        self.sweep_zombies(now);
    }

    /// Deletions run off-loop; the next reconciliation observes the result.
    fn sweep_zombies(&self, now: Instant) {
        let zombies: Vec<String> = self
            .workers
            .values()
            .filter(|record| is_zombie(record, now, self.config.instance_timeout))
            .map(|record| record.name.clone())
            .collect();
        if zombies.is_empty() {
            return;
        }

        let provider = self.provider.clone();
        tokio::spawn(async move {
            for name in zombies {
                warn!(worker = %name, "deleting zombie worker");
                if let Err(err) = provider.delete_instance(&name).await {
                    warn!(worker = %name, %err, "zombie deletion failed");
                }
            }
        });
    }

    async fn autoscale(&mut self) {
        let average = self.take_average();
        let current = self.workers.len();
        let desired = scale_decision(&self.config, current, average);
        debug!(current, desired, ?average, "autoscale cycle");

        if desired > current {
            self.spawn_create(desired - current);
        } else if desired < current {
            self.stop_workers(current - desired).await;
        }
    }

    /// The accumulator resets every cycle; a cycle with no samples means an
    /// idle fleet.
    fn take_average(&mut self) -> Option<Duration> {
        let average = (self.latency_count > 0).then(|| self.latency_sum / self.latency_count);
        self.latency_sum = Duration::ZERO;
        self.latency_count = 0;
        average
    }

    fn spawn_create(&self, count: usize) {
        if count == 0 {
            return;
        }
        let provider = self.provider.clone();
        let stagger = self.config.create_stagger;
        tokio::spawn(async move {
            for index in 0..count {
                if index > 0 {
                    time::sleep(stagger).await;
                }
                let name = worker_instance_name();
                info!(worker = %name, "creating worker instance");
                if let Err(err) = provider.create_instance(&name).await {
                    warn!(worker = %name, %err, "worker instance creation failed");
                }
            }
        });
    }

    async fn stop_workers(&mut self, count: usize) {
        for name in stop_candidates(&self.workers, count) {
            match self
                .store
                .push_worker_command(&name, WorkerCommand::Stop)
                .await
            {
                Ok(()) => {
                    if let Some(record) = self.workers.get_mut(&name) {
                        record.stopped = true;
                    }
                    info!(worker = %name, "stop command queued");
                }
                Err(err) => warn!(worker = %name, %err, "failed to queue stop"),
            }
        }
    }
}

/// Forward tokens from the fleet command queue into the manager's mailbox.
pub fn spawn_command_poller(store: Store) -> mpsc::Receiver<FleetCommand> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut consumer = loop {
            match store.consumer().await {
                Ok(consumer) => break consumer,
                Err(err) => {
                    error!(%err, "fleet command consumer connect failed");
                    time::sleep(Duration::from_secs(5)).await;
                }
            }
        };
        loop {
            match consumer.pop_master_command(COMMAND_POLL_SECS).await {
                Ok(Some(token)) => match FleetCommand::parse(&token) {
                    Some(command) => {
                        if tx.send(command).await.is_err() {
                            return;
                        }
                    }
                    None => warn!(%token, "unrecognized fleet command"),
                },
                Ok(None) => {}
                Err(err) => {
                    error!(%err, "fleet command queue read failed");
                    time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    });
    rx
}

/// Carry over records for instances still listed, start fresh ones for new
/// names, and drop the rest.
fn reconcile_records(
    mut existing: HashMap<String, WorkerRecord>,
    listed: &[String],
    now: Instant,
) -> HashMap<String, WorkerRecord> {
    listed
        .iter()
        .map(|name| {
            let record = existing
                .remove(name)
                .unwrap_or_else(|| WorkerRecord::new(name.clone(), now));
            (name.clone(), record)
        })
        .collect()
}

/// A worker is a zombie when it has been silent past the timeout, measured
/// from whichever of creation or last ping is more recent. This catches
/// both stuck boots and crashed workers without reaping fresh instances.
fn is_zombie(record: &WorkerRecord, now: Instant, timeout: Duration) -> bool {
    let since_created = now.saturating_duration_since(record.created_at);
    let staleness = match record.last_ping_at {
        Some(ping) => since_created.min(now.saturating_duration_since(ping)),
        None => since_created,
    };
    staleness > timeout
}

/// Desired worker count for this cycle. No samples means nothing was
/// dispatched, so an idle fleet shrinks by default.
fn scale_decision(config: &FleetConfig, current: usize, average: Option<Duration>) -> usize {
    let step = config.instance_adjust_num;
    let desired = match average {
        None => current.saturating_sub(step),
        Some(avg) if avg > config.latency_upper => current + step,
        Some(avg) if avg < config.latency_lower => current.saturating_sub(step),
        Some(_) => current,
    };
    desired.clamp(config.instance_min, config.instance_max)
}

fn stop_candidates(workers: &HashMap<String, WorkerRecord>, count: usize) -> Vec<String> {
    workers
        .values()
        .filter(|record| !record.stopped)
        .take(count)
        .map(|record| record.name.clone())
        .collect()
}

fn worker_instance_name() -> String {
    format!(
        "render-worker-{}-{:04x}",
        chrono::Utc::now().format("%Y%m%d%H%M%S"),
        rand::random::<u16>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> FleetConfig {
        FleetConfig {
            instance_min: 1,
            instance_max: 10,
            instance_adjust_num: 2,
            latency_upper: Duration::from_millis(5_000),
            latency_lower: Duration::from_millis(1_000),
            ..FleetConfig::default()
        }
    }

    #[test]
    fn idle_fleet_shrinks_by_the_adjust_step() {
        let config = test_config();
        assert_eq!(scale_decision(&config, 3, None), 1);
        // Clamped at the floor.
        assert_eq!(scale_decision(&config, 2, None), 1);
        assert_eq!(scale_decision(&config, 1, None), 1);
    }

    #[test]
    fn slow_dispatch_grows_the_fleet() {
        let config = test_config();
        let slow = Some(Duration::from_millis(8_000));
        assert_eq!(scale_decision(&config, 3, slow), 5);
        // Clamped at the ceiling.
        assert_eq!(scale_decision(&config, 9, slow), 10);
    }

    #[test]
    fn fast_dispatch_shrinks_and_moderate_holds() {
        let config = test_config();
        let fast = Some(Duration::from_millis(200));
        let moderate = Some(Duration::from_millis(3_000));
        assert_eq!(scale_decision(&config, 5, fast), 3);
        assert_eq!(scale_decision(&config, 5, moderate), 5);
        // Threshold values themselves hold steady.
        assert_eq!(scale_decision(&config, 5, Some(config.latency_upper)), 5);
        assert_eq!(scale_decision(&config, 5, Some(config.latency_lower)), 5);
    }

    #[test]
    fn zombie_detection_uses_the_most_recent_sign_of_life() {
        let timeout = Duration::from_secs(300);
        let born = Instant::now();
        let now = born + Duration::from_secs(400);

        // Never pinged and past the timeout: stuck boot.
        let silent = WorkerRecord::new("w1".into(), born);
        assert!(is_zombie(&silent, now, timeout));

        // Old but still pinging: healthy.
        let mut pinging = WorkerRecord::new("w2".into(), born);
        pinging.last_ping_at = Some(now - Duration::from_secs(60));
        assert!(!is_zombie(&pinging, now, timeout));

        // Stopped pinging long ago: crashed.
        let mut crashed = WorkerRecord::new("w3".into(), born);
        crashed.last_ping_at = Some(born + Duration::from_secs(10));
        assert!(is_zombie(&crashed, now, timeout));

        // Fresh instance, no ping yet: still within its boot grace.
        let fresh = WorkerRecord::new("w4".into(), now - Duration::from_secs(30));
        assert!(!is_zombie(&fresh, now, timeout));
    }

    #[test]
    fn reconciliation_carries_known_records_and_drops_missing_ones() {
        let now = Instant::now();
        let mut existing = HashMap::new();
        let mut known = WorkerRecord::new("keep".into(), now - Duration::from_secs(100));
        known.last_ping_at = Some(now - Duration::from_secs(5));
        existing.insert("keep".to_string(), known);
        existing.insert(
            "gone".to_string(),
            WorkerRecord::new("gone".into(), now - Duration::from_secs(100)),
        );

        let listed = vec!["keep".to_string(), "new".to_string()];
        let next = reconcile_records(existing, &listed, now);

        assert_eq!(next.len(), 2);
        assert!(next["keep"].last_ping_at.is_some());
        assert_eq!(next["new"].created_at, now);
        assert!(next["new"].last_ping_at.is_none());
        assert!(!next.contains_key("gone"));
    }

    #[test]
    fn stop_candidates_skip_already_stopped_workers() {
        let now = Instant::now();
        let mut workers = HashMap::new();
        for name in ["a", "b", "c"] {
            let mut record = WorkerRecord::new(name.into(), now);
            record.stopped = name == "a";
            workers.insert(name.to_string(), record);
        }

        let picked = stop_candidates(&workers, 5);
        assert_eq!(picked.len(), 2);
        assert!(!picked.contains(&"a".to_string()));
    }
}
