use std::env;
use std::time::Duration;

use anyhow::{bail, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    /// Upper bound on how long a render request waits for all of its
    /// samples before failing the HTTP caller.
    pub render_timeout: Duration,
    pub fleet: FleetConfig,
}

/// Fleet-manager tunables, lifted out of constants so tests can override
/// each knob.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Base URL of the provisioning API that creates and deletes worker
    /// instances.
    pub provision_url: String,
    pub instance_min: usize,
    pub instance_max: usize,
    /// How many instances one autoscale step adds or removes.
    pub instance_adjust_num: usize,
    /// A worker whose creation and last ping are both older than this is a
    /// zombie.
    pub instance_timeout: Duration,
    pub instance_list_interval: Duration,
    pub instance_adjust_interval: Duration,
    /// Average dispatch latency above this grows the fleet.
    pub latency_upper: Duration,
    /// Average dispatch latency below this shrinks it.
    pub latency_lower: Duration,
    /// Pause between consecutive instance-creation calls.
    pub create_stagger: Duration,
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(env_u64(name, default))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let Ok(provision_url) = env::var("PROVISION_URL") else {
            bail!("PROVISION_URL must be set");
        };

        Ok(Self {
            port: env::var("PRISM_MASTER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            render_timeout: env_secs("RENDER_TIMEOUT_SECS", 300),
            fleet: FleetConfig {
                provision_url,
                instance_min: env_u64("INSTANCE_MIN", 1) as usize,
                instance_max: env_u64("INSTANCE_MAX", 16) as usize,
                instance_adjust_num: env_u64("INSTANCE_ADJUST_NUM", 2) as usize,
                instance_timeout: env_secs("INSTANCE_TIMEOUT_SECS", 300),
                instance_list_interval: env_secs("INSTANCE_LIST_INTERVAL_SECS", 60),
                instance_adjust_interval: env_secs("INSTANCE_ADJUST_INTERVAL_SECS", 120),
                latency_upper: Duration::from_millis(env_u64("LATENCY_UPPER_MS", 5_000)),
                latency_lower: Duration::from_millis(env_u64("LATENCY_LOWER_MS", 1_000)),
                create_stagger: env_secs("INSTANCE_CREATE_STAGGER_SECS", 2),
            },
        })
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            provision_url: "http://localhost:9090".to_string(),
            instance_min: 1,
            instance_max: 16,
            instance_adjust_num: 2,
            instance_timeout: Duration::from_secs(300),
            instance_list_interval: Duration::from_secs(60),
            instance_adjust_interval: Duration::from_secs(120),
            latency_upper: Duration::from_millis(5_000),
            latency_lower: Duration::from_millis(1_000),
            create_stagger: Duration::from_secs(2),
        }
    }
}
