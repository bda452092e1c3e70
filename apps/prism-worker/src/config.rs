use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Name this worker pings and receives control commands under.
    pub worker_name: String,
    pub redis_url: String,
    /// External renderer executable.
    pub renderer_path: PathBuf,
    /// Root for the local resource cache and per-job sandboxes.
    pub work_dir: PathBuf,
    pub ping_interval: Duration,
    pub cache_sweep_interval: Duration,
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(name)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let Ok(worker_name) = env::var("WORKER_NAME") else {
            bail!("WORKER_NAME must be set");
        };
        let Ok(redis_url) = env::var("REDIS_URL") else {
            bail!("REDIS_URL must be set");
        };

        Ok(Self {
            worker_name,
            redis_url,
            renderer_path: env::var("RENDERER_PATH")
                .unwrap_or_else(|_| "/usr/local/bin/prism-render".to_string())
                .into(),
            work_dir: env::var("PRISM_WORK_DIR")
                .unwrap_or_else(|_| "/tmp/prism".to_string())
                .into(),
            ping_interval: env_secs("PING_INTERVAL_SECS", 60),
            cache_sweep_interval: env_secs("CACHE_SWEEP_INTERVAL_SECS", 600),
        })
    }
}
