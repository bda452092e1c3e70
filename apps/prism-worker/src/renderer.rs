//! Invocation of the external renderer executable.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::process::Command;

use prism_proto::RenderJob;

use crate::sandbox::Sandbox;

/// What one renderer run produced.
#[derive(Debug)]
pub enum RenderOutput {
    Image(Vec<u8>),
    /// The renderer exited nonzero; scene resolution failed. Carries the
    /// combined stdout/stderr as the diagnostic log.
    LinkError(String),
}

/// Stochastic seed for one sample, derived from the time-based render id
/// and masked to 30 bits so every sample of a request renders a different
/// noise pattern.
pub fn seed_for(render_id: &str) -> u32 {
    render_id
        .parse::<u128>()
        .map(|nanos| (nanos & ((1 << 30) - 1)) as u32)
        .unwrap_or(0)
}

pub async fn invoke(renderer: &Path, sandbox: &Sandbox, job: &RenderJob) -> Result<RenderOutput> {
    let output_path = sandbox.root.join(format!("{}.jpg", job.render_id));

    let output = Command::new(renderer)
        .arg(format!("--session={}", job.render_id))
        .arg(format!("--resource_basepath={}", sandbox.root.display()))
        .arg(format!("--seed={}", seed_for(&job.render_id)))
        .arg(format!("--output={}", output_path.display()))
        .arg(&sandbox.scene_path)
        .output()
        .await
        .context("failed to spawn renderer")?;

    if !output.status.success() {
        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));
        return Ok(RenderOutput::LinkError(log));
    }

    let jpeg = tokio::fs::read(&output_path)
        .await
        .context("renderer exited cleanly but produced no output image")?;
    Ok(RenderOutput::Image(jpeg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_is_the_low_thirty_bits_of_the_render_id() {
        assert_eq!(seed_for("0"), 0);
        assert_eq!(seed_for("1073741823"), (1 << 30) - 1);
        // 2^30 wraps to zero.
        assert_eq!(seed_for("1073741824"), 0);
        let nanos = "1407811200123456789";
        let expected = (nanos.parse::<u128>().unwrap() & ((1 << 30) - 1)) as u32;
        assert_eq!(seed_for(nanos), expected);
    }

    #[test]
    fn unparsable_render_id_falls_back_to_zero() {
        assert_eq!(seed_for("not-a-number"), 0);
    }
}
