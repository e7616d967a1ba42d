//! SLURM job steps: launch, cancel, accounting.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

pub const SACCT_FORMAT: &str = "--format=Elapsed,AveRSS,MaxRSS,ConsumedEnergy";

/// Scheduler-tracked sub-allocation running the NEST server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStep {
    pub id: String,
}

/// Seam between the lifecycle controller and the batch scheduler.
pub trait Scheduler {
    /// Starts `script` as a detached job step and returns its id.
    fn launch_step(&mut self, script: &Path) -> Result<JobStep>;
    fn cancel_step(&mut self, step: &JobStep) -> Result<()>;
    /// Raw pipe-delimited accounting output for `step`.
    fn accounting(&self, step: &JobStep) -> Result<String>;
}

pub struct SlurmScheduler {
    job_id: String,
    next_step: u32,
    children: BTreeMap<String, Child>,
}

impl SlurmScheduler {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            next_step: 0,
            children: BTreeMap::new(),
        }
    }
}

impl Scheduler for SlurmScheduler {
    fn launch_step(&mut self, script: &Path) -> Result<JobStep> {
        let child = Command::new("bash")
            .arg(script)
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning job step script {}", script.display()))?;
        let step = JobStep {
            id: format!("{}.{}", self.job_id, self.next_step),
        };
        self.next_step += 1;
        info!(step = %step.id, pid = child.id(), "launched job step");
        self.children.insert(step.id.clone(), child);
        Ok(step)
    }

    fn cancel_step(&mut self, step: &JobStep) -> Result<()> {
        let status = Command::new("scancel")
            .arg(&step.id)
            .status()
            .context("running scancel")?;
        if !status.success() {
            return Err(anyhow!("scancel {} exited with {}", step.id, status));
        }
        if let Some(mut child) = self.children.remove(&step.id) {
            match child.try_wait() {
                Ok(Some(exit)) => debug!(step = %step.id, %exit, "job step launcher exited"),
                Ok(None) => {
                    debug!(step = %step.id, "job step launcher still running, waiting");
                    let _ = child.wait();
                }
                Err(e) => warn!(step = %step.id, error = %e, "could not reap job step launcher"),
            }
        }
        Ok(())
    }

    fn accounting(&self, step: &JobStep) -> Result<String> {
        let output = Command::new("sacct")
            .args(["-j", &step.id, "-p", "--noheader", SACCT_FORMAT])
            .output()
            .context("running sacct")?;
        if !output.status.success() {
            return Err(anyhow!(
                "sacct -j {} exited with {}: {}",
                step.id,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Substitutes `{key}` placeholders; other braces (shell `${VAR}`) are kept.
pub fn render_template(template: &str, values: &BTreeMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}
