//! Launch scripts for the NRP backend and the SSH tunnel to its frontend.
//!
//! Rendered once per allocation, before the sweep, into the result
//! directory. The job script starts them on the node printed by
//! `nrpbench prepare`.

use crate::scheduler::render_template;
use anyhow::{Context, Result};
use bench_core::artifacts::{
    atomic_write_bytes, ensure_dir, MANIFEST_FILE, NRP_LOG_DIR, NRP_SCRIPT_FILE, TUNNEL_SCRIPT_FILE,
};
use bench_core::{BenchError, RunConfig, SlurmEnv};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchScripts {
    /// First allocated node; the NRP runs there.
    pub nrp_node: String,
    pub written: Vec<PathBuf>,
}

/// Placeholder values shared by both launch templates.
pub fn launch_values(
    config: &RunConfig,
    env: &SlurmEnv,
    log_dir: &Path,
) -> Result<BTreeMap<&'static str, String>> {
    let mut values = BTreeMap::new();
    values.insert("nest_master_node", env.nest_master()?.to_string());
    values.insert("nodezero", env.nrp_node()?.to_string());
    values.insert("nrplogdir", log_dir.display().to_string());
    values.insert("jobid", env.job_id.clone());
    values.insert("account", env.account.clone());
    values.insert("port", config.nest.port.to_string());
    if let Some(keyfile) = &config.nrp.tunnel_keyfile {
        values.insert("tunnel_keyfile", keyfile.display().to_string());
    }
    if let Some(ip) = &config.nrp.tunnel_ip {
        values.insert("tunnel_ip", ip.clone());
    }
    Ok(values)
}

/// Renders `nrp.sh`, and `tunnel.sh` when a tunnel is configured, into
/// `result_dir`. Re-running overwrites earlier scripts; a directory that
/// already holds a run is refused.
pub fn prepare_launch_scripts(
    config: &RunConfig,
    env: &SlurmEnv,
    result_dir: &Path,
) -> Result<LaunchScripts> {
    if result_dir.join(MANIFEST_FILE).exists() {
        return Err(BenchError::config(result_dir, "output directory already holds a run").into());
    }
    let log_dir = result_dir.join(NRP_LOG_DIR);
    ensure_dir(&log_dir)?;
    let values = launch_values(config, env, &log_dir)?;

    let mut targets = vec![(&config.nrp.nrp_template, NRP_SCRIPT_FILE)];
    if config.nrp.tunnel_ip.is_some() {
        targets.push((&config.nrp.tunnel_template, TUNNEL_SCRIPT_FILE));
    } else {
        debug!("no tunnel configured");
    }

    let mut written = Vec::new();
    for (template, name) in targets {
        let text = fs::read_to_string(template)
            .with_context(|| format!("reading launch template {}", template.display()))?;
        let out = result_dir.join(name);
        atomic_write_bytes(&out, render_template(&text, &values).as_bytes())?;
        info!(script = %out.display(), "rendered launch script");
        written.push(out);
    }
    Ok(LaunchScripts {
        nrp_node: env.nrp_node()?.to_string(),
        written,
    })
}
