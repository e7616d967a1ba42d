//! Run configuration and secrets.
//!
//! Both files are YAML and must be readable by their owner only (mode
//! `0600`); anything else is rejected before a single job step starts.

use crate::error::{BenchError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const HOME_PLACEHOLDER: &str = "$HOME";
const REDACTED: &str = "********";

/// Workload variant run at every sweep point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCase {
    /// Network script sent straight to NEST Server, no NRP involved.
    HpcbenchBaseline,
    /// NRP experiment without transfer functions.
    HpcbenchNotf,
    /// NRP experiment with a spike-reading transfer function.
    HpcbenchReadspikes,
}

impl TestCase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestCase::HpcbenchBaseline => "hpcbench_baseline",
            TestCase::HpcbenchNotf => "hpcbench_notf",
            TestCase::HpcbenchReadspikes => "hpcbench_readspikes",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TestCase::HpcbenchBaseline => "NEST standalone",
            TestCase::HpcbenchNotf => "NRP+NEST, no TF",
            TestCase::HpcbenchReadspikes => "NRP+NEST, spike-reading TF",
        }
    }

    /// Whether the variant runs through the robotics co-simulation.
    pub fn involves_robot(&self) -> bool {
        !matches!(self, TestCase::HpcbenchBaseline)
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub testcase: TestCase,
    /// Task counts to sweep. Empty means "derive from the allocation size".
    #[serde(default)]
    pub n_tasks: Vec<u32>,
    #[serde(default = "default_repetitions")]
    pub repetitions: u32,
    pub n_cycles_nest: u32,
    /// Biological time advanced by each simulate call, in ms.
    #[serde(default = "default_simtime")]
    pub nest_simtime: f64,
    #[serde(default = "default_tasks_per_node")]
    pub tasks_per_node: u32,
    pub datadir: PathBuf,
    #[serde(default)]
    pub nest: NestSection,
    #[serde(default)]
    pub nrp: NrpSection,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default = "default_secrets")]
    pub secrets: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NestSection {
    #[serde(default = "default_nest_port")]
    pub port: u16,
    /// Overrides the `http://<nest master>:<port>` endpoint.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_nest_script")]
    pub script: PathBuf,
    #[serde(default = "default_job_template")]
    pub job_template: PathBuf,
}

impl Default for NestSection {
    fn default() -> Self {
        Self {
            port: default_nest_port(),
            url: None,
            script: default_nest_script(),
            job_template: default_job_template(),
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NrpSection {
    #[serde(default)]
    pub frontend: Option<String>,
    /// Simulation backend; the frontend address is used when unset.
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub experiments: BTreeMap<TestCase, PathBuf>,
    #[serde(default = "default_profiler")]
    pub profiler: String,
    #[serde(default = "default_profile_file")]
    pub profile_file: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Launch script of the NRP backend, rendered into `<datadir>/nrp.sh`.
    #[serde(default = "default_nrp_template")]
    pub nrp_template: PathBuf,
    #[serde(default = "default_tunnel_template")]
    pub tunnel_template: PathBuf,
    /// SSH tunnel to the frontend; `tunnel.sh` is only rendered when set.
    #[serde(default)]
    pub tunnel_keyfile: Option<PathBuf>,
    #[serde(default)]
    pub tunnel_ip: Option<String>,
}

impl Default for NrpSection {
    fn default() -> Self {
        Self {
            frontend: None,
            backend: None,
            experiments: BTreeMap::new(),
            profiler: default_profiler(),
            profile_file: default_profile_file(),
            username: None,
            password: None,
            nrp_template: default_nrp_template(),
            tunnel_template: default_tunnel_template(),
            tunnel_keyfile: None,
            tunnel_ip: None,
        }
    }
}

impl fmt::Debug for NrpSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NrpSection")
            .field("frontend", &self.frontend)
            .field("backend", &self.backend)
            .field("experiments", &self.experiments)
            .field("profiler", &self.profiler)
            .field("profile_file", &self.profile_file)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| REDACTED))
            .field("nrp_template", &self.nrp_template)
            .field("tunnel_template", &self.tunnel_template)
            .field("tunnel_keyfile", &self.tunnel_keyfile)
            .field("tunnel_ip", &self.tunnel_ip)
            .finish()
    }
}

/// Fixed waits of the lifecycle, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Timeouts {
    pub nest_startup: f64,
    pub metadata_settle: f64,
    pub step_teardown: f64,
    pub experiment_settle: f64,
    pub run_timeout: f64,
    pub poll_interval: f64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            nest_startup: 10.0,
            metadata_settle: 10.0,
            step_teardown: 30.0,
            experiment_settle: 30.0,
            run_timeout: 600.0,
            poll_interval: 0.5,
        }
    }
}

impl Timeouts {
    pub fn nest_startup(&self) -> Duration {
        secs(self.nest_startup)
    }
    pub fn metadata_settle(&self) -> Duration {
        secs(self.metadata_settle)
    }
    pub fn step_teardown(&self) -> Duration {
        secs(self.step_teardown)
    }
    pub fn experiment_settle(&self) -> Duration {
        secs(self.experiment_settle)
    }
    pub fn run_timeout(&self) -> Duration {
        secs(self.run_timeout)
    }
    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval)
    }
}

fn secs(v: f64) -> Duration {
    Duration::from_secs_f64(v.max(0.0))
}

fn default_repetitions() -> u32 {
    1
}
fn default_simtime() -> f64 {
    20.0
}
fn default_tasks_per_node() -> u32 {
    2
}
fn default_nest_port() -> u16 {
    5000
}
fn default_nest_script() -> PathBuf {
    PathBuf::from("hpcbench_baseline.py")
}
fn default_job_template() -> PathBuf {
    PathBuf::from("misc/nest.sh.tpl")
}
fn default_nrp_template() -> PathBuf {
    PathBuf::from("misc/nrp.sh.tpl")
}
fn default_tunnel_template() -> PathBuf {
    PathBuf::from("misc/tunnel.sh.tpl")
}
fn default_profiler() -> String {
    "cle_step".to_string()
}
fn default_profile_file() -> String {
    "cle_time_profile.csv".to_string()
}
fn default_secrets() -> PathBuf {
    PathBuf::from("secrets.yaml")
}

#[derive(Clone, PartialEq, Deserialize)]
pub struct Secrets {
    pub hbp_username: String,
    pub hbp_password: String,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("hbp_username", &self.hbp_username)
            .field("hbp_password", &REDACTED)
            .finish()
    }
}

/// One element of the sweep together with the directory owning its artifacts.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPoint {
    pub tasks: u32,
    pub nodes: u32,
    pub dir: PathBuf,
}

pub fn sweep_dir_name(tasks: u32) -> String {
    format!("{:02}tasks", tasks)
}

pub fn nodes_for_tasks(tasks: u32, tasks_per_node: u32) -> u32 {
    let per_node = tasks_per_node.max(1);
    tasks.div_ceil(per_node)
}

/// Powers of two whose node footprint fits next to the NRP node.
pub fn default_sweep(nnodes: usize, tasks_per_node: u32) -> Vec<u32> {
    let available = nnodes.saturating_sub(1) as u32;
    (0..31)
        .map(|x| 1u32 << x)
        .take_while(|&t| nodes_for_tasks(t, tasks_per_node) <= available)
        .collect()
}

impl RunConfig {
    /// Fills an empty sweep from the allocation size.
    pub fn resolve_sweep(&mut self, nnodes: usize) {
        if self.n_tasks.is_empty() {
            self.n_tasks = default_sweep(nnodes, self.tasks_per_node);
            debug!(n_tasks = ?self.n_tasks, nnodes, "derived sweep from allocation");
        }
    }

    pub fn sweep_points(&self, rep_dir: &Path) -> Vec<SweepPoint> {
        self.n_tasks
            .iter()
            .map(|&tasks| SweepPoint {
                tasks,
                nodes: nodes_for_tasks(tasks, self.tasks_per_node),
                dir: rep_dir.join(sweep_dir_name(tasks)),
            })
            .collect()
    }

    pub fn experiment_path(&self) -> Option<&Path> {
        self.nrp.experiments.get(&self.testcase).map(|p| p.as_path())
    }

    /// Copy safe to persist next to the results.
    pub fn redacted(&self) -> RunConfig {
        let mut copy = self.clone();
        if copy.nrp.password.is_some() {
            copy.nrp.password = Some(REDACTED.to_string());
        }
        copy
    }

    pub fn validate(&self, path: &Path) -> Result<()> {
        let mut problems = Vec::new();
        if self.n_tasks.iter().any(|&n| n == 0) {
            problems.push("n_tasks values must be positive".to_string());
        }
        if self.repetitions == 0 {
            problems.push("repetitions must be at least 1".to_string());
        }
        if self.n_cycles_nest == 0 {
            problems.push("n_cycles_nest must be at least 1".to_string());
        }
        if self.tasks_per_node == 0 {
            problems.push("tasks_per_node must be at least 1".to_string());
        }
        if self.nest_simtime.is_nan() || self.nest_simtime <= 0.0 {
            problems.push("nest_simtime must be positive".to_string());
        }
        if self.testcase.involves_robot() {
            if self.nrp.frontend.as_deref().map_or(true, str::is_empty) {
                problems.push(format!("testcase {} requires nrp.frontend", self.testcase));
            }
            if self.experiment_path().is_none() {
                problems.push(format!(
                    "testcase {} requires nrp.experiments.{}",
                    self.testcase, self.testcase
                ));
            }
        }
        if self.nrp.tunnel_keyfile.is_some() != self.nrp.tunnel_ip.is_some() {
            problems.push("nrp.tunnel_keyfile and nrp.tunnel_ip go together".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(BenchError::config(path, problems.join("; ")))
        }
    }

    fn resolve_relative_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.nest.script);
        resolve(&mut self.nest.job_template);
        resolve(&mut self.secrets);
        resolve(&mut self.nrp.nrp_template);
        resolve(&mut self.nrp.tunnel_template);
        for path in self.nrp.experiments.values_mut() {
            resolve(path);
        }
    }
}

/// Loads a run config, expanding `$HOME` from the process environment.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    let home = std::env::var("HOME").ok();
    load_config_with_home(path, home.as_deref())
}

pub fn load_config_with_home(path: &Path, home: Option<&str>) -> Result<RunConfig> {
    let raw = read_owner_only(path)?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&raw).map_err(|e| BenchError::config(path, e.to_string()))?;
    if value.get("n_nodes").is_some() {
        return Err(BenchError::config(
            path,
            "node-count sweeps are not supported; express the sweep as n_tasks",
        ));
    }
    let mut config: RunConfig =
        serde_yaml::from_value(value).map_err(|e| BenchError::config(path, e.to_string()))?;

    let datadir = config.datadir.to_string_lossy().to_string();
    if datadir.contains(HOME_PLACEHOLDER) {
        let home = home.ok_or_else(|| {
            BenchError::config(path, "datadir uses $HOME but HOME is not set")
        })?;
        config.datadir = PathBuf::from(datadir.replace(HOME_PLACEHOLDER, home));
    }

    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    config.resolve_relative_paths(base);
    config.validate(path)?;
    debug!(path = %path.display(), testcase = %config.testcase, "loaded config");
    Ok(config)
}

pub fn load_secrets(path: &Path) -> Result<Secrets> {
    let raw = read_owner_only(path)?;
    serde_yaml::from_str(&raw).map_err(|e| BenchError::config(path, e.to_string()))
}

/// Credentials for the NRP: the secrets file wins, inline `nrp.username` /
/// `nrp.password` are the fallback. Baseline runs need none.
pub fn resolve_secrets(config: &RunConfig) -> Result<Option<Secrets>> {
    if !config.testcase.involves_robot() {
        return Ok(None);
    }
    if config.secrets.exists() {
        return load_secrets(&config.secrets).map(Some);
    }
    match (&config.nrp.username, &config.nrp.password) {
        (Some(user), Some(password)) => Ok(Some(Secrets {
            hbp_username: user.clone(),
            hbp_password: password.clone(),
        })),
        _ => Err(BenchError::config(
            &config.secrets,
            "cannot open secrets file and no inline nrp credentials given",
        )),
    }
}

fn read_owner_only(path: &Path) -> Result<String> {
    if !path.is_file() {
        return Err(BenchError::config(path, "file does not exist"));
    }
    check_owner_only(path)?;
    fs::read_to_string(path).map_err(|e| BenchError::io(path, e))
}

#[cfg(unix)]
fn check_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)
        .map_err(|e| BenchError::io(path, e))?
        .permissions()
        .mode()
        & 0o777;
    if mode != 0o600 {
        return Err(BenchError::config(
            path,
            format!(
                "permissions {:o} too open, run 'chmod 600 {}'",
                mode,
                path.display()
            ),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}
