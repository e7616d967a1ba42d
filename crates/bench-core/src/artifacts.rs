//! Files persisted per sweep point and the helpers that write them.

use crate::error::{BenchError, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

pub const TOTAL_TIME_FILE: &str = "total_time.dat";
pub const EXEC_TIME_FILE: &str = "exec_time.dat";
pub const METADATA_FILE: &str = "metadata.yaml";
pub const JOB_SCRIPT_FILE: &str = "nest.sh";
pub const CONFIG_COPY_FILE: &str = "config.yaml";
pub const CONFIG_DIGEST_FILE: &str = "config.digest";
pub const MANIFEST_FILE: &str = "run_manifest.json";
pub const NRP_SCRIPT_FILE: &str = "nrp.sh";
pub const TUNNEL_SCRIPT_FILE: &str = "tunnel.sh";
pub const NRP_LOG_DIR: &str = "nrplogs";

/// Whether `name` is left in a result directory by the prepare step,
/// before any sweep point runs.
pub fn is_launch_artifact(name: &str) -> bool {
    matches!(name, NRP_SCRIPT_FILE | TUNNEL_SCRIPT_FILE | NRP_LOG_DIR)
}

/// Structured metadata of one sweep point.
///
/// Robot fields only exist for co-simulation variants; the baseline leaves
/// them out of the YAML entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub n_tasks: u32,
    pub n_nodes: u32,
    pub sacct_elapsed: f64,
    pub sacct_averss: f64,
    pub sacct_maxrss: f64,
    #[serde(default)]
    pub sacct_consumedenergy: f64,
    pub nest_time_create: f64,
    pub nest_time_connect: f64,
    pub nest_time_last_simulate: f64,
    pub nest_num_nodes: u64,
    pub nest_num_connections: u64,
    pub nest_num_processes: u64,
    pub nest_local_num_threads: u64,
    pub nest_time_simulated: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nrp_experiment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nrp_cycles: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nrp_time_robot_step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nrp_time_brain_step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nrp_time_brain_refresh: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nrp_time_transfer_function: Option<f64>,
}

impl MetadataRecord {
    /// Fills the robot fields with per-category totals of a profile table.
    pub fn attach_profile(&mut self, experiment: &str, table: &ProfileTable) {
        let totals = table.totals();
        self.nrp_experiment = Some(experiment.to_string());
        self.nrp_cycles = Some(table.rows.len() as u64);
        self.nrp_time_robot_step = Some(totals.robot_step);
        self.nrp_time_brain_step = Some(totals.brain_step);
        self.nrp_time_brain_refresh = Some(totals.brain_refresh);
        self.nrp_time_transfer_function =
            Some(table.rows.iter().map(|r| r.transfer_function()).sum());
    }
}

/// One simulation cycle as reported by the NRP's closed-loop profiler.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProfileRow {
    pub robot_step: f64,
    pub brain_step: f64,
    pub brain_refresh: f64,
    pub total_cycle: f64,
}

impl ProfileRow {
    /// Cycle time not explained by the robot/brain steps, which run
    /// concurrently, and the brain refresh.
    pub fn transfer_function(&self) -> f64 {
        (self.total_cycle - self.robot_step.max(self.brain_step) - self.brain_refresh).max(0.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileTable {
    pub rows: Vec<ProfileRow>,
}

const PROFILE_COLUMNS: [&str; 4] = ["robot_step", "brain_step", "brain_refresh", "total_cycle"];

impl ProfileTable {
    /// Parses a comma-separated table with a header row. Columns may come in
    /// any order; extra columns are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| BenchError::parse("profile table", "empty table"))?;
        let names: Vec<&str> = header.split(',').map(|s| s.trim()).collect();
        let mut idx = [0usize; 4];
        for (slot, wanted) in idx.iter_mut().zip(PROFILE_COLUMNS) {
            *slot = names.iter().position(|n| *n == wanted).ok_or_else(|| {
                BenchError::parse("profile table", format!("missing column '{}'", wanted))
            })?;
        }
        let mut rows = Vec::new();
        for (lineno, line) in lines.enumerate() {
            let fields: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
            let mut values = [0.0f64; 4];
            for (value, &col) in values.iter_mut().zip(idx.iter()) {
                let raw = fields.get(col).ok_or_else(|| {
                    BenchError::parse("profile table", format!("row {} too short", lineno + 1))
                })?;
                *value = raw.parse::<f64>().map_err(|e| {
                    BenchError::parse(
                        "profile table",
                        format!("row {} value '{}': {}", lineno + 1, raw, e),
                    )
                })?;
            }
            rows.push(ProfileRow {
                robot_step: values[0],
                brain_step: values[1],
                brain_refresh: values[2],
                total_cycle: values[3],
            });
        }
        Ok(Self { rows })
    }

    pub fn to_csv(&self) -> String {
        let mut out = format!("{},transfer_function\n", PROFILE_COLUMNS.join(","));
        for row in &self.rows {
            out.push_str(&format!(
                "{},{},{},{},{}\n",
                row.robot_step,
                row.brain_step,
                row.brain_refresh,
                row.total_cycle,
                row.transfer_function()
            ));
        }
        out
    }

    pub fn totals(&self) -> ProfileRow {
        self.rows.iter().fold(ProfileRow::default(), |acc, r| ProfileRow {
            robot_step: acc.robot_step + r.robot_step,
            brain_step: acc.brain_step + r.brain_step,
            brain_refresh: acc.brain_refresh + r.brain_refresh,
            total_cycle: acc.total_cycle + r.total_cycle,
        })
    }

    pub fn means(&self) -> Option<ProfileRow> {
        if self.rows.is_empty() {
            return None;
        }
        let n = self.rows.len() as f64;
        let t = self.totals();
        Some(ProfileRow {
            robot_step: t.robot_step / n,
            brain_step: t.brain_step / n,
            brain_refresh: t.brain_refresh / n,
            total_cycle: t.total_cycle / n,
        })
    }

    /// Mean of the per-cycle transfer-function cost. Not the cost of
    /// `means()`, since the max over robot and brain steps does not commute
    /// with averaging.
    pub fn mean_transfer_function(&self) -> Option<f64> {
        if self.rows.is_empty() {
            return None;
        }
        let sum: f64 = self.rows.iter().map(ProfileRow::transfer_function).sum();
        Some(sum / self.rows.len() as f64)
    }
}

/// Status file at the root of a result directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: String,
    pub testcase: String,
    pub status: String,
    pub job_id: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub completed_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunManifest {
    pub fn new(testcase: &str, job_id: &str) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            schema_version: "run_manifest_v1".to_string(),
            testcase: testcase.to_string(),
            status: "running".to_string(),
            job_id: job_id.to_string(),
            created_at: now.clone(),
            updated_at: now,
            completed_points: Vec::new(),
            error: None,
        }
    }

    pub fn touch(&mut self, status: &str) {
        self.status = status.to_string();
        self.updated_at = Utc::now().to_rfc3339();
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| BenchError::io(path, e))
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| BenchError::io(path, e))
}

pub fn write_scalar(path: &Path, value: f64) -> Result<()> {
    atomic_write_bytes(path, value.to_string().as_bytes())
}

pub fn read_scalar(path: &Path) -> Result<f64> {
    let raw = fs::read_to_string(path).map_err(|e| BenchError::io(path, e))?;
    raw.trim().parse::<f64>().map_err(|e| {
        BenchError::parse(path.display().to_string(), format!("'{}': {}", raw.trim(), e))
    })
}

pub fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_yaml::to_string(value).map_err(|source| BenchError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    atomic_write_bytes(path, text.as_bytes())
}

pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).map_err(|e| BenchError::io(path, e))?;
    serde_yaml::from_str(&raw).map_err(|source| BenchError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| BenchError::parse(path.display().to_string(), e.to_string()))?;
    atomic_write_bytes(path, &bytes)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}
