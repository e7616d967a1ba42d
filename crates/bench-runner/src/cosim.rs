//! Control plane of the robotics co-simulation (NRP).
//!
//! The NRP reports simulation state through callbacks fired from its own
//! polling thread. [`CoSimulation::register_status_callback`] mirrors that
//! contract; the lifecycle controller turns it into a one-shot completion
//! signal.

use anyhow::{anyhow, Context, Result};
use bench_core::{BenchError, Secrets};
use serde::Deserialize;
use serde_json::json;
use std::io::{Cursor, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SimulationStatus {
    pub state: String,
}

impl SimulationStatus {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state.as_str(), "stopped" | "halted")
    }
}

pub type StatusCallback = Box<dyn Fn(&SimulationStatus) + Send + 'static>;

/// A launched experiment.
pub trait CoSimulation: Send {
    /// Callbacks run on the client's own polling thread.
    fn register_status_callback(&mut self, callback: StatusCallback);
    fn start(&mut self) -> Result<()>;
}

pub trait CoSimClient {
    /// Uploads an experiment folder and returns the id of the clone.
    fn import_experiment(&self, path: &Path) -> Result<String>;
    fn launch_experiment(&self, experiment: &str, profiler: &str)
        -> Result<Box<dyn CoSimulation>>;
    /// Contents of `folder/name` from the experiment's most recent run.
    fn fetch_run_file(&self, experiment: &str, folder: &str, name: &str) -> Result<String>;
}

fn with_scheme(addr: &str) -> String {
    let addr = addr.trim().trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

#[derive(Deserialize)]
struct ImportResponse {
    #[serde(rename = "destFolderName")]
    dest_folder_name: String,
}

#[derive(Deserialize)]
struct LaunchResponse {
    #[serde(rename = "simulationID")]
    simulation_id: u64,
}

/// REST client for an NRP frontend/backend pair.
pub struct NrpHttpClient {
    frontend: String,
    backend: String,
    token: String,
    http: reqwest::blocking::Client,
    poll_interval: Duration,
}

impl NrpHttpClient {
    pub fn connect(
        frontend: &str,
        backend: Option<&str>,
        secrets: &Secrets,
        poll_interval: Duration,
    ) -> Result<Self> {
        let frontend = with_scheme(frontend);
        let backend = backend.map(with_scheme).unwrap_or_else(|| frontend.clone());
        let http = reqwest::blocking::Client::builder()
            .build()
            .context("building NRP HTTP client")?;
        let endpoint = format!("{}/proxy/authentication/authenticate", frontend);
        let response = http
            .post(&endpoint)
            .json(&json!({
                "user": secrets.hbp_username,
                "password": secrets.hbp_password,
            }))
            .send()
            .map_err(|e| BenchError::remote(&endpoint, e))?;
        let token = checked_text(&endpoint, response)?.trim().trim_matches('"').to_string();
        info!(%frontend, %backend, "authenticated against NRP");
        Ok(Self {
            frontend,
            backend,
            token,
            http,
            poll_interval,
        })
    }
}

impl CoSimClient for NrpHttpClient {
    fn import_experiment(&self, path: &Path) -> Result<String> {
        let archive = zip_experiment(path)?;
        let endpoint = format!("{}/proxy/storage/importExperiment", self.frontend);
        debug!(%endpoint, bytes = archive.len(), "importing experiment");
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.token)
            .header("Content-Type", "application/octet-stream")
            .body(archive)
            .send()
            .map_err(|e| BenchError::remote(&endpoint, e))?;
        let text = checked_text(&endpoint, response)?;
        let parsed: ImportResponse = serde_json::from_str(&text)
            .map_err(|e| BenchError::remote(&endpoint, format!("malformed JSON: {}", e)))?;
        Ok(parsed.dest_folder_name)
    }

    fn launch_experiment(
        &self,
        experiment: &str,
        profiler: &str,
    ) -> Result<Box<dyn CoSimulation>> {
        let endpoint = format!("{}/simulation", self.backend);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.token)
            .json(&json!({
                "experimentID": experiment,
                "gzserverHost": "local",
                "profiler": profiler,
            }))
            .send()
            .map_err(|e| BenchError::remote(&endpoint, e))?;
        let text = checked_text(&endpoint, response)?;
        let parsed: LaunchResponse = serde_json::from_str(&text)
            .map_err(|e| BenchError::remote(&endpoint, format!("malformed JSON: {}", e)))?;
        info!(experiment, simulation = parsed.simulation_id, "launched experiment");
        Ok(Box::new(HttpSimulation {
            base: format!("{}/simulation/{}", self.backend, parsed.simulation_id),
            token: self.token.clone(),
            http: self.http.clone(),
            poll_interval: self.poll_interval,
            callbacks: Vec::new(),
        }))
    }

    fn fetch_run_file(&self, experiment: &str, folder: &str, name: &str) -> Result<String> {
        let endpoint = format!(
            "{}/proxy/storage/{}/runs/last/{}/{}",
            self.frontend, experiment, folder, name
        );
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(&self.token)
            .send()
            .map_err(|e| BenchError::remote(&endpoint, e))?;
        Ok(checked_text(&endpoint, response)?)
    }
}

struct HttpSimulation {
    base: String,
    token: String,
    http: reqwest::blocking::Client,
    poll_interval: Duration,
    callbacks: Vec<StatusCallback>,
}

impl HttpSimulation {
    fn set_state(&self, state: &str) -> Result<()> {
        let endpoint = format!("{}/state", self.base);
        let response = self
            .http
            .put(&endpoint)
            .bearer_auth(&self.token)
            .json(&json!({ "state": state }))
            .send()
            .map_err(|e| BenchError::remote(&endpoint, e))?;
        checked_text(&endpoint, response)?;
        Ok(())
    }
}

impl CoSimulation for HttpSimulation {
    fn register_status_callback(&mut self, callback: StatusCallback) {
        self.callbacks.push(callback);
    }

    fn start(&mut self) -> Result<()> {
        self.set_state("initialized")?;
        self.set_state("started")?;
        let callbacks = std::mem::take(&mut self.callbacks);
        let endpoint = format!("{}/state", self.base);
        let http = self.http.clone();
        let token = self.token.clone();
        let poll_interval = self.poll_interval;
        thread::Builder::new()
            .name("nrp-status-poll".to_string())
            .spawn(move || loop {
                let status = http
                    .get(&endpoint)
                    .bearer_auth(&token)
                    .send()
                    .and_then(|r| r.error_for_status())
                    .and_then(|r| r.json::<SimulationStatus>());
                match status {
                    Ok(status) => {
                        for cb in &callbacks {
                            cb(&status);
                        }
                        if status.is_terminal() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%endpoint, error = %e, "status polling stopped");
                        break;
                    }
                }
                thread::sleep(poll_interval);
            })
            .context("spawning status poller")?;
        Ok(())
    }
}

fn checked_text(endpoint: &str, response: reqwest::blocking::Response) -> Result<String> {
    let status = response.status();
    let text = response
        .text()
        .map_err(|e| BenchError::remote(endpoint, e))?;
    if !status.is_success() {
        return Err(
            BenchError::remote(endpoint, format!("HTTP {}: {}", status, text.trim())).into(),
        );
    }
    Ok(text)
}

/// Zips an experiment folder, entries prefixed with the folder's own name.
pub fn zip_experiment(root: &Path) -> Result<Vec<u8>> {
    if !root.is_dir() {
        return Err(anyhow!("experiment folder not found: {}", root.display()));
    }
    let base = root.parent().unwrap_or(Path::new(""));
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(base)?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");
        if entry.file_type().is_dir() {
            writer.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            writer.start_file(name, options)?;
            writer.write_all(&std::fs::read(entry.path())?)?;
        }
    }
    Ok(writer.finish()?.into_inner())
}
