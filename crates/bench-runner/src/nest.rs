//! JSON-over-HTTP client for NEST Server.

use bench_core::BenchError;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Subset of `GetKernelStatus` recorded per sweep point.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct KernelStatus {
    pub time_construction_create: f64,
    pub time_construction_connect: f64,
    pub time_simulate: f64,
    pub network_size: u64,
    pub num_connections: u64,
    pub num_processes: u64,
    pub local_num_threads: u64,
    pub biological_time: f64,
}

pub struct NestClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl NestClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BenchError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        // Simulate calls on large networks take minutes; no request timeout.
        let http = reqwest::blocking::Client::builder()
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| BenchError::remote(&base_url, e))?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn reset_kernel(&self) -> Result<(), BenchError> {
        self.post("/api/ResetKernel", &json!({})).map(|_| ())
    }

    /// Executes a network-construction script on the server.
    pub fn exec(&self, source: &str) -> Result<Value, BenchError> {
        self.post("/exec", &json!({ "source": source }))
    }

    /// Advances the simulation by `t_ms` of biological time.
    pub fn simulate(&self, t_ms: f64) -> Result<(), BenchError> {
        self.post("/api/Simulate", &json!({ "t": t_ms })).map(|_| ())
    }

    pub fn kernel_status(&self) -> Result<KernelStatus, BenchError> {
        let endpoint = format!("{}/api/GetKernelStatus", self.base_url);
        let value = self.post("/api/GetKernelStatus", &json!({}))?;
        serde_json::from_value(value).map_err(|e| BenchError::remote(endpoint, e))
    }

    fn post(&self, path: &str, body: &Value) -> Result<Value, BenchError> {
        let endpoint = format!("{}{}", self.base_url, path);
        debug!(%endpoint, "nest request");
        let response = self
            .http
            .post(&endpoint)
            .header("Accept", "application/json, text/plain")
            .json(body)
            .send()
            .map_err(|e| BenchError::remote(&endpoint, e))?;
        let status = response.status();
        let text = response
            .text()
            .map_err(|e| BenchError::remote(&endpoint, e))?;
        if !status.is_success() {
            return Err(BenchError::remote(
                &endpoint,
                format!("HTTP {}: {}", status, text.trim()),
            ));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| BenchError::remote(&endpoint, format!("malformed JSON: {}", e)))
    }
}
