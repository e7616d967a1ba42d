//! Per-run resource and timing figures from NEST and SLURM accounting.

use crate::nest::{KernelStatus, NestClient};
use crate::scheduler::{JobStep, Scheduler};
use anyhow::Result;
use bench_core::artifacts::MetadataRecord;
use bench_core::BenchError;
use tracing::debug;

const SACCT_FIELDS: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SacctInfo {
    /// Seconds.
    pub elapsed: f64,
    /// KiB.
    pub averss: f64,
    /// KiB.
    pub maxrss: f64,
    /// Joules.
    pub consumed_energy: f64,
}

/// Parses `sacct -p --noheader --format=Elapsed,AveRSS,MaxRSS,ConsumedEnergy`.
pub fn parse_sacct(output: &str) -> Result<SacctInfo, BenchError> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| BenchError::parse("sacct output", "no accounting line"))?;
    let fields: Vec<&str> = line.split('|').collect();
    let fields: &[&str] = match fields.last() {
        Some(last) if last.is_empty() => &fields[..fields.len() - 1],
        _ => &fields,
    };
    if fields.len() < SACCT_FIELDS {
        return Err(BenchError::parse(
            "sacct output",
            format!(
                "expected {} fields, got {} in '{}'",
                SACCT_FIELDS,
                fields.len(),
                line
            ),
        ));
    }
    Ok(SacctInfo {
        elapsed: parse_elapsed(fields[0])?,
        averss: parse_memory_kib(fields[1])?,
        maxrss: parse_memory_kib(fields[2])?,
        consumed_energy: parse_energy_joules(fields[3])?,
    })
}

/// `[D-]HH:MM:SS[.fff]` or `MM:SS[.fff]` to seconds.
pub fn parse_elapsed(raw: &str) -> Result<f64, BenchError> {
    let bad = |reason: &str| BenchError::parse("sacct elapsed", format!("'{}': {}", raw, reason));
    let raw = raw.trim();
    let (days, clock) = match raw.split_once('-') {
        Some((d, rest)) => (d.parse::<f64>().map_err(|_| bad("invalid day count"))?, rest),
        None => (0.0, raw),
    };
    let parts: Vec<&str> = clock.split(':').collect();
    let nums = parts
        .iter()
        .map(|p| p.parse::<f64>().map_err(|_| bad("invalid clock field")))
        .collect::<Result<Vec<f64>, BenchError>>()?;
    let secs = match nums.as_slice() {
        [h, m, s] => h * 3600.0 + m * 60.0 + s,
        [m, s] => m * 60.0 + s,
        _ => return Err(bad("expected HH:MM:SS")),
    };
    Ok(days * 86400.0 + secs)
}

/// Memory with an optional K/M/G suffix, normalised to KiB.
pub fn parse_memory_kib(raw: &str) -> Result<f64, BenchError> {
    scaled(raw, "sacct memory", |suffix| match suffix {
        None => Some(1.0 / 1024.0),
        Some('K') => Some(1.0),
        Some('M') => Some(1024.0),
        Some('G') => Some(1024.0 * 1024.0),
        _ => None,
    })
}

/// Energy with an optional K/M/G suffix, normalised to joules. Empty means
/// energy accounting is disabled on the cluster and yields 0.
pub fn parse_energy_joules(raw: &str) -> Result<f64, BenchError> {
    scaled(raw, "sacct energy", |suffix| match suffix {
        None => Some(1.0),
        Some('K') => Some(1e3),
        Some('M') => Some(1e6),
        Some('G') => Some(1e9),
        _ => None,
    })
}

fn scaled(
    raw: &str,
    what: &str,
    factor: impl Fn(Option<char>) -> Option<f64>,
) -> Result<f64, BenchError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0.0);
    }
    let (number, suffix) = match raw.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&raw[..raw.len() - 1], Some(c.to_ascii_uppercase())),
        _ => (raw, None),
    };
    let factor = factor(suffix)
        .ok_or_else(|| BenchError::parse(what, format!("unknown unit suffix in '{}'", raw)))?;
    let value = number
        .parse::<f64>()
        .map_err(|e| BenchError::parse(what, format!("'{}': {}", raw, e)))?;
    Ok(value * factor)
}

/// Queries NEST status and SLURM accounting after a run.
pub struct MetricsCollector<'a> {
    nest: &'a NestClient,
}

impl<'a> MetricsCollector<'a> {
    pub fn new(nest: &'a NestClient) -> Self {
        Self { nest }
    }

    pub fn nest_status(&self) -> Result<KernelStatus> {
        let status = self.nest.kernel_status()?;
        debug!(?status, "kernel status");
        Ok(status)
    }

    pub fn sacct(&self, scheduler: &dyn Scheduler, step: &JobStep) -> Result<SacctInfo> {
        let raw = scheduler.accounting(step)?;
        let info = parse_sacct(&raw)?;
        debug!(step = %step.id, ?info, "accounting");
        Ok(info)
    }
}

pub fn metadata_record(
    tasks: u32,
    nodes: u32,
    status: &KernelStatus,
    sacct: &SacctInfo,
) -> MetadataRecord {
    MetadataRecord {
        n_tasks: tasks,
        n_nodes: nodes,
        sacct_elapsed: sacct.elapsed,
        sacct_averss: sacct.averss,
        sacct_maxrss: sacct.maxrss,
        sacct_consumedenergy: sacct.consumed_energy,
        nest_time_create: status.time_construction_create,
        nest_time_connect: status.time_construction_connect,
        nest_time_last_simulate: status.time_simulate,
        nest_num_nodes: status.network_size,
        nest_num_connections: status.num_connections,
        nest_num_processes: status.num_processes,
        nest_local_num_threads: status.local_num_threads,
        nest_time_simulated: status.biological_time,
        ..Default::default()
    }
}
