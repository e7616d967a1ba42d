//! Offline processing of finished benchmark sweeps.
//!
//! A result directory holds `config.yaml` plus a `<rep>/<tasks:02>tasks`
//! matrix of sweep-point artifacts. Aggregation drops repetitions whose
//! first sweep point strays from the rest, averages the remaining ones per
//! sweep point and pairs every series with its ideal linear-scaling
//! reference.

pub mod charts;

use anyhow::{anyhow, Context, Result};
use bench_core::artifacts::{
    read_scalar, read_yaml, write_json_pretty, MetadataRecord, ProfileTable, CONFIG_COPY_FILE,
    METADATA_FILE, TOTAL_TIME_FILE,
};
use bench_core::config::sweep_dir_name;
use bench_core::{RunConfig, TestCase};
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Relative deviation from the median beyond which a repetition is dropped.
pub const OUTLIER_THRESHOLD: f64 = 0.12;
pub const DIAGRAMS_DIR: &str = "diagrams";
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDirection {
    /// Ideal value is inversely proportional to the task count.
    Shrinks,
    /// Ideal value is proportional to the task count.
    Grows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    TotalRuntime,
    RealtimeFactor,
    NestTimeBuild,
    NestTimeLastSimulate,
    SacctMaxRss,
    SacctConsumedEnergy,
    NodeHours,
    ProfileBrainStep,
    ProfileRobotStep,
    ProfileBrainRefresh,
    ProfileTransferFunction,
}

impl Metric {
    pub const ALL: [Metric; 11] = [
        Metric::TotalRuntime,
        Metric::RealtimeFactor,
        Metric::NestTimeBuild,
        Metric::NestTimeLastSimulate,
        Metric::SacctMaxRss,
        Metric::SacctConsumedEnergy,
        Metric::NodeHours,
        Metric::ProfileBrainStep,
        Metric::ProfileRobotStep,
        Metric::ProfileBrainRefresh,
        Metric::ProfileTransferFunction,
    ];

    /// File stem of the metric's chart.
    pub fn stem(&self) -> &'static str {
        match self {
            Metric::TotalRuntime => "total_runtime",
            Metric::RealtimeFactor => "realtime_factor",
            Metric::NestTimeBuild => "nest_time_build",
            Metric::NestTimeLastSimulate => "nest_time_last_simulate",
            Metric::SacctMaxRss => "sacct_maxrss",
            Metric::SacctConsumedEnergy => "sacct_consumedenergy",
            Metric::NodeHours => "node_hours",
            Metric::ProfileBrainStep => "cle_time_profile-brain_step",
            Metric::ProfileRobotStep => "cle_time_profile-robot_step",
            Metric::ProfileBrainRefresh => "cle_time_profile-brain_refresh",
            Metric::ProfileTransferFunction => "cle_time_profile-transfer_function",
        }
    }

    /// Y axis description.
    pub fn label(&self) -> &'static str {
        match self {
            Metric::TotalRuntime => "total run time (s)",
            Metric::RealtimeFactor => "real-time factor (wall / biological)",
            Metric::NestTimeBuild => "network construction time (s)",
            Metric::NestTimeLastSimulate => "last simulate call (s)",
            Metric::SacctMaxRss => "peak resident set size (MiB)",
            Metric::SacctConsumedEnergy => "consumed energy (kJ)",
            Metric::NodeHours => "node hours",
            Metric::ProfileBrainStep => "brain step per cycle (s)",
            Metric::ProfileRobotStep => "robot step per cycle (s)",
            Metric::ProfileBrainRefresh => "brain refresh per cycle (s)",
            Metric::ProfileTransferFunction => "transfer functions per cycle (s)",
        }
    }

    /// How the metric would behave under perfect strong scaling. `None`
    /// means no reference series is drawn.
    pub fn direction(&self) -> Option<ScalingDirection> {
        match self {
            Metric::TotalRuntime
            | Metric::RealtimeFactor
            | Metric::NestTimeBuild
            | Metric::NestTimeLastSimulate
            | Metric::SacctMaxRss
            | Metric::ProfileBrainStep => Some(ScalingDirection::Shrinks),
            Metric::SacctConsumedEnergy
            | Metric::NodeHours
            | Metric::ProfileRobotStep
            | Metric::ProfileBrainRefresh
            | Metric::ProfileTransferFunction => None,
        }
    }

    /// The metric's value at one sweep point, if the artifacts carry it.
    pub fn value(&self, point: &PointData) -> Option<f64> {
        let md = point.metadata.as_ref();
        let profile = point.profile.as_ref().and_then(ProfileTable::means);
        match self {
            Metric::TotalRuntime => Some(point.total_time),
            Metric::RealtimeFactor => md
                .map(|m| m.nest_time_simulated / 1000.0)
                .filter(|bio| *bio > 0.0)
                .map(|bio| point.total_time / bio),
            Metric::NestTimeBuild => md.map(|m| m.nest_time_create + m.nest_time_connect),
            Metric::NestTimeLastSimulate => md.map(|m| m.nest_time_last_simulate),
            Metric::SacctMaxRss => md.map(|m| m.sacct_maxrss / 1024.0),
            Metric::SacctConsumedEnergy => md.map(|m| m.sacct_consumedenergy / 1000.0),
            Metric::NodeHours => md.map(|m| m.sacct_elapsed * f64::from(m.n_nodes) / 3600.0),
            Metric::ProfileBrainStep => profile.map(|p| p.brain_step),
            Metric::ProfileRobotStep => profile.map(|p| p.robot_step),
            Metric::ProfileBrainRefresh => profile.map(|p| p.brain_refresh),
            Metric::ProfileTransferFunction => point
                .profile
                .as_ref()
                .and_then(ProfileTable::mean_transfer_function),
        }
    }
}

/// Artifacts of one sweep point.
#[derive(Debug, Clone, Default)]
pub struct PointData {
    pub tasks: u32,
    pub total_time: f64,
    pub metadata: Option<MetadataRecord>,
    pub profile: Option<ProfileTable>,
}

/// One result directory: `repetitions[r][i]` belongs to `sweep[i]`.
#[derive(Debug, Clone)]
pub struct BenchmarkData {
    pub dir: PathBuf,
    pub testcase: TestCase,
    pub sweep: Vec<u32>,
    pub repetitions: Vec<Vec<PointData>>,
}

pub fn load_result_dir(dir: &Path) -> Result<BenchmarkData> {
    let config: RunConfig = read_yaml(&dir.join(CONFIG_COPY_FILE))
        .with_context(|| format!("reading run config of {}", dir.display()))?;
    if config.n_tasks.is_empty() {
        return Err(anyhow!("{}: config has an empty sweep", dir.display()));
    }

    let mut rep_ids: Vec<u32> = fs::read_dir(dir)
        .with_context(|| format!("listing {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .collect();
    rep_ids.sort_unstable();

    let mut repetitions = Vec::new();
    for rep in rep_ids {
        let rep_dir = dir.join(rep.to_string());
        match load_repetition(&rep_dir, &config.n_tasks)? {
            Some(points) => repetitions.push(points),
            None => warn!(dir = %rep_dir.display(), "skipping incomplete repetition"),
        }
    }
    if repetitions.is_empty() {
        return Err(anyhow!("{}: no complete repetition found", dir.display()));
    }
    info!(
        dir = %dir.display(),
        testcase = %config.testcase,
        repetitions = repetitions.len(),
        "loaded benchmark data"
    );
    Ok(BenchmarkData {
        dir: dir.to_path_buf(),
        testcase: config.testcase,
        sweep: config.n_tasks,
        repetitions,
    })
}

/// `None` when a sweep point never got its elapsed time written, i.e. the
/// sweep was aborted inside this repetition.
fn load_repetition(rep_dir: &Path, sweep: &[u32]) -> Result<Option<Vec<PointData>>> {
    let mut points = Vec::with_capacity(sweep.len());
    for &tasks in sweep {
        let point_dir = rep_dir.join(sweep_dir_name(tasks));
        let total_file = point_dir.join(TOTAL_TIME_FILE);
        if !total_file.exists() {
            return Ok(None);
        }
        let total_time = read_scalar(&total_file)?;
        let metadata_file = point_dir.join(METADATA_FILE);
        let metadata = if metadata_file.exists() {
            Some(read_yaml::<MetadataRecord>(&metadata_file)?)
        } else {
            None
        };
        let profile_file = point_dir.join("cle_time_profile.csv");
        let profile = if profile_file.exists() {
            let raw = fs::read_to_string(&profile_file)
                .with_context(|| format!("reading {}", profile_file.display()))?;
            Some(ProfileTable::parse(&raw)?)
        } else {
            None
        };
        debug!(dir = %point_dir.display(), total_time, "loaded sweep point");
        points.push(PointData {
            tasks,
            total_time,
            metadata,
            profile,
        });
    }
    Ok(Some(points))
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Indices of values within `threshold` (relative) of the median. Falls back
/// to every index when nothing survives.
pub fn select_repetitions(values: &[f64], threshold: f64) -> Vec<usize> {
    if values.is_empty() {
        return Vec::new();
    }
    let center = median(values);
    let kept: Vec<usize> = values
        .iter()
        .enumerate()
        .filter(|(_, v)| {
            if center == 0.0 {
                **v == 0.0
            } else {
                ((**v - center) / center).abs() <= threshold
            }
        })
        .map(|(i, _)| i)
        .collect();
    if kept.is_empty() {
        (0..values.len()).collect()
    } else {
        kept
    }
}

pub fn filtered_mean(values: &[f64], threshold: f64) -> Option<f64> {
    let kept = select_repetitions(values, threshold);
    if kept.is_empty() {
        return None;
    }
    Some(kept.iter().map(|&i| values[i]).sum::<f64>() / kept.len() as f64)
}

/// Ideal scaling from the first sweep point's value.
pub fn linear_reference(sweep: &[u32], first: f64, direction: ScalingDirection) -> Vec<f64> {
    let Some(&base) = sweep.first() else {
        return Vec::new();
    };
    sweep
        .iter()
        .map(|&n| {
            let factor = f64::from(n) / f64::from(base);
            match direction {
                ScalingDirection::Shrinks => first / factor,
                ScalingDirection::Grows => first * factor,
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedSeries {
    pub metric: Metric,
    pub sweep: Vec<u32>,
    pub values: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<Vec<f64>>,
    /// Repetition indices that survived the outlier filter.
    pub repetitions: Vec<usize>,
}

/// Per-metric series, `None` when some sweep point lacks the metric.
pub fn aggregate(data: &BenchmarkData, metric: Metric) -> Option<AggregatedSeries> {
    let table: Vec<Vec<f64>> = data
        .repetitions
        .iter()
        .map(|rep| rep.iter().map(|p| metric.value(p)).collect::<Option<Vec<f64>>>())
        .collect::<Option<Vec<_>>>()?;
    let first: Vec<f64> = table.iter().map(|rep| rep[0]).collect();
    let kept = select_repetitions(&first, OUTLIER_THRESHOLD);
    if kept.len() < table.len() {
        debug!(
            metric = metric.stem(),
            dropped = table.len() - kept.len(),
            "dropped outlier repetitions"
        );
    }

    let values: Vec<f64> = (0..data.sweep.len())
        .map(|i| kept.iter().map(|&r| table[r][i]).sum::<f64>() / kept.len() as f64)
        .collect();
    let reference = metric
        .direction()
        .map(|dir| linear_reference(&data.sweep, values[0], dir));
    Some(AggregatedSeries {
        metric,
        sweep: data.sweep.clone(),
        values,
        reference,
        repetitions: kept,
    })
}

/// Share of the mean cycle time spent per category, in percent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrainRobotSplit {
    pub sweep: Vec<u32>,
    pub brain_step: Vec<f64>,
    pub robot_step: Vec<f64>,
    pub brain_refresh: Vec<f64>,
    pub transfer_function: Vec<f64>,
}

pub fn brain_robot_split(data: &BenchmarkData) -> Option<BrainRobotSplit> {
    let brain = aggregate(data, Metric::ProfileBrainStep)?;
    let robot = aggregate(data, Metric::ProfileRobotStep)?;
    let refresh = aggregate(data, Metric::ProfileBrainRefresh)?;
    let tf = aggregate(data, Metric::ProfileTransferFunction)?;

    let mut split = BrainRobotSplit {
        sweep: data.sweep.clone(),
        brain_step: Vec::new(),
        robot_step: Vec::new(),
        brain_refresh: Vec::new(),
        transfer_function: Vec::new(),
    };
    for i in 0..data.sweep.len() {
        let parts = [brain.values[i], robot.values[i], refresh.values[i], tf.values[i]];
        let total: f64 = parts.iter().sum();
        let pct = |v: f64| if total > 0.0 { 100.0 * v / total } else { 0.0 };
        split.brain_step.push(pct(parts[0]));
        split.robot_step.push(pct(parts[1]));
        split.brain_refresh.push(pct(parts[2]));
        split.transfer_function.push(pct(parts[3]));
    }
    Some(split)
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub dir: PathBuf,
    pub testcase: TestCase,
    pub label: String,
    pub generated_at: String,
    pub repetitions: usize,
    pub series: Vec<AggregatedSeries>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brain_robot_split: Option<BrainRobotSplit>,
}

pub fn summarize(data: &BenchmarkData) -> Summary {
    Summary {
        dir: data.dir.clone(),
        testcase: data.testcase,
        label: data.testcase.label().to_string(),
        generated_at: Utc::now().to_rfc3339(),
        repetitions: data.repetitions.len(),
        series: Metric::ALL
            .iter()
            .filter_map(|&m| aggregate(data, m))
            .collect(),
        brain_robot_split: brain_robot_split(data),
    }
}

/// Loads every directory, writes per-directory charts and `summary.json`,
/// and when several directories are given, comparison charts into the
/// first one. Returns the written summaries.
pub fn process(dirs: &[PathBuf]) -> Result<Vec<Summary>> {
    if dirs.is_empty() {
        return Err(anyhow!("no result directory given"));
    }
    let mut summaries = Vec::new();
    for dir in dirs {
        let data = load_result_dir(dir)?;
        let summary = summarize(&data);
        let out = dir.join(DIAGRAMS_DIR);
        charts::render_summary(&out, &summary)?;
        write_json_pretty(&out.join(SUMMARY_FILE), &summary)?;
        info!(dir = %out.display(), series = summary.series.len(), "wrote diagrams");
        summaries.push(summary);
    }
    if summaries.len() > 1 {
        let out = dirs[0].join(DIAGRAMS_DIR);
        charts::render_comparisons(&out, &summaries)?;
        info!(dir = %out.display(), runs = summaries.len(), "wrote comparison diagrams");
    }
    Ok(summaries)
}
