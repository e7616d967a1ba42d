//! Benchmark lifecycle controller.
//!
//! For every repetition and every sweep point the controller walks
//! `Idle → Allocating → Running → Collecting → TornDown`: it launches a
//! NEST Server job step sized to the sweep point, drives one of the
//! workload variants, collects NEST and SLURM figures and cancels the step.
//! There are no retries; the first failure aborts the sweep and leaves the
//! artifacts of completed sweep points on disk.

pub mod cosim;
pub mod launch;
pub mod metrics;
pub mod nest;
pub mod scheduler;

use anyhow::{anyhow, Context, Result};
use bench_core::artifacts::{
    atomic_write_bytes, ensure_dir, is_launch_artifact, sha256_hex, write_json_pretty, write_scalar,
    write_yaml, ProfileTable, RunManifest, CONFIG_COPY_FILE, CONFIG_DIGEST_FILE, EXEC_TIME_FILE,
    JOB_SCRIPT_FILE, MANIFEST_FILE, METADATA_FILE, TOTAL_TIME_FILE,
};
use bench_core::{BenchError, RunConfig, Secrets, SlurmEnv, SweepPoint, TestCase};
use cosim::{CoSimClient, NrpHttpClient, SimulationStatus};
use metrics::{metadata_record, MetricsCollector};
use nest::NestClient;
use scheduler::{render_template, JobStep, Scheduler};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Everything the controller reads, passed in once instead of living in
/// process-wide state.
#[derive(Debug, Clone)]
pub struct BenchContext {
    pub config: RunConfig,
    pub env: SlurmEnv,
    pub secrets: Option<Secrets>,
    pub result_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Allocating,
    Running,
    Collecting,
    TornDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Allocating => "allocating",
            Phase::Running => "running",
            Phase::Collecting => "collecting",
            Phase::TornDown => "torn_down",
        };
        f.write_str(s)
    }
}

pub struct RunResult {
    pub result_dir: PathBuf,
    pub points: Vec<PathBuf>,
}

/// What a workload variant leaves behind for the collection phase.
struct RunOutcome {
    experiment: Option<String>,
}

pub struct BenchmarkRunner {
    ctx: BenchContext,
    scheduler: Box<dyn Scheduler>,
    cosim: Option<Box<dyn CoSimClient>>,
    nest: NestClient,
    phase: Phase,
}

/// Builds the NRP client for co-simulation test cases; `None` for the baseline.
pub fn connect_cosim(ctx: &BenchContext) -> Result<Option<Box<dyn CoSimClient>>> {
    if !ctx.config.testcase.involves_robot() {
        return Ok(None);
    }
    let secrets = ctx
        .secrets
        .as_ref()
        .ok_or_else(|| anyhow!("testcase {} needs NRP credentials", ctx.config.testcase))?;
    let frontend = ctx
        .config
        .nrp
        .frontend
        .as_deref()
        .ok_or_else(|| anyhow!("missing nrp.frontend"))?;
    let client = NrpHttpClient::connect(
        frontend,
        ctx.config.nrp.backend.as_deref(),
        secrets,
        ctx.config.timeouts.poll_interval(),
    )?;
    Ok(Some(Box::new(client)))
}

impl BenchmarkRunner {
    pub fn new(
        ctx: BenchContext,
        scheduler: Box<dyn Scheduler>,
        cosim: Option<Box<dyn CoSimClient>>,
    ) -> Result<Self> {
        if ctx.config.testcase.involves_robot() && cosim.is_none() {
            return Err(anyhow!(
                "testcase {} requires a co-simulation client",
                ctx.config.testcase
            ));
        }
        let nest_url = match &ctx.config.nest.url {
            Some(url) => url.clone(),
            None => format!(
                "http://{}:{}",
                ctx.env.nest_master()?,
                ctx.config.nest.port
            ),
        };
        let nest = NestClient::new(nest_url)?;
        Ok(Self {
            ctx,
            scheduler,
            cosim,
            nest,
            phase: Phase::Idle,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase, point: &SweepPoint) {
        debug!(from = %self.phase, to = %phase, tasks = point.tasks, "phase");
        self.phase = phase;
    }

    pub fn run(&mut self) -> Result<RunResult> {
        let result_dir = self.ctx.result_dir.clone();
        prepare_result_dir(&result_dir, &self.ctx.config)?;
        let mut guard = ManifestGuard::new(
            &result_dir,
            RunManifest::new(self.ctx.config.testcase.as_str(), &self.ctx.env.job_id),
        )?;

        info!(
            testcase = %self.ctx.config.testcase,
            n_tasks = ?self.ctx.config.n_tasks,
            repetitions = self.ctx.config.repetitions,
            nest = self.nest.base_url(),
            "starting benchmark sweep"
        );

        let mut points = Vec::new();
        for rep in 0..self.ctx.config.repetitions {
            let rep_dir = result_dir.join(rep.to_string());
            for point in self.ctx.config.sweep_points(&rep_dir) {
                info!(
                    repetition = rep,
                    tasks = point.tasks,
                    nodes = point.nodes,
                    "running benchmark step"
                );
                if let Err(err) = self.run_point(&point) {
                    error!(tasks = point.tasks, error = %format!("{:#}", err), "sweep aborted");
                    guard.fail(&err);
                    return Err(err);
                }
                let rel = point
                    .dir
                    .strip_prefix(&result_dir)
                    .unwrap_or(&point.dir)
                    .to_string_lossy()
                    .to_string();
                guard.record_point(rel)?;
                points.push(point.dir.clone());
            }
        }
        guard.complete()?;
        info!("done");
        Ok(RunResult { result_dir, points })
    }

    fn run_point(&mut self, point: &SweepPoint) -> Result<()> {
        ensure_dir(&point.dir)?;

        self.enter(Phase::Allocating, point);
        let step = self.allocate(point)?;

        self.enter(Phase::Running, point);
        let outcome = match self.ctx.config.testcase {
            TestCase::HpcbenchBaseline => self.run_hpcbench_baseline(point)?,
            TestCase::HpcbenchNotf => {
                info!("running NRP HPC benchmark without TF");
                self.run_nrp_benchmark(point)?
            }
            TestCase::HpcbenchReadspikes => {
                info!("running NRP HPC benchmark with spike-reading TF");
                self.run_nrp_benchmark(point)?
            }
        };

        self.enter(Phase::Collecting, point);
        let status = MetricsCollector::new(&self.nest).nest_status()?;
        let profile = match &outcome.experiment {
            Some(experiment) => Some((experiment.clone(), self.fetch_profile(experiment, point)?)),
            None => None,
        };
        thread::sleep(self.ctx.config.timeouts.metadata_settle());

        self.enter(Phase::TornDown, point);
        info!(step = %step.id, "cancelling NEST");
        self.scheduler.cancel_step(&step)?;
        thread::sleep(self.ctx.config.timeouts.step_teardown());

        let sacct = MetricsCollector::new(&self.nest).sacct(self.scheduler.as_ref(), &step)?;
        let mut record = metadata_record(point.tasks, point.nodes, &status, &sacct);
        if let Some((experiment, table)) = &profile {
            record.attach_profile(experiment, table);
        }
        write_yaml(&point.dir.join(METADATA_FILE), &record)?;
        info!(dir = %point.dir.display(), "sweep point complete");
        self.phase = Phase::Idle;
        Ok(())
    }

    fn allocate(&mut self, point: &SweepPoint) -> Result<JobStep> {
        let cfg = &self.ctx.config;
        let template = fs::read_to_string(&cfg.nest.job_template).with_context(|| {
            format!("reading job template {}", cfg.nest.job_template.display())
        })?;
        let mut values: BTreeMap<&str, String> = BTreeMap::new();
        values.insert("n_nodes_nest", point.nodes.to_string());
        values.insert("n_tasks_nest", point.tasks.to_string());
        values.insert("nodezero", self.ctx.env.nrp_node()?.to_string());
        values.insert("jobid", self.ctx.env.job_id.clone());
        values.insert("account", self.ctx.env.account.clone());
        values.insert("port", cfg.nest.port.to_string());
        let script = point.dir.join(JOB_SCRIPT_FILE);
        atomic_write_bytes(&script, render_template(&template, &values).as_bytes())?;

        info!(nodes = point.nodes, tasks = point.tasks, "starting NEST");
        let step = self.scheduler.launch_step(&script)?;
        // Fixed grace period; the server is not probed for readiness.
        thread::sleep(cfg.timeouts.nest_startup());
        Ok(step)
    }

    /// NEST Server alone: the network script is sent straight to the
    /// server, then `n_cycles_nest` simulate calls are timed.
    fn run_hpcbench_baseline(&self, point: &SweepPoint) -> Result<RunOutcome> {
        let cfg = &self.ctx.config;
        info!(tasks = point.tasks, "running hpcbench_baseline");
        self.nest.reset_kernel()?;

        let source = fs::read_to_string(&cfg.nest.script)
            .with_context(|| format!("reading network script {}", cfg.nest.script.display()))?;
        let tic = Instant::now();
        self.nest.exec(&source)?;
        write_scalar(&point.dir.join(EXEC_TIME_FILE), tic.elapsed().as_secs_f64())?;

        let mut total = 0.0;
        for cycle in 0..cfg.n_cycles_nest {
            let tic = Instant::now();
            self.nest.simulate(cfg.nest_simtime)?;
            let dt = tic.elapsed().as_secs_f64();
            debug!(cycle, dt, "simulate");
            total += dt;
        }
        write_scalar(&point.dir.join(TOTAL_TIME_FILE), total)?;
        info!(total, "baseline done");
        Ok(RunOutcome { experiment: None })
    }

    /// Imports and launches the configured NRP experiment, then blocks on a
    /// one-shot completion signal resolved by the client's status callback.
    fn run_nrp_benchmark(&self, point: &SweepPoint) -> Result<RunOutcome> {
        let cfg = &self.ctx.config;
        let client = self
            .cosim
            .as_ref()
            .ok_or_else(|| anyhow!("no co-simulation client"))?;
        let path = cfg
            .experiment_path()
            .ok_or_else(|| anyhow!("no experiment configured for {}", cfg.testcase))?;

        let experiment = client.import_experiment(path)?;
        info!(%experiment, path = %path.display(), "imported experiment");
        thread::sleep(cfg.timeouts.experiment_settle());

        let (done_tx, done_rx) = mpsc::sync_channel::<Duration>(1);
        let tic = Instant::now();
        let mut sim = client.launch_experiment(&experiment, &cfg.nrp.profiler)?;
        sim.register_status_callback(Box::new(move |status: &SimulationStatus| {
            if status.is_terminal() {
                let _ = done_tx.try_send(tic.elapsed());
            }
        }));
        sim.start()?;

        let timeout = cfg.timeouts.run_timeout();
        let elapsed = match done_rx.recv_timeout(timeout) {
            Ok(elapsed) => elapsed,
            Err(RecvTimeoutError::Timeout) => {
                return Err(BenchError::Timeout {
                    what: format!("experiment {} to stop", experiment),
                    secs: timeout.as_secs_f64(),
                }
                .into())
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(BenchError::remote(
                    experiment.as_str(),
                    "status updates ended before a terminal state",
                )
                .into())
            }
        };
        write_scalar(&point.dir.join(TOTAL_TIME_FILE), elapsed.as_secs_f64())?;
        info!(total = elapsed.as_secs_f64(), tasks = point.tasks, "experiment finished");
        Ok(RunOutcome {
            experiment: Some(experiment),
        })
    }

    fn fetch_profile(&self, experiment: &str, point: &SweepPoint) -> Result<ProfileTable> {
        let client = self
            .cosim
            .as_ref()
            .ok_or_else(|| anyhow!("no co-simulation client"))?;
        let name = &self.ctx.config.nrp.profile_file;
        let raw = client.fetch_run_file(experiment, "profiler", name)?;
        let table = ProfileTable::parse(&raw)?;
        atomic_write_bytes(&point.dir.join(name), table.to_csv().as_bytes())?;
        debug!(cycles = table.rows.len(), "stored profile table");
        Ok(table)
    }
}

/// Refuses to reuse a result directory that already holds files other than
/// the launch scripts of `nrpbench prepare`, then stores the redacted config
/// and its digest.
fn prepare_result_dir(result_dir: &Path, config: &RunConfig) -> Result<()> {
    if result_dir.exists() {
        let occupied = fs::read_dir(result_dir)
            .with_context(|| format!("listing {}", result_dir.display()))?
            .filter_map(|entry| entry.ok())
            .any(|entry| !is_launch_artifact(&entry.file_name().to_string_lossy()));
        if occupied {
            return Err(BenchError::config(result_dir, "output directory already exists").into());
        }
    }
    ensure_dir(result_dir)?;
    let text = serde_yaml::to_string(&config.redacted())?;
    atomic_write_bytes(&result_dir.join(CONFIG_COPY_FILE), text.as_bytes())?;
    atomic_write_bytes(
        &result_dir.join(CONFIG_DIGEST_FILE),
        sha256_hex(text.as_bytes()).as_bytes(),
    )?;
    Ok(())
}

/// Keeps `run_manifest.json` current; a sweep that unwinds without
/// `complete` is recorded as failed.
struct ManifestGuard {
    path: PathBuf,
    manifest: RunManifest,
    done: bool,
}

impl ManifestGuard {
    fn new(result_dir: &Path, manifest: RunManifest) -> Result<Self> {
        let guard = Self {
            path: result_dir.join(MANIFEST_FILE),
            manifest,
            done: false,
        };
        write_json_pretty(&guard.path, &guard.manifest)?;
        Ok(guard)
    }

    fn record_point(&mut self, rel: String) -> Result<()> {
        self.manifest.completed_points.push(rel);
        self.manifest.touch("running");
        write_json_pretty(&self.path, &self.manifest)?;
        Ok(())
    }

    fn fail(&mut self, err: &anyhow::Error) {
        self.manifest.error = Some(format!("{:#}", err));
        self.manifest.touch("failed");
        let _ = write_json_pretty(&self.path, &self.manifest);
        self.done = true;
    }

    fn complete(&mut self) -> Result<()> {
        self.manifest.touch("completed");
        write_json_pretty(&self.path, &self.manifest)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for ManifestGuard {
    fn drop(&mut self) {
        if !self.done {
            self.manifest.touch("failed");
            let _ = write_json_pretty(&self.path, &self.manifest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::artifacts::MetadataRecord;
    use bench_core::config::{NestSection, NrpSection, Timeouts};
    use chrono::Utc;
    use cosim::{CoSimulation, StatusCallback};
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "nrpbench_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    /// How the mock answers `GetKernelStatus`.
    #[derive(Clone, Copy)]
    enum StatusReply {
        Valid,
        /// HTTP 500 on the n-th (1-based) call.
        FailOn(usize),
        /// HTTP 200 with this raw body.
        Body(&'static str),
    }

    /// NEST Server stand-in.
    fn spawn_mock_nest(reply: StatusReply) -> (String, Arc<Mutex<Vec<String>>>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind mock nest");
        let port = server
            .server_addr()
            .to_ip()
            .expect("ip listener")
            .port();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        let status_calls = AtomicUsize::new(0);
        thread::spawn(move || {
            for mut request in server.incoming_requests() {
                let url = request.url().to_string();
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                seen.lock().expect("calls").push(url.clone());
                let (code, payload) = match url.as_str() {
                    "/api/Simulate" => {
                        thread::sleep(Duration::from_millis(15));
                        (200, "null".to_string())
                    }
                    "/api/GetKernelStatus" => {
                        let n = status_calls.fetch_add(1, Ordering::SeqCst) + 1;
                        match reply {
                            StatusReply::FailOn(k) if k == n => {
                                (500, "kernel exploded".to_string())
                            }
                            StatusReply::Body(raw) => (200, raw.to_string()),
                            _ => (
                                200,
                                serde_json::json!({
                                    "time_construction_create": 1.5,
                                    "time_construction_connect": 2.5,
                                    "time_simulate": 0.25,
                                    "network_size": 112500,
                                    "num_connections": 39000000u64,
                                    "num_processes": 2,
                                    "local_num_threads": 36,
                                    "biological_time": 20.0,
                                    "some_other_key": "ignored"
                                })
                                .to_string(),
                            ),
                        }
                    }
                    "/exec" => (200, "{\"data\": null}".to_string()),
                    _ => (200, "{}".to_string()),
                };
                let header = tiny_http::Header::from_bytes(
                    &b"Content-Type"[..],
                    &b"application/json"[..],
                )
                .expect("header");
                let response = tiny_http::Response::from_string(payload)
                    .with_status_code(code)
                    .with_header(header);
                let _ = request.respond(response);
            }
        });
        (format!("http://127.0.0.1:{}", port), calls)
    }

    #[derive(Clone, Default)]
    struct FakeScheduler {
        log: Arc<Mutex<Vec<String>>>,
        next: u32,
    }

    impl Scheduler for FakeScheduler {
        fn launch_step(&mut self, script: &Path) -> Result<JobStep> {
            assert!(script.exists(), "job script must be rendered first");
            let id = format!("4242.{}", self.next);
            self.next += 1;
            self.log.lock().expect("log").push(format!("launch {}", id));
            Ok(JobStep { id })
        }

        fn cancel_step(&mut self, step: &JobStep) -> Result<()> {
            self.log.lock().expect("log").push(format!("cancel {}", step.id));
            Ok(())
        }

        fn accounting(&self, _step: &JobStep) -> Result<String> {
            Ok("00:01:40|1024K|2M|12.5K|\n".to_string())
        }
    }

    /// How a fake co-simulation run ends after reporting `started`.
    #[derive(Clone, Copy, PartialEq)]
    enum Ending {
        Stops,
        /// Never reaches a terminal state but keeps its callbacks alive.
        Hangs,
        /// Reporting thread exits and drops its callbacks.
        GoesSilent,
    }

    struct FakeSimulation {
        callbacks: Vec<StatusCallback>,
        ending: Ending,
    }

    impl CoSimulation for FakeSimulation {
        fn register_status_callback(&mut self, callback: StatusCallback) {
            self.callbacks.push(callback);
        }

        fn start(&mut self) -> Result<()> {
            let callbacks = std::mem::take(&mut self.callbacks);
            let ending = self.ending;
            thread::spawn(move || {
                for state in ["started", "started"] {
                    thread::sleep(Duration::from_millis(5));
                    for cb in &callbacks {
                        cb(&SimulationStatus::new(state));
                    }
                }
                match ending {
                    Ending::Stops => {
                        for cb in &callbacks {
                            cb(&SimulationStatus::new("stopped"));
                            cb(&SimulationStatus::new("halted"));
                        }
                    }
                    Ending::Hangs => thread::sleep(Duration::from_millis(500)),
                    Ending::GoesSilent => {}
                }
            });
            Ok(())
        }
    }

    struct FakeNrp {
        ending: Ending,
    }

    impl CoSimClient for FakeNrp {
        fn import_experiment(&self, path: &Path) -> Result<String> {
            assert!(path.ends_with("withTF"));
            Ok("withTF_0".to_string())
        }

        fn launch_experiment(
            &self,
            experiment: &str,
            profiler: &str,
        ) -> Result<Box<dyn CoSimulation>> {
            assert_eq!(experiment, "withTF_0");
            assert_eq!(profiler, "cle_step");
            Ok(Box::new(FakeSimulation {
                callbacks: Vec::new(),
                ending: self.ending,
            }))
        }

        fn fetch_run_file(&self, _experiment: &str, folder: &str, name: &str) -> Result<String> {
            assert_eq!(folder, "profiler");
            assert_eq!(name, "cle_time_profile.csv");
            Ok("robot_step,brain_step,brain_refresh,total_cycle\n\
                0.01,0.2,0.02,0.25\n\
                0.01,0.3,0.02,0.35\n"
                .to_string())
        }
    }

    /// Every wait zero so sweeps against the mocks finish quickly.
    fn quick_timeouts() -> Timeouts {
        Timeouts {
            nest_startup: 0.0,
            metadata_settle: 0.0,
            step_teardown: 0.0,
            experiment_settle: 0.0,
            run_timeout: 5.0,
            poll_interval: 0.01,
        }
    }

    fn context(root: &Path, testcase: TestCase, n_tasks: Vec<u32>, nest_url: &str) -> BenchContext {
        let template = root.join("nest.sh.tpl");
        fs::write(&template, "srun -N {n_nodes_nest} -n {n_tasks_nest} -x {nodezero}\n")
            .expect("template");
        let script = root.join("hpcbench_baseline.py");
        fs::write(&script, "import nest\n").expect("script");
        let mut experiments = BTreeMap::new();
        experiments.insert(TestCase::HpcbenchReadspikes, root.join("withTF"));
        BenchContext {
            config: RunConfig {
                testcase,
                n_tasks,
                repetitions: 1,
                n_cycles_nest: 1,
                nest_simtime: 20.0,
                tasks_per_node: 2,
                datadir: root.join("results"),
                nest: NestSection {
                    port: 5000,
                    url: Some(nest_url.to_string()),
                    script,
                    job_template: template,
                },
                nrp: NrpSection {
                    frontend: Some("127.0.0.1".to_string()),
                    experiments,
                    ..NrpSection::default()
                },
                timeouts: quick_timeouts(),
                secrets: root.join("secrets.yaml"),
            },
            env: SlurmEnv {
                nodelist: vec!["nid00027".to_string(), "nid00048".to_string()],
                job_id: "4242".to_string(),
                account: "ich001".to_string(),
                nnodes: 2,
            },
            secrets: None,
            result_dir: root.join("results"),
        }
    }

    #[test]
    fn baseline_sweep_writes_one_directory_per_point() {
        let root = temp_root("e2e_baseline");
        let (url, calls) = spawn_mock_nest(StatusReply::Valid);
        let ctx = context(&root, TestCase::HpcbenchBaseline, vec![1, 2], &url);
        let scheduler = FakeScheduler::default();
        let log = Arc::clone(&scheduler.log);
        let mut runner = BenchmarkRunner::new(ctx, Box::new(scheduler), None).expect("runner");
        let result = runner.run().expect("sweep");

        assert_eq!(result.points.len(), 2);
        let rep_dir = root.join("results").join("0");
        let mut dirs: Vec<String> = fs::read_dir(&rep_dir)
            .expect("rep dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
            .collect();
        dirs.sort();
        assert_eq!(dirs, vec!["01tasks", "02tasks"]);

        for dir in &dirs {
            let point = rep_dir.join(dir);
            let total = bench_core::artifacts::read_scalar(&point.join(TOTAL_TIME_FILE))
                .expect("total time");
            assert!(total >= 0.015, "one simulate call of >=15ms, got {}", total);
            assert!(point.join(EXEC_TIME_FILE).exists());
            assert!(!point.join("cle_time_profile.csv").exists());
            let meta = fs::read_to_string(point.join(METADATA_FILE)).expect("metadata");
            assert!(!meta.contains("nrp_"), "baseline metadata has robot keys:\n{}", meta);
            let record: MetadataRecord = serde_yaml::from_str(&meta).expect("record");
            assert_eq!(record.sacct_elapsed, 100.0);
            assert_eq!(record.sacct_maxrss, 2048.0);
            assert_eq!(record.sacct_consumedenergy, 12500.0);
            assert_eq!(record.nest_num_nodes, 112500);
        }

        let script = fs::read_to_string(rep_dir.join("02tasks").join(JOB_SCRIPT_FILE))
            .expect("job script");
        assert_eq!(script, "srun -N 1 -n 2 -x nid00027\n");

        let calls = calls.lock().expect("calls").clone();
        assert_eq!(calls.iter().filter(|c| *c == "/api/Simulate").count(), 2);
        assert_eq!(calls.iter().filter(|c| *c == "/api/ResetKernel").count(), 2);
        let log = log.lock().expect("log").clone();
        assert_eq!(
            log,
            vec!["launch 4242.0", "cancel 4242.0", "launch 4242.1", "cancel 4242.1"]
        );

        let manifest: RunManifest = serde_json::from_slice(
            &fs::read(root.join("results").join(MANIFEST_FILE)).expect("manifest"),
        )
        .expect("manifest json");
        assert_eq!(manifest.status, "completed");
        assert_eq!(manifest.completed_points.len(), 2);
        assert!(root.join("results").join(CONFIG_COPY_FILE).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn remote_failure_aborts_sweep_and_keeps_earlier_points() {
        let root = temp_root("e2e_abort");
        let (url, _calls) = spawn_mock_nest(StatusReply::FailOn(2));
        let ctx = context(&root, TestCase::HpcbenchBaseline, vec![1, 2, 4], &url);
        let scheduler = FakeScheduler::default();
        let log = Arc::clone(&scheduler.log);
        let mut runner = BenchmarkRunner::new(ctx, Box::new(scheduler), None).expect("runner");
        let err = runner.run().err().expect("sweep must fail");
        assert!(
            matches!(
                err.downcast_ref::<BenchError>(),
                Some(BenchError::RemoteCall { .. })
            ),
            "unexpected error: {:#}",
            err
        );

        let rep_dir = root.join("results").join("0");
        assert!(rep_dir.join("01tasks").join(METADATA_FILE).exists());
        assert!(rep_dir.join("01tasks").join(TOTAL_TIME_FILE).exists());
        assert!(!rep_dir.join("02tasks").join(METADATA_FILE).exists());
        assert!(!rep_dir.join("04tasks").exists());
        let launches = log
            .lock()
            .expect("log")
            .iter()
            .filter(|l| l.starts_with("launch"))
            .count();
        assert_eq!(launches, 2);

        let manifest: RunManifest = serde_json::from_slice(
            &fs::read(root.join("results").join(MANIFEST_FILE)).expect("manifest"),
        )
        .expect("manifest json");
        assert_eq!(manifest.status, "failed");
        assert_eq!(manifest.completed_points, vec!["0/01tasks".to_string()]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn cosim_run_stores_profile_and_robot_metadata() {
        let root = temp_root("e2e_cosim");
        let (url, calls) = spawn_mock_nest(StatusReply::Valid);
        let ctx = context(&root, TestCase::HpcbenchReadspikes, vec![4], &url);
        let mut runner = BenchmarkRunner::new(
            ctx,
            Box::new(FakeScheduler::default()),
            Some(Box::new(FakeNrp {
                ending: Ending::Stops,
            })),
        )
        .expect("runner");
        runner.run().expect("sweep");
        assert_eq!(runner.phase(), Phase::Idle);

        let point = root.join("results").join("0").join("04tasks");
        let total = bench_core::artifacts::read_scalar(&point.join(TOTAL_TIME_FILE))
            .expect("total time");
        assert!(total > 0.0);
        let table = ProfileTable::parse(
            &fs::read_to_string(point.join("cle_time_profile.csv")).expect("profile"),
        )
        .expect("table");
        assert_eq!(table.rows.len(), 2);
        let record: MetadataRecord =
            bench_core::artifacts::read_yaml(&point.join(METADATA_FILE)).expect("metadata");
        assert_eq!(record.n_nodes, 2);
        assert_eq!(record.nrp_experiment.as_deref(), Some("withTF_0"));
        assert_eq!(record.nrp_cycles, Some(2));
        assert!((record.nrp_time_brain_step.expect("brain") - 0.5).abs() < 1e-9);
        assert!((record.nrp_time_transfer_function.expect("tf") - 0.06).abs() < 1e-9);
        // Co-simulation variants never talk to NEST's exec endpoint.
        assert!(!calls.lock().expect("calls").iter().any(|c| c == "/exec"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn cosim_run_without_terminal_state_times_out() {
        let root = temp_root("e2e_timeout");
        let (url, _calls) = spawn_mock_nest(StatusReply::Valid);
        let mut ctx = context(&root, TestCase::HpcbenchReadspikes, vec![2], &url);
        ctx.config.timeouts.run_timeout = 0.1;
        let mut runner = BenchmarkRunner::new(
            ctx,
            Box::new(FakeScheduler::default()),
            Some(Box::new(FakeNrp {
                ending: Ending::Hangs,
            })),
        )
        .expect("runner");
        let err = runner.run().err().expect("must time out");
        assert!(matches!(
            err.downcast_ref::<BenchError>(),
            Some(BenchError::Timeout { .. })
        ));
        assert_eq!(runner.phase(), Phase::Running);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn cosim_testcase_without_client_is_rejected() {
        let root = temp_root("no_client");
        let ctx = context(&root, TestCase::HpcbenchNotf, vec![2], "http://127.0.0.1:9");
        assert!(BenchmarkRunner::new(ctx, Box::new(FakeScheduler::default()), None).is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn occupied_result_dir_is_refused() {
        let root = temp_root("occupied");
        let (url, _calls) = spawn_mock_nest(StatusReply::Valid);
        let ctx = context(&root, TestCase::HpcbenchBaseline, vec![1], &url);
        ensure_dir(&ctx.result_dir).expect("dir");
        fs::write(ctx.result_dir.join("leftover"), "x").expect("leftover");
        let mut runner =
            BenchmarkRunner::new(ctx, Box::new(FakeScheduler::default()), None).expect("runner");
        let err = runner.run().err().expect("refused");
        assert!(matches!(
            err.downcast_ref::<BenchError>(),
            Some(BenchError::Config { .. })
        ));
        let _ = fs::remove_dir_all(root);
    }

    fn assert_remote_call(err: &anyhow::Error) {
        assert!(
            matches!(
                err.downcast_ref::<BenchError>(),
                Some(BenchError::RemoteCall { .. })
            ),
            "unexpected error: {:#}",
            err
        );
    }

    #[test]
    fn malformed_kernel_status_is_a_remote_call_error() {
        for (tag, body) in [("garbled", "{not json"), ("partial", "{}")] {
            let root = temp_root(&format!("status_{}", tag));
            let (url, _calls) = spawn_mock_nest(StatusReply::Body(body));
            let ctx = context(&root, TestCase::HpcbenchBaseline, vec![1], &url);
            let mut runner =
                BenchmarkRunner::new(ctx, Box::new(FakeScheduler::default()), None)
                    .expect("runner");
            let err = runner.run().err().expect("status must be rejected");
            assert_remote_call(&err);
            assert_eq!(runner.phase(), Phase::Collecting);
            let _ = fs::remove_dir_all(root);
        }
    }

    #[test]
    fn kernel_status_client_rejects_bad_bodies() {
        let (url, _calls) = spawn_mock_nest(StatusReply::Body("{not json"));
        let err = NestClient::new(url.as_str())
            .expect("client")
            .kernel_status()
            .expect_err("garbled");
        assert!(err.to_string().contains("malformed JSON"), "{}", err);

        let (url, _calls) = spawn_mock_nest(StatusReply::Body("{\"network_size\": 3}"));
        let err = NestClient::new(url.as_str())
            .expect("client")
            .kernel_status()
            .expect_err("missing fields");
        assert!(matches!(err, BenchError::RemoteCall { .. }), "{:?}", err);
    }

    #[test]
    fn cosim_run_whose_updates_stop_early_is_a_remote_call_error() {
        let root = temp_root("e2e_silent");
        let (url, _calls) = spawn_mock_nest(StatusReply::Valid);
        let ctx = context(&root, TestCase::HpcbenchReadspikes, vec![2], &url);
        let mut runner = BenchmarkRunner::new(
            ctx,
            Box::new(FakeScheduler::default()),
            Some(Box::new(FakeNrp {
                ending: Ending::GoesSilent,
            })),
        )
        .expect("runner");
        let err = runner.run().err().expect("must fail");
        assert_remote_call(&err);
        assert!(format!("{:#}", err).contains("terminal state"), "{:#}", err);
        assert_eq!(runner.phase(), Phase::Running);
        let point = root.join("results").join("0").join("02tasks");
        assert!(!point.join(TOTAL_TIME_FILE).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn prepared_launch_scripts_do_not_block_a_run() {
        let root = temp_root("prepared");
        let (url, _calls) = spawn_mock_nest(StatusReply::Valid);
        let ctx = context(&root, TestCase::HpcbenchBaseline, vec![1], &url);
        ensure_dir(&ctx.result_dir.join(bench_core::artifacts::NRP_LOG_DIR)).expect("logs");
        fs::write(
            ctx.result_dir.join(bench_core::artifacts::NRP_SCRIPT_FILE),
            "#!/bin/bash\n",
        )
        .expect("nrp.sh");
        let mut runner =
            BenchmarkRunner::new(ctx, Box::new(FakeScheduler::default()), None).expect("runner");
        runner.run().expect("sweep over prepared dir");
        assert!(root.join("results").join(MANIFEST_FILE).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn context_debug_masks_credentials() {
        let root = temp_root("ctx_debug");
        let mut ctx = context(&root, TestCase::HpcbenchNotf, vec![2], "http://127.0.0.1:9");
        ctx.secrets = Some(Secrets {
            hbp_username: "alice".to_string(),
            hbp_password: "hunter2".to_string(),
        });
        ctx.config.nrp.password = Some("hunter3".to_string());
        let shown = format!("{:?}", ctx);
        assert!(shown.contains("alice"), "{}", shown);
        assert!(!shown.contains("hunter2"), "{}", shown);
        assert!(!shown.contains("hunter3"), "{}", shown);
        let _ = fs::remove_dir_all(root);
    }
}
