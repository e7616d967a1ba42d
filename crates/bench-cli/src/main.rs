use anyhow::Result;
use bench_core::{BenchError, RunConfig, SlurmEnv};
use bench_runner::launch::prepare_launch_scripts;
use bench_runner::scheduler::SlurmScheduler;
use bench_runner::{BenchContext, BenchmarkRunner};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nrpbench", version = "0.3.0", about = "NRP/NEST HPC benchmark toolkit")]
struct Cli {
    /// Debug-level logging unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured sweep inside a SLURM allocation.
    Run {
        config: PathBuf,
        /// Defaults to the config's `datadir`.
        result_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Render the NRP and tunnel launch scripts and print the NRP node.
    Prepare {
        config: PathBuf,
        /// Defaults to the config's `datadir`.
        result_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Aggregate finished sweeps and render charts.
    Aggregate {
        #[arg(required = true)]
        result_dirs: Vec<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Expand a compressed node list (default: $SLURM_NODELIST).
    ExpandNodelist {
        spec: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Validate a config and print the sweep plan.
    Describe {
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<BenchError>()
                    .map(BenchError::code)
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            result_dir,
            json,
        } => {
            let env = SlurmEnv::from_env()?;
            let mut cfg = bench_core::load_config(&config)?;
            cfg.resolve_sweep(env.nnodes);
            if cfg.n_tasks.is_empty() {
                return Err(BenchError::config(
                    &config,
                    format!("allocation of {} nodes leaves no room for NEST", env.nnodes),
                )
                .into());
            }
            info!(
                testcase = %cfg.testcase,
                n_tasks = ?cfg.n_tasks,
                job = %env.job_id,
                "resolved sweep"
            );
            let secrets = bench_core::resolve_secrets(&cfg)?;
            let result_dir = result_dir.unwrap_or_else(|| cfg.datadir.clone());
            let ctx = BenchContext {
                config: cfg,
                env,
                secrets,
                result_dir,
            };
            let cosim = bench_runner::connect_cosim(&ctx)?;
            let scheduler = SlurmScheduler::new(ctx.env.job_id.clone());
            let mut runner = BenchmarkRunner::new(ctx, Box::new(scheduler), cosim)?;
            let result = runner.run()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "result_dir": result.result_dir.display().to_string(),
                    "points": result
                        .points
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                })));
            }
            println!("result_dir: {}", result.result_dir.display());
            println!("sweep_points: {}", result.points.len());
        }
        Commands::Prepare {
            config,
            result_dir,
            json,
        } => {
            let env = SlurmEnv::from_env()?;
            let cfg = bench_core::load_config(&config)?;
            let result_dir = result_dir.unwrap_or_else(|| cfg.datadir.clone());
            let scripts = prepare_launch_scripts(&cfg, &env, &result_dir)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "prepare",
                    "nrp_node": scripts.nrp_node,
                    "scripts": scripts
                        .written
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                })));
            }
            // The job script reads the NRP host from stdout.
            println!("{}", scripts.nrp_node);
        }
        Commands::Aggregate { result_dirs, json } => {
            let summaries = bench_analysis::process(&result_dirs)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "aggregate",
                    "summaries": serde_json::to_value(&summaries)?
                })));
            }
            for summary in &summaries {
                println!("{} ({})", summary.dir.display(), summary.label);
                println!("  repetitions: {}", summary.repetitions);
                for series in &summary.series {
                    let values: Vec<String> =
                        series.values.iter().map(|v| format!("{:.4}", v)).collect();
                    println!("  {}: {}", series.metric.stem(), values.join(" "));
                }
            }
        }
        Commands::ExpandNodelist { spec, json } => {
            let spec = match spec {
                Some(spec) => spec,
                None => std::env::var(bench_core::env::NODELIST_VAR).map_err(|_| {
                    BenchError::config(
                        bench_core::env::NODELIST_VAR,
                        "no node list given and the variable is unset",
                    )
                })?,
            };
            let hosts = bench_core::expand_nodelist(&spec)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "expand-nodelist",
                    "spec": spec,
                    "hosts": hosts
                })));
            }
            for host in &hosts {
                println!("{}", host);
            }
        }
        Commands::Describe { config, json } => {
            let cfg = bench_core::load_config(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": config_to_json(&config, &cfg)
                })));
            }
            print_config(&config, &cfg);
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Prepare { json, .. }
        | Commands::Aggregate { json, .. }
        | Commands::ExpandNodelist { json, .. }
        | Commands::Describe { json, .. } => *json,
    }
}

fn sweep_plan(cfg: &RunConfig) -> Vec<Value> {
    cfg.sweep_points(Path::new("<rep>"))
        .iter()
        .map(|p| {
            json!({
                "tasks": p.tasks,
                "nodes": p.nodes,
                "dir": p.dir.display().to_string()
            })
        })
        .collect()
}

fn config_to_json(path: &Path, cfg: &RunConfig) -> Value {
    json!({
        "config": path.display().to_string(),
        "testcase": cfg.testcase.as_str(),
        "label": cfg.testcase.label(),
        "n_tasks": cfg.n_tasks,
        "sweep_from_allocation": cfg.n_tasks.is_empty(),
        "repetitions": cfg.repetitions,
        "n_cycles_nest": cfg.n_cycles_nest,
        "nest_simtime": cfg.nest_simtime,
        "tasks_per_node": cfg.tasks_per_node,
        "datadir": cfg.datadir.display().to_string(),
        "experiment": cfg.experiment_path().map(|p| p.display().to_string()),
        "tunnel_ip": cfg.nrp.tunnel_ip.as_deref(),
        "sweep_plan": sweep_plan(cfg),
        "timeouts": serde_json::to_value(&cfg.timeouts).unwrap_or(Value::Null)
    })
}

fn print_config(path: &Path, cfg: &RunConfig) {
    println!("config: {}", path.display());
    println!("testcase: {} ({})", cfg.testcase, cfg.testcase.label());
    if cfg.n_tasks.is_empty() {
        println!("n_tasks: derived from allocation");
    } else {
        println!("n_tasks: {:?}", cfg.n_tasks);
    }
    println!("repetitions: {}", cfg.repetitions);
    println!("n_cycles_nest: {}", cfg.n_cycles_nest);
    println!("nest_simtime: {} ms", cfg.nest_simtime);
    println!("datadir: {}", cfg.datadir.display());
    if let Some(exp) = cfg.experiment_path() {
        println!("experiment: {}", exp.display());
    }
    for point in cfg.sweep_points(Path::new("<rep>")) {
        println!(
            "  {:>4} tasks on {:>3} nodes -> {}",
            point.tasks,
            point.nodes,
            point.dir.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_optional_result_dir() {
        let cli = Cli::try_parse_from(["nrpbench", "run", "cfg.yaml", "--json"]).expect("parse");
        match cli.command {
            Commands::Run {
                config,
                result_dir,
                json,
            } => {
                assert_eq!(config, PathBuf::from("cfg.yaml"));
                assert!(result_dir.is_none());
                assert!(json);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parses_prepare_with_json_output() {
        let cli = Cli::try_parse_from(["nrpbench", "prepare", "cfg.yaml", "out", "--json"])
            .expect("parse");
        assert!(command_json_mode(&cli.command));
        match cli.command {
            Commands::Prepare {
                config, result_dir, ..
            } => {
                assert_eq!(config, PathBuf::from("cfg.yaml"));
                assert_eq!(result_dir, Some(PathBuf::from("out")));
            }
            _ => panic!("expected prepare"),
        }
        assert!(Cli::try_parse_from(["nrpbench", "prepare"]).is_err());
    }

    #[test]
    fn aggregate_requires_a_directory() {
        assert!(Cli::try_parse_from(["nrpbench", "aggregate"]).is_err());
        let cli = Cli::try_parse_from(["nrpbench", "-v", "aggregate", "a", "b"]).expect("parse");
        assert!(cli.verbose);
        assert!(!command_json_mode(&cli.command));
    }

    #[test]
    fn json_error_shape() {
        let v = json_error("format_error", "bad".to_string(), json!({}));
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "format_error");
    }
}
