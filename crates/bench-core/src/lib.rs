//! Shared building blocks of the NRP/NEST benchmark toolkit: node-list
//! expansion, run configuration, scheduler environment and the on-disk
//! artifact formats.

pub mod artifacts;
pub mod config;
pub mod env;
pub mod error;
pub mod nodelist;

pub use config::{
    load_config, load_config_with_home, load_secrets, resolve_secrets, RunConfig, Secrets,
    SweepPoint, TestCase, Timeouts,
};
pub use env::SlurmEnv;
pub use error::{BenchError, Result};
pub use nodelist::{expand_nodelist, expand_nodelist_with_width};
