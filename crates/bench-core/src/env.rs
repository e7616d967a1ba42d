use crate::error::{BenchError, Result};
use crate::nodelist::expand_nodelist;
use std::path::PathBuf;

pub const NODELIST_VAR: &str = "SLURM_NODELIST";
pub const JOB_ID_VAR: &str = "SLURM_JOB_ID";
pub const ACCOUNT_VAR: &str = "SLURM_JOB_ACCOUNT";
pub const NNODES_VAR: &str = "SLURM_NNODES";

/// Scheduler-provided facts about the surrounding allocation, captured once
/// at process start.
#[derive(Debug, Clone, PartialEq)]
pub struct SlurmEnv {
    pub nodelist: Vec<String>,
    pub job_id: String,
    pub account: String,
    pub nnodes: usize,
}

impl SlurmEnv {
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(NODELIST_VAR).map_err(|_| unset(NODELIST_VAR))?;
        let nodelist = expand_nodelist(&raw)?;
        let job_id = std::env::var(JOB_ID_VAR).map_err(|_| unset(JOB_ID_VAR))?;
        let account = std::env::var(ACCOUNT_VAR).unwrap_or_default();
        let nnodes = match std::env::var(NNODES_VAR) {
            Ok(v) => v.trim().parse::<usize>().map_err(|e| {
                BenchError::config(
                    PathBuf::from("<env>"),
                    format!("{}='{}': {}", NNODES_VAR, v, e),
                )
            })?,
            Err(_) => nodelist.len(),
        };
        Ok(Self {
            nodelist,
            job_id,
            account,
            nnodes,
        })
    }

    /// Host running the NRP frontend/backend (first allocated node).
    pub fn nrp_node(&self) -> Result<&str> {
        self.node(0, "NRP node")
    }

    /// Host of the NEST server master rank (second allocated node).
    pub fn nest_master(&self) -> Result<&str> {
        self.node(1, "NEST master node")
    }

    fn node(&self, idx: usize, role: &str) -> Result<&str> {
        self.nodelist.get(idx).map(|s| s.as_str()).ok_or_else(|| {
            BenchError::config(
                PathBuf::from("<env>"),
                format!(
                    "allocation has {} node(s), no {} at position {}",
                    self.nodelist.len(),
                    role,
                    idx
                ),
            )
        })
    }
}

fn unset(var: &str) -> BenchError {
    BenchError::config(PathBuf::from("<env>"), format!("{} is not set", var))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_follow_nodelist_position() {
        let env = SlurmEnv {
            nodelist: vec!["nid00027".into(), "nid00048".into()],
            job_id: "42".into(),
            account: "ich001".into(),
            nnodes: 2,
        };
        assert_eq!(env.nrp_node().expect("nrp"), "nid00027");
        assert_eq!(env.nest_master().expect("nest"), "nid00048");
    }

    #[test]
    fn single_node_allocation_has_no_nest_master() {
        let env = SlurmEnv {
            nodelist: vec!["nid00027".into()],
            job_id: "42".into(),
            account: String::new(),
            nnodes: 1,
        };
        assert!(matches!(env.nest_master(), Err(BenchError::Config { .. })));
    }

    #[test]
    fn unset_variable_error_names_the_variable() {
        let err = unset(JOB_ID_VAR);
        assert!(matches!(err, BenchError::Config { .. }));
        assert!(err.to_string().contains("SLURM_JOB_ID is not set"), "{}", err);
    }
}
