//! Expansion of SLURM's compressed host-list notation.
//!
//! `nid0[27,48,50-52]` expands to
//! `["nid00027", "nid00048", "nid00050", "nid00051", "nid00052"]`.
//! Position matters downstream: entry 0 hosts the NRP, entry 1 is the
//! NEST master, so duplicates are kept and source order is preserved.

use crate::error::{BenchError, Result};

/// Total hostname width produced by [`expand_nodelist`].
pub const HOSTNAME_WIDTH: usize = 8;

/// Upper bound on the number of hosts one spec may expand to.
pub const MAX_NODES: usize = 100_000;

/// Expands `spec`, zero-padding ids so every hostname is
/// [`HOSTNAME_WIDTH`] characters long. Ids wider than the remaining space
/// are never truncated.
pub fn expand_nodelist(spec: &str) -> Result<Vec<String>> {
    let (prefix, _) = split_spec(spec)?;
    let width = HOSTNAME_WIDTH.saturating_sub(prefix.len());
    expand_nodelist_with_width(spec, width)
}

/// Expands `spec` with a caller-chosen id width.
pub fn expand_nodelist_with_width(spec: &str, width: usize) -> Result<Vec<String>> {
    let (prefix, body) = split_spec(spec)?;
    let ids = parse_ids(spec, body)?;
    Ok(ids
        .into_iter()
        .map(|id| format!("{}{:0width$}", prefix, id, width = width))
        .collect())
}

fn split_spec(spec: &str) -> Result<(&str, &str)> {
    let spec_trimmed = spec.trim();
    if spec_trimmed.matches('[').count() != 1 || spec_trimmed.matches(']').count() != 1 {
        return Err(BenchError::format(spec, "expected exactly one bracket pair"));
    }
    let open = spec_trimmed.find('[').unwrap_or(0);
    let close = spec_trimmed.find(']').unwrap_or(0);
    if close < open {
        return Err(BenchError::format(spec, "']' precedes '['"));
    }
    if close != spec_trimmed.len() - 1 {
        return Err(BenchError::format(spec, "trailing text after ']'"));
    }
    Ok((&spec_trimmed[..open], &spec_trimmed[open + 1..close]))
}

fn parse_ids(spec: &str, body: &str) -> Result<Vec<u64>> {
    if body.trim().is_empty() {
        return Err(BenchError::format(spec, "empty id list"));
    }
    let mut ids = Vec::new();
    for token in body.split(',') {
        let token = token.trim();
        if token.is_empty() {
            return Err(BenchError::format(spec, "empty id token"));
        }
        match token.split_once('-') {
            Some((a, b)) => {
                let lo = parse_id(spec, a)?;
                let hi = parse_id(spec, b)?;
                if lo > hi {
                    return Err(BenchError::format(
                        spec,
                        format!("descending range '{}'", token),
                    ));
                }
                // len + (hi - lo + 1) > MAX_NODES
                if (ids.len() as u64).saturating_add(hi - lo) >= MAX_NODES as u64 {
                    return Err(BenchError::format(
                        spec,
                        format!("range '{}' exceeds {} hosts", token, MAX_NODES),
                    ));
                }
                ids.extend(lo..=hi);
            }
            None => {
                if ids.len() >= MAX_NODES {
                    return Err(BenchError::format(
                        spec,
                        format!("more than {} hosts", MAX_NODES),
                    ));
                }
                ids.push(parse_id(spec, token)?);
            }
        }
    }
    Ok(ids)
}

fn parse_id(spec: &str, raw: &str) -> Result<u64> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(BenchError::format(spec, format!("invalid id '{}'", raw)));
    }
    raw.parse::<u64>()
        .map_err(|e| BenchError::format(spec, format!("invalid id '{}': {}", raw, e)))
}
