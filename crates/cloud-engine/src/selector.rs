//! Node selector: an additive scoreboard over the cluster's nodes,
//! blacklisted nodes dropped after scoring, highest surviving score wins.

use cloud_core::config::EngineConfig;
use cloud_core::error::{EngineError, EngineResult};
use cloud_core::model::Specs;
use cloud_transport::rest::{ClusterApi, NodeResource};

/// Rank nodes against `specs` and return the winner's name, or
/// `NoSchedulable` if none survive.
pub async fn select_node(
    cluster: &dyn ClusterApi,
    config: &EngineConfig,
    specs: &Specs,
) -> EngineResult<String> {
    let nodes = cluster
        .list_nodes()
        .await
        .map_err(|e| EngineError::resource_unavailable("could not list cluster nodes", e))?;

    if nodes.is_empty() {
        return Err(EngineError::NoSchedulable("cluster reports no nodes".to_string()));
    }

    let required_bytes = specs.memory_mb.saturating_mul(1_000_000);

    let mut scored: Vec<(String, i32)> = nodes
        .iter()
        .filter(|n| !config.node_blacklist.contains(&n.node))
        .map(|n| (n.node.clone(), score_node(n, required_bytes, specs.cores)))
        .collect();

    // Stable: keep original cluster-listing order; pick the first node
    // holding the maximum score.
    scored.sort_by(|a, b| b.1.cmp(&a.1));
    let best = scored
        .into_iter()
        .max_by_key(|(_, score)| *score)
        .map(|(name, _)| name);

    best.ok_or_else(|| EngineError::NoSchedulable("no node survived blacklist filtering".to_string()))
}

fn score_node(node: &NodeResource, required_bytes: u64, required_cores: u32) -> i32 {
    let maxmem = node.maxmem.unwrap_or(0);
    let mem = node.mem.unwrap_or(0);
    let maxcpu = node.maxcpu.unwrap_or(0);

    let mut score = 0;
    if maxmem.saturating_sub(mem) > required_bytes {
        score += 1;
    }
    if maxmem > 0 && (mem as f64 / maxmem as f64) < 0.6 {
        score += 1;
    }
    if maxcpu >= required_cores as u64 {
        score += 1;
    }
    score
}
