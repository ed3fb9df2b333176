use anyhow::{Result, bail};
use tracing::info;

use crate::models::NodeRef;

/// Pick the candidate named by `hint`, falling back to the first one.
///
/// The fallback is index 0 whether the hint is absent or names a node that is
/// not among the candidates, so runs stay deterministic on multi-node pools.
pub fn pick_node_index(candidates: &[NodeRef], hint: Option<&str>) -> usize {
    let Some(name) = hint else {
        info!("no target node requested, picking the first candidate");
        return 0;
    };

    match candidates.iter().position(|node| node.name() == name) {
        Some(idx) => {
            info!("node {:?} found among candidates, picking", name);
            idx
        }
        None => {
            info!(
                "node {:?} not found among {} candidates, falling back to the first one",
                name,
                candidates.len()
            );
            0
        }
    }
}

/// Select the target node from a non-empty candidate list
pub fn pick_node<'a>(candidates: &'a [NodeRef], hint: Option<&str>) -> Result<&'a NodeRef> {
    if candidates.is_empty() {
        bail!("no candidate nodes to select from");
    }
    Ok(&candidates[pick_node_index(candidates, hint)])
}
