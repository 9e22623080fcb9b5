//! Build ordering using `petgraph`.
//!
//! Recipes that inherit from other requested recipes must be built after
//! them, so that the child picks up the freshly built parent.

use std::collections::BTreeMap;

use petgraph::graph::{DiGraph, NodeIndex};
use recast_common::error::{RecastError, Result};

use crate::recipe::Recipe;

/// Orders `recipes` so that local parents come before their children.
///
/// Parents outside the requested set are not added; they are expected to
/// exist in the store already. Independent recipes keep their relative
/// input order where the graph allows it.
///
/// # Errors
///
/// Returns an error if the requested recipes inherit from each other in a
/// cycle.
pub fn build_order(recipes: Vec<Recipe>) -> Result<Vec<Recipe>> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut nodes: BTreeMap<&str, NodeIndex> = BTreeMap::new();
    for (i, recipe) in recipes.iter().enumerate() {
        let _ = nodes.insert(recipe.name.as_str(), graph.add_node(i));
    }
    for recipe in &recipes {
        let Some(parent) = recipe.local_parent() else {
            continue;
        };
        if let (Some(&parent), Some(&child)) = (nodes.get(parent), nodes.get(recipe.name.as_str())) {
            // Edge from dependency to dependent so toposort yields parents first.
            let _ = graph.add_edge(parent, child, ());
        }
    }

    let order = petgraph::algo::toposort(&graph, None).map_err(|cycle| {
        let name = graph
            .node_weight(cycle.node_id())
            .and_then(|&i| recipes.get(i))
            .map_or("?", |r| r.name.as_str());
        RecastError::Config {
            message: format!("cyclic inheritance detected involving recipe '{name}'"),
        }
    })?;
    let positions: Vec<usize> = order
        .into_iter()
        .filter_map(|idx| graph.node_weight(idx).copied())
        .collect();

    let mut slots: Vec<Option<Recipe>> = recipes.into_iter().map(Some).collect();
    let ordered: Vec<Recipe> = positions
        .into_iter()
        .filter_map(|i| slots.get_mut(i).and_then(Option::take))
        .collect();
    tracing::debug!(
        order = ?ordered.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
        "build order resolved"
    );
    Ok(ordered)
}
