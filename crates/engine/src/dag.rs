//! DAG validation: run this before executing a pipeline.
//!
//! Rules enforced:
//! 1. The pipeline has at least one node.
//! 2. Node IDs must be unique within the pipeline.
//! 3. Every edge must reference valid node IDs (both ends).
//! 4. The directed graph must be acyclic (topological sort must succeed).
//!
//! Saving a pipeline only checks 2 and 3; acyclicity is enforced when a run
//! starts.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::{models::PipelineDefinition, EngineError};

/// Check node id uniqueness and edge endpoints.
///
/// # Errors
/// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
/// - [`EngineError::UnknownNodeReference`] if an edge references a missing node.
pub fn validate_structure(def: &PipelineDefinition) -> Result<(), EngineError> {
    let mut seen_ids: HashSet<&str> = HashSet::new();
    for node in &def.nodes {
        if !seen_ids.insert(node.node_id.as_str()) {
            return Err(EngineError::DuplicateNodeId(node.node_id.clone()));
        }
    }

    for edge in &def.edges {
        if !seen_ids.contains(edge.source_node.as_str()) {
            return Err(EngineError::UnknownNodeReference {
                node_id: edge.source_node.clone(),
                side: "source",
            });
        }
        if !seen_ids.contains(edge.target_node.as_str()) {
            return Err(EngineError::UnknownNodeReference {
                node_id: edge.target_node.clone(),
                side: "target",
            });
        }
    }

    Ok(())
}

/// Validate the pipeline's DAG and return node ids in topological order.
///
/// Kahn's algorithm with a FIFO queue seeded in node order, so the result
/// is deterministic for a given definition.
///
/// # Errors
/// - [`EngineError::EmptyPipeline`] if there are no nodes.
/// - anything [`validate_structure`] reports.
/// - [`EngineError::CycleDetected`] if the graph is not acyclic.
pub fn topological_order(def: &PipelineDefinition) -> Result<Vec<String>, EngineError> {
    if def.nodes.is_empty() {
        return Err(EngineError::EmptyPipeline);
    }
    validate_structure(def)?;

    // Build adjacency list and in-degree map.
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();

    for node in &def.nodes {
        adjacency.entry(node.node_id.as_str()).or_default();
        in_degree.entry(node.node_id.as_str()).or_insert(0);
    }

    for edge in &def.edges {
        adjacency
            .entry(edge.source_node.as_str())
            .or_default()
            .push(edge.target_node.as_str());
        *in_degree.entry(edge.target_node.as_str()).or_insert(0) += 1;
    }

    // Seed the queue with nodes that have no incoming edges.
    let mut queue: VecDeque<&str> = def
        .nodes
        .iter()
        .map(|n| n.node_id.as_str())
        .filter(|id| in_degree.get(id).copied() == Some(0))
        .collect();

    let mut sorted: Vec<String> = Vec::with_capacity(def.nodes.len());

    while let Some(node_id) = queue.pop_front() {
        sorted.push(node_id.to_owned());

        if let Some(neighbours) = adjacency.get(node_id) {
            for &neighbour in neighbours {
                let deg = in_degree.entry(neighbour).or_insert(0);
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(neighbour);
                }
            }
        }
    }

    // If we didn't visit every node the graph contains a cycle.
    if sorted.len() != def.nodes.len() {
        return Err(EngineError::CycleDetected);
    }

    Ok(sorted)
}
