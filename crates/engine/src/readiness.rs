//! Which nodes can run next.

use std::collections::HashMap;

use db::models::{NodeRunRow, NodeRunStatus};

use crate::models::PipelineDefinition;

/// Nodes that are `PENDING` and whose every predecessor is `COMPLETED`,
/// in pipeline node order.
///
/// Pure: the answer depends only on the persisted node run statuses, so
/// calling it twice without a state change yields the same set.  Nodes
/// without a node run row are never ready.
pub fn ready_nodes(def: &PipelineDefinition, node_runs: &[NodeRunRow]) -> Vec<String> {
    let status: HashMap<&str, NodeRunStatus> = node_runs
        .iter()
        .map(|n| (n.node_id.as_str(), n.status))
        .collect();

    def.nodes
        .iter()
        .filter(|node| status.get(node.node_id.as_str()) == Some(&NodeRunStatus::Pending))
        .filter(|node| {
            def.predecessors(&node.node_id)
                .all(|p| status.get(p) == Some(&NodeRunStatus::Completed))
        })
        .map(|node| node.node_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Edge, Node, NodeType};
    use uuid::Uuid;

    fn diamond() -> PipelineDefinition {
        PipelineDefinition::new(
            vec![
                Node::new("start", NodeType::Start),
                Node::new("a", NodeType::Job),
                Node::new("b", NodeType::Job),
                Node::new("merge", NodeType::Condition),
                Node::new("end", NodeType::End),
            ],
            vec![
                Edge::new("start", "a"),
                Edge::new("start", "b"),
                Edge::new("a", "merge"),
                Edge::new("b", "merge"),
                Edge::new("merge", "end"),
            ],
        )
    }

    fn runs(states: &[(&str, NodeRunStatus)]) -> Vec<NodeRunRow> {
        let run_id = Uuid::new_v4();
        states
            .iter()
            .map(|(id, status)| NodeRunRow {
                id: Uuid::new_v4(),
                run_id,
                node_id: (*id).to_owned(),
                status: *status,
                job_id: None,
                input: None,
                output: None,
                error: None,
                started_at: None,
                completed_at: None,
            })
            .collect()
    }

    use NodeRunStatus::*;

    #[test]
    fn only_roots_are_ready_at_start() {
        let state = runs(&[
            ("start", Pending),
            ("a", Pending),
            ("b", Pending),
            ("merge", Pending),
            ("end", Pending),
        ]);
        assert_eq!(ready_nodes(&diamond(), &state), ["start"]);
    }

    #[test]
    fn fan_out_makes_both_branches_ready() {
        let state = runs(&[
            ("start", Completed),
            ("a", Pending),
            ("b", Pending),
            ("merge", Pending),
            ("end", Pending),
        ]);
        assert_eq!(ready_nodes(&diamond(), &state), ["a", "b"]);
    }

    #[test]
    fn fan_in_waits_for_every_predecessor() {
        let def = diamond();
        let half = runs(&[
            ("start", Completed),
            ("a", Running),
            ("b", Completed),
            ("merge", Pending),
            ("end", Pending),
        ]);
        assert!(ready_nodes(&def, &half).is_empty());

        let both = runs(&[
            ("start", Completed),
            ("a", Completed),
            ("b", Completed),
            ("merge", Pending),
            ("end", Pending),
        ]);
        assert_eq!(ready_nodes(&def, &both), ["merge"]);
        // Same state, same answer.
        assert_eq!(ready_nodes(&def, &both), ready_nodes(&def, &both));
    }

    #[test]
    fn failed_predecessor_blocks_forever() {
        let state = runs(&[
            ("start", Completed),
            ("a", Failed),
            ("b", Completed),
            ("merge", Pending),
            ("end", Pending),
        ]);
        assert!(ready_nodes(&diamond(), &state).is_empty());
    }
}
