//! Core domain models for the run engine.
//!
//! These types are the source of truth for what a pipeline looks like
//! in memory.  They serialise to/from the JSONB `definition` column of the
//! `pipelines` table and the snapshot kept on every run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use db::models::{NodeRunRow, PipelineRow, RunRow};

use crate::EngineError;

// ---------------------------------------------------------------------------
// NodeType
// ---------------------------------------------------------------------------

/// The kind of work a node performs.
///
/// `input` and `output` are accepted as aliases of `start` and `end`; any
/// unrecognised type is a `job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    Start,
    End,
    Job,
    Condition,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Job => "job",
            Self::Condition => "condition",
        }
    }
}

impl From<String> for NodeType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "start" | "input" => Self::Start,
            "end" | "output" => Self::End,
            "condition" => Self::Condition,
            _ => Self::Job,
        }
    }
}

impl From<NodeType> for String {
    fn from(t: NodeType) -> Self {
        t.as_str().to_owned()
    }
}

// ---------------------------------------------------------------------------
// Node / Edge
// ---------------------------------------------------------------------------

/// A single step in the pipeline graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within this pipeline (referenced by edges).
    #[serde(alias = "id")]
    pub node_id: String,
    #[serde(alias = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub label: String,
    /// Free-form configuration handed to the node implementation.
    #[serde(default = "empty_object")]
    pub config: Value,
}

impl Node {
    pub fn new(node_id: impl Into<String>, node_type: NodeType) -> Self {
        let node_id = node_id.into();
        Self {
            label: node_id.clone(),
            node_id,
            node_type,
            config: empty_object(),
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Label, or the id when the label is blank.
    pub fn display_label(&self) -> &str {
        if self.label.trim().is_empty() {
            &self.node_id
        } else {
            &self.label
        }
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Directed edge from one node to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(alias = "source")]
    pub source_node: String,
    #[serde(alias = "target")]
    pub target_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source_node: source.into(),
            target_node: target.into(),
            label: None,
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineDefinition
// ---------------------------------------------------------------------------

/// The graph itself: nodes in author order plus edges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl PipelineDefinition {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn from_value(value: Value) -> Result<Self, EngineError> {
        serde_json::from_value(value).map_err(|e| EngineError::InvalidDefinition(e.to_string()))
    }

    pub fn to_value(&self) -> Result<Value, EngineError> {
        serde_json::to_value(self).map_err(|e| EngineError::InvalidDefinition(e.to_string()))
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.node_id.clone()).collect()
    }

    /// Sources of every edge that ends at `node_id`.
    pub fn predecessors<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.edges
            .iter()
            .filter(move |e| e.target_node == node_id)
            .map(|e| e.source_node.as_str())
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A stored pipeline with its decoded definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    #[serde(flatten)]
    pub definition: PipelineDefinition,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<PipelineRow> for Pipeline {
    type Error = EngineError;

    fn try_from(row: PipelineRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            description: row.description,
            definition: PipelineDefinition::from_value(row.definition)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// RunDetails
// ---------------------------------------------------------------------------

/// A run together with the state of each of its nodes.
#[derive(Debug, Clone, Serialize)]
pub struct RunDetails {
    #[serde(flatten)]
    pub run: RunRow,
    pub node_runs: Vec<NodeRunRow>,
}

impl RunDetails {
    pub fn node(&self, node_id: &str) -> Option<&NodeRunRow> {
        self.node_runs.iter().find(|n| n.node_id == node_id)
    }
}
