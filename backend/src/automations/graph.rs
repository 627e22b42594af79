// Workflow graph: persisted nodes and connections hydrated once per run
// into an adjacency structure, so advancing the pointer never goes back to
// the database for edge lookups.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

use super::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Trigger,
    Action,
    Condition,
    Delay,
}

/// The closed set of action subtypes an action node can carry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SendMessage,
    SendTemplate,
    SendEmail,
    MoveStage,
    AddTag,
    RemoveTag,
    CreateTask,
    AssignUser,
    CallWebhook,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Trigger,
    Action(ActionKind),
    Condition,
    Delay,
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: Uuid,
    pub kind: NodeKind,
    pub config: Value,
}

#[derive(Debug, Clone)]
struct GraphEdge {
    target: Uuid,
    condition_branch: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
struct NodeRow {
    id: Uuid,
    node_type: String,
    action_type: Option<String>,
    config: Value,
}

#[derive(Debug, Clone, FromRow)]
struct ConnectionRow {
    source_node_id: Uuid,
    target_node_id: Uuid,
    condition_branch: Option<String>,
}

/// In-memory workflow graph: nodes keyed by id, adjacency list with branch
/// labels. Orphan nodes (no inbound edge, not the trigger) are unreachable
/// and inert by design, not an error.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    nodes: HashMap<Uuid, GraphNode>,
    adjacency: HashMap<Uuid, Vec<GraphEdge>>,
    trigger_node_id: Option<Uuid>,
}

impl WorkflowGraph {
    /// Hydrate the graph for one automation from its node/connection rows.
    pub async fn hydrate(pool: &PgPool, automation_id: Uuid) -> EngineResult<Self> {
        let node_rows = sqlx::query_as::<_, NodeRow>(
            "SELECT id, node_type, action_type, config FROM automation_nodes WHERE automation_id = $1",
        )
        .bind(automation_id)
        .fetch_all(pool)
        .await?;

        let connection_rows = sqlx::query_as::<_, ConnectionRow>(
            r#"
            SELECT source_node_id, target_node_id, condition_branch
            FROM automation_connections
            WHERE automation_id = $1
            "#,
        )
        .bind(automation_id)
        .fetch_all(pool)
        .await?;

        Self::build(node_rows, connection_rows)
    }

    fn build(node_rows: Vec<NodeRow>, connection_rows: Vec<ConnectionRow>) -> EngineResult<Self> {
        let mut nodes = HashMap::new();
        let mut trigger_node_id = None;

        for row in node_rows {
            let node_type: NodeType = parse_enum(&row.node_type)
                .ok_or_else(|| EngineError::InvalidGraph(format!("unknown node type '{}'", row.node_type)))?;

            let kind = match node_type {
                NodeType::Trigger => {
                    trigger_node_id = Some(row.id);
                    NodeKind::Trigger
                }
                NodeType::Action => {
                    let action_type = row.action_type.as_deref().ok_or_else(|| {
                        EngineError::InvalidGraph(format!("action node {} has no action type", row.id))
                    })?;
                    let action: ActionKind = parse_enum(action_type).ok_or_else(|| {
                        EngineError::InvalidGraph(format!("unknown action type '{}'", action_type))
                    })?;
                    NodeKind::Action(action)
                }
                NodeType::Condition => NodeKind::Condition,
                NodeType::Delay => NodeKind::Delay,
            };

            nodes.insert(
                row.id,
                GraphNode {
                    id: row.id,
                    kind,
                    config: row.config,
                },
            );
        }

        let mut adjacency: HashMap<Uuid, Vec<GraphEdge>> = HashMap::new();
        for row in connection_rows {
            adjacency.entry(row.source_node_id).or_default().push(GraphEdge {
                target: row.target_node_id,
                condition_branch: row.condition_branch,
            });
        }

        Ok(Self {
            nodes,
            adjacency,
            trigger_node_id,
        })
    }

    pub fn node(&self, id: Uuid) -> Option<&GraphNode> {
        self.nodes.get(&id)
    }

    pub fn trigger_node_id(&self) -> Option<Uuid> {
        self.trigger_node_id
    }

    /// The first actionable node: the target of the trigger node's single
    /// outgoing edge. `None` means the workflow has nothing to do.
    pub fn entry_node_id(&self) -> Option<Uuid> {
        self.next(self.trigger_node_id?)
    }

    /// Default advancement for non-branching nodes.
    pub fn next(&self, from: Uuid) -> Option<Uuid> {
        self.adjacency.get(&from).and_then(|edges| edges.first()).map(|e| e.target)
    }

    /// Pick the outgoing connection matching a condition node's evaluated
    /// branch, falling back to a "default" labelled edge.
    pub fn branch(&self, from: Uuid, label: &str) -> Option<Uuid> {
        let edges = self.adjacency.get(&from)?;

        edges
            .iter()
            .find(|e| e.condition_branch.as_deref() == Some(label))
            .or_else(|| edges.iter().find(|e| e.condition_branch.as_deref() == Some("default")))
            .map(|e| e.target)
    }

    pub fn is_terminal(&self, id: Uuid) -> bool {
        self.adjacency.get(&id).map(|edges| edges.is_empty()).unwrap_or(true)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Parse a stored snake_case discriminator through its serde representation,
/// the same way trigger types are read off their rows.
fn parse_enum<T: serde::de::DeserializeOwned>(raw: &str) -> Option<T> {
    serde_json::from_str(&format!("\"{}\"", raw)).ok()
}
