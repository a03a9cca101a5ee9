//! Flow definitions and their validating builder.

use super::{FlowNode, NodeKind};
use crate::errors::{DefinitionError, DefinitionErrorInfo};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};

/// A named, versioned, validated flow graph.
///
/// Construction goes through [`FlowDefinitionBuilder`], which rejects every
/// structural defect up front so that the runtime never meets one.
#[derive(Debug, Clone, Serialize)]
pub struct FlowDefinition {
    name: String,
    version: String,
    stream_id: String,
    start: String,
    nodes: HashMap<String, FlowNode>,
    /// Declaration order of node ids.
    order: Vec<String>,
}

impl FlowDefinition {
    /// Starts a builder.
    #[must_use]
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> FlowDefinitionBuilder {
        FlowDefinitionBuilder::new(name, version)
    }

    /// Returns the definition name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the definition version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the stream id scoping all runtime state of this graph.
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn lookup_node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.get(id)
    }

    /// Returns the start node.
    #[must_use]
    pub fn start_node(&self) -> &FlowNode {
        // The builder guarantees the start node exists.
        &self.nodes[&self.start]
    }

    /// Returns node ids in declaration order.
    #[must_use]
    pub fn node_ids(&self) -> &[String] {
        &self.order
    }

    /// Returns nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Builder for creating validated flow definitions.
#[derive(Debug, Clone)]
pub struct FlowDefinitionBuilder {
    name: String,
    version: String,
    stream_id: Option<String>,
    start: Option<String>,
    nodes: Vec<FlowNode>,
}

impl FlowDefinitionBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            stream_id: None,
            start: None,
            nodes: Vec::new(),
        }
    }

    /// Overrides the stream id (defaults to `name:version`).
    #[must_use]
    pub fn stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    /// Sets the start node (defaults to the first node added).
    #[must_use]
    pub fn start(mut self, id: impl Into<String>) -> Self {
        self.start = Some(id.into());
        self
    }

    /// Adds a node.
    #[must_use]
    pub fn node(mut self, node: FlowNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Validates and builds the definition.
    ///
    /// # Errors
    ///
    /// Returns a [`DefinitionError`] describing the first defect found.
    pub fn build(self) -> Result<FlowDefinition, DefinitionError> {
        if self.nodes.is_empty() {
            return Err(DefinitionError::new(format!("Flow '{}' has no nodes", self.name))
                .with_error_info(
                    DefinitionErrorInfo::new("FLOW-DEF-EMPTY", "Cannot build an empty flow")
                        .with_fix_hint("Add at least a start node and an end node."),
                ));
        }

        let mut order = Vec::with_capacity(self.nodes.len());
        let mut nodes = HashMap::with_capacity(self.nodes.len());
        for node in self.nodes {
            if nodes.contains_key(&node.id) {
                return Err(DefinitionError::new(format!("Duplicate node id '{}'", node.id))
                    .with_nodes(vec![node.id.clone()])
                    .with_error_info(
                        DefinitionErrorInfo::new(
                            "FLOW-DEF-DUPLICATE_NODE",
                            "Node ids must be unique",
                        )
                        .with_context_entry("node", node.id.clone()),
                    ));
            }
            order.push(node.id.clone());
            nodes.insert(node.id.clone(), node);
        }

        let start = self.start.unwrap_or_else(|| order[0].clone());
        if !nodes.contains_key(&start) {
            return Err(DefinitionError::new(format!("Start node '{start}' does not exist"))
                .with_nodes(vec![start.clone()])
                .with_error_info(DefinitionErrorInfo::new(
                    "FLOW-DEF-MISSING_START",
                    "The designated start node is not declared",
                )));
        }

        for id in &order {
            validate_node(&nodes[id], &nodes)?;
        }
        check_reachability(&start, &order, &nodes)?;

        let stream_id = self
            .stream_id
            .unwrap_or_else(|| format!("{}:{}", self.name, self.version));

        Ok(FlowDefinition {
            name: self.name,
            version: self.version,
            stream_id,
            start,
            nodes,
            order,
        })
    }
}

fn validate_node(
    node: &FlowNode,
    nodes: &HashMap<String, FlowNode>,
) -> Result<(), DefinitionError> {
    for event in &node.events {
        if !nodes.contains_key(&event.target) {
            return Err(DefinitionError::new(format!(
                "Node '{}' has event '{}' targeting unknown node '{}'",
                node.id, event.id, event.target
            ))
            .with_nodes(vec![node.id.clone(), event.target.clone()])
            .with_error_info(
                DefinitionErrorInfo::new("FLOW-DEF-UNKNOWN_TARGET", "Event target not found")
                    .with_fix_hint("Declare the target node or fix the event target."),
            ));
        }
    }

    let shape = |code: &str, summary: &str| {
        DefinitionError::new(format!("{} node '{}': {}", node.kind, node.id, summary))
            .with_nodes(vec![node.id.clone()])
            .with_error_info(DefinitionErrorInfo::new(code, summary))
    };

    match node.kind {
        NodeKind::End if !node.events.is_empty() => {
            return Err(shape("FLOW-DEF-END_HAS_EVENTS", "end nodes cannot have events"));
        }
        NodeKind::End => {}
        _ if node.events.is_empty() => {
            return Err(shape("FLOW-DEF-NO_EVENTS", "non-end nodes need at least one event"));
        }
        NodeKind::State | NodeKind::Gate if node.events.len() != 1 => {
            return Err(shape("FLOW-DEF-SINGLE_EVENT", "exactly one outgoing event is required"));
        }
        NodeKind::State | NodeKind::Gate | NodeKind::Parallel
            if node.events.iter().any(|e| e.guard.is_some()) =>
        {
            return Err(shape("FLOW-DEF-GUARDED_EVENT", "only condition events may be guarded"));
        }
        NodeKind::Condition => {
            let last = node.events.len() - 1;
            if node.events.iter().take(last).any(|e| e.guard.is_none()) {
                return Err(shape(
                    "FLOW-DEF-CATCH_ALL_POSITION",
                    "an unguarded catch-all event must be the last event",
                ));
            }
        }
        _ => {}
    }

    if let Some(fan_in) = node.fan_in {
        if fan_in.min == 0 {
            return Err(shape("FLOW-DEF-FAN_IN", "fan-in minimum must be at least 1"));
        }
    }

    Ok(())
}

fn check_reachability(
    start: &str,
    order: &[String],
    nodes: &HashMap<String, FlowNode>,
) -> Result<(), DefinitionError> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue = VecDeque::from([start]);
    seen.insert(start);

    while let Some(id) = queue.pop_front() {
        for event in &nodes[id].events {
            if seen.insert(event.target.as_str()) {
                queue.push_back(event.target.as_str());
            }
        }
    }

    let unreachable: Vec<String> = order
        .iter()
        .filter(|id| !seen.contains(id.as_str()))
        .cloned()
        .collect();
    if unreachable.is_empty() {
        return Ok(());
    }

    Err(DefinitionError::new(format!(
        "Nodes unreachable from start '{}': {}",
        start,
        unreachable.join(", ")
    ))
    .with_nodes(unreachable)
    .with_error_info(
        DefinitionErrorInfo::new("FLOW-DEF-UNREACHABLE", "Every node must be reachable from start")
            .with_fix_hint("Remove the orphaned nodes or add events leading to them."),
    ))
}
