//! Nodes and transitions.

use super::Guard;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of a flow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Invokes a jober, then follows its single event.
    State,
    /// Routes each context to the first event whose guard matches.
    Condition,
    /// Parks contexts until an external resume supplies a payload.
    Gate,
    /// Copies each context to every outgoing event.
    Parallel,
    /// Terminal node; archives contexts.
    End,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State => write!(f, "state"),
            Self::Condition => write!(f, "condition"),
            Self::Gate => write!(f, "gate"),
            Self::Parallel => write!(f, "parallel"),
            Self::End => write!(f, "end"),
        }
    }
}

/// How a fan-in threshold is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanInMode {
    /// Emit exactly `min` contexts once that many have arrived.
    #[default]
    Exact,
    /// Emit every arrived context once at least `min` are present.
    AtLeast,
}

/// Fan-in gating: a node buffers contexts sharing a batch until `min` arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FanIn {
    /// Minimum number of sibling contexts.
    pub min: usize,
    /// Whether extra arrivals join the emission.
    #[serde(default)]
    pub mode: FanInMode,
}

impl FanIn {
    /// Emit exactly `min` contexts.
    #[must_use]
    pub const fn exact(min: usize) -> Self {
        Self {
            min,
            mode: FanInMode::Exact,
        }
    }

    /// Emit all arrived contexts once `min` are present.
    #[must_use]
    pub const fn at_least(min: usize) -> Self {
        Self {
            min,
            mode: FanInMode::AtLeast,
        }
    }

    /// Returns how many of `arrived` contexts to emit, if the threshold is met.
    #[must_use]
    pub fn take(&self, arrived: usize) -> Option<usize> {
        if arrived < self.min {
            return None;
        }
        match self.mode {
            FanInMode::Exact => Some(self.min),
            FanInMode::AtLeast => Some(arrived),
        }
    }
}

/// A directed, optionally guarded transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    /// Event id, unique within its node.
    pub id: String,
    /// Target node id.
    pub target: String,
    /// Guard; `None` means unconditional (a catch-all on condition nodes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Guard>,
}

impl FlowEvent {
    /// Creates an unguarded event.
    #[must_use]
    pub fn new(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            guard: None,
        }
    }

    /// Sets the guard.
    #[must_use]
    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Returns true if the event fires for `data`.
    #[must_use]
    pub fn matches(&self, data: &serde_json::Value) -> bool {
        self.guard.as_ref().map_or(true, |g| g.evaluate(data))
    }
}

/// One node of a flow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    /// Stable node id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Node kind.
    pub kind: NodeKind,
    /// Ordered outgoing transitions.
    #[serde(default)]
    pub events: Vec<FlowEvent>,
    /// Name of the jober a state node expects to be bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jober: Option<String>,
    /// Fan-in threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_in: Option<FanIn>,
}

impl FlowNode {
    /// Creates a node of the given kind.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            events: Vec::new(),
            jober: None,
            fan_in: None,
        }
    }

    /// Creates a state node.
    #[must_use]
    pub fn state(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::State)
    }

    /// Creates a condition node.
    #[must_use]
    pub fn condition(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Condition)
    }

    /// Creates a gate node.
    #[must_use]
    pub fn gate(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Gate)
    }

    /// Creates a parallel fork node.
    #[must_use]
    pub fn parallel(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Parallel)
    }

    /// Creates an end node.
    #[must_use]
    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::End)
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds an unguarded event to `target`.
    #[must_use]
    pub fn to(mut self, target: impl Into<String>) -> Self {
        let target = target.into();
        let id = format!("{}->{}", self.id, target);
        self.events.push(FlowEvent::new(id, target));
        self
    }

    /// Adds a guarded event to `target`.
    #[must_use]
    pub fn when(mut self, guard: Guard, target: impl Into<String>) -> Self {
        let target = target.into();
        let id = format!("{}->{}", self.id, target);
        self.events.push(FlowEvent::new(id, target).with_guard(guard));
        self
    }

    /// Adds a trailing catch-all event to `target`.
    #[must_use]
    pub fn otherwise(self, target: impl Into<String>) -> Self {
        self.to(target)
    }

    /// Adds a prepared event.
    #[must_use]
    pub fn with_event(mut self, event: FlowEvent) -> Self {
        self.events.push(event);
        self
    }

    /// Names the jober to bind.
    #[must_use]
    pub fn with_jober(mut self, name: impl Into<String>) -> Self {
        self.jober = Some(name.into());
        self
    }

    /// Sets the fan-in threshold.
    #[must_use]
    pub fn with_fan_in(mut self, fan_in: FanIn) -> Self {
        self.fan_in = Some(fan_in);
        self
    }

    /// Returns true for the terminal kind.
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.kind == NodeKind::End
    }

    /// Returns the first event matching `data`, in declaration order.
    #[must_use]
    pub fn route(&self, data: &serde_json::Value) -> Option<&FlowEvent> {
        self.events.iter().find(|e| e.matches(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fan_in_take() {
        assert_eq!(FanIn::exact(3).take(2), None);
        assert_eq!(FanIn::exact(3).take(3), Some(3));
        assert_eq!(FanIn::exact(3).take(5), Some(3));
        assert_eq!(FanIn::at_least(3).take(5), Some(5));
    }

    #[test]
    fn test_route_first_match_wins() {
        let node = FlowNode::condition("c")
            .when(Guard::gt("n", 10), "big")
            .when(Guard::gt("n", 1), "medium")
            .otherwise("small");

        assert_eq!(node.route(&json!({"n": 50})).map(|e| e.target.as_str()), Some("big"));
        assert_eq!(node.route(&json!({"n": 5})).map(|e| e.target.as_str()), Some("medium"));
        assert_eq!(node.route(&json!({"n": 0})).map(|e| e.target.as_str()), Some("small"));
    }

    #[test]
    fn test_route_without_catch_all() {
        let node = FlowNode::condition("c").when(Guard::equals("bool1", true), "a");
        assert!(node.route(&json!({"bool1": false})).is_none());
    }

    #[test]
    fn test_node_builders() {
        let node = FlowNode::state("s1")
            .with_name("Fetch")
            .with_jober("fetcher")
            .with_fan_in(FanIn::at_least(2))
            .to("end");

        assert_eq!(node.kind, NodeKind::State);
        assert_eq!(node.name, "Fetch");
        assert_eq!(node.events[0].id, "s1->end");
        assert_eq!(node.jober.as_deref(), Some("fetcher"));
        assert_eq!(node.kind.to_string(), "state");
    }
}
