//! Flow definitions for the common graph shapes.

use crate::graph::{FanIn, FlowDefinition, FlowNode, Guard};

/// `state1 -> state2 -> end`.
#[must_use]
pub fn linear_flow() -> FlowDefinition {
    FlowDefinition::builder("linear", "1")
        .node(FlowNode::state("state1").to("state2"))
        .node(FlowNode::state("state2").to("end"))
        .node(FlowNode::end("end"))
        .build()
        .unwrap_or_else(|e| panic!("linear flow is valid: {e}"))
}

/// `start -> check`; `bool1 == true` goes to `branchA`, anything else to
/// `branchB`. Each branch ends at its own terminal node.
#[must_use]
pub fn branch_flow() -> FlowDefinition {
    FlowDefinition::builder("branch", "1")
        .node(FlowNode::state("start").to("check"))
        .node(
            FlowNode::condition("check")
                .when(Guard::equals("bool1", true), "branchA")
                .otherwise("branchB"),
        )
        .node(FlowNode::state("branchA").to("endA"))
        .node(FlowNode::state("branchB").to("endB"))
        .node(FlowNode::end("endA"))
        .node(FlowNode::end("endB"))
        .build()
        .unwrap_or_else(|e| panic!("branch flow is valid: {e}"))
}

/// `prepare -> approval (gate) -> finish -> end`.
#[must_use]
pub fn gate_flow() -> FlowDefinition {
    FlowDefinition::builder("approval", "1")
        .node(FlowNode::state("prepare").to("approval"))
        .node(FlowNode::gate("approval").to("finish"))
        .node(FlowNode::state("finish").to("end"))
        .node(FlowNode::end("end"))
        .build()
        .unwrap_or_else(|e| panic!("gate flow is valid: {e}"))
}

/// `collect` joins contexts of a batch under `fan_in` before `end`.
#[must_use]
pub fn fan_in_flow(fan_in: FanIn) -> FlowDefinition {
    FlowDefinition::builder("join", "1")
        .node(FlowNode::state("intake").to("collect"))
        .node(FlowNode::state("collect").with_fan_in(fan_in).to("end"))
        .node(FlowNode::end("end"))
        .build()
        .unwrap_or_else(|e| panic!("fan-in flow is valid: {e}"))
}

/// `split` forks into `left` and `right`, which `join` waits for.
#[must_use]
pub fn parallel_flow() -> FlowDefinition {
    FlowDefinition::builder("fork", "1")
        .node(FlowNode::parallel("split").to("left").to("right"))
        .node(FlowNode::state("left").to("join"))
        .node(FlowNode::state("right").to("join"))
        .node(FlowNode::state("join").with_fan_in(FanIn::exact(2)).to("end"))
        .node(FlowNode::end("end"))
        .build()
        .unwrap_or_else(|e| panic!("parallel flow is valid: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenarios_build() {
        assert_eq!(linear_flow().stream_id(), "linear:1");
        assert_eq!(branch_flow().node_count(), 6);
        assert_eq!(gate_flow().start_node().id, "prepare");
        assert!(fan_in_flow(FanIn::at_least(2)).lookup_node("collect").unwrap().fan_in.is_some());
        assert_eq!(parallel_flow().lookup_node("split").unwrap().events.len(), 2);
    }
}
