//! Compiles a flow definition into a runnable pipeline.

use super::{CompletionHandler, ErrorHandler, FlowPipeline, FlowServices};
use crate::core::{FlowContext, FlowData};
use crate::errors::{DefinitionError, DefinitionErrorInfo, FlowError};
use crate::graph::{FlowDefinition, NodeKind};
use crate::jober::{EchoJober, Jober, JoberSlot};
use std::collections::HashMap;
use std::sync::Arc;

/// Builder binding executors and handlers to a definition.
pub struct PipelineBuilder<T: FlowData> {
    definition: FlowDefinition,
    services: FlowServices<T>,
    bindings: Vec<(String, Arc<dyn Jober<T>>)>,
    registered: Vec<Arc<dyn Jober<T>>>,
    completion: Vec<CompletionHandler<T>>,
    error_handlers: Vec<ErrorHandler<T>>,
}

impl<T: FlowData> PipelineBuilder<T> {
    /// Creates a new builder.
    #[must_use]
    pub fn new(definition: FlowDefinition, services: FlowServices<T>) -> Self {
        Self {
            definition,
            services,
            bindings: Vec::new(),
            registered: Vec::new(),
            completion: Vec::new(),
            error_handlers: Vec::new(),
        }
    }

    /// Binds a jober to a state node by node id.
    #[must_use]
    pub fn bind(mut self, node: impl Into<String>, jober: Arc<dyn Jober<T>>) -> Self {
        self.bindings.push((node.into(), jober));
        self
    }

    /// Offers a jober to every state node that declares its name.
    #[must_use]
    pub fn register(mut self, jober: Arc<dyn Jober<T>>) -> Self {
        self.registered.push(jober);
        self
    }

    /// Adds a completion handler.
    #[must_use]
    pub fn on_complete<F>(mut self, handler: F) -> Self
    where
        F: Fn(&[FlowContext<T>]) + Send + Sync + 'static,
    {
        self.completion.push(Arc::new(handler));
        self
    }

    /// Adds an error handler.
    #[must_use]
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&[FlowContext<T>], &FlowError) + Send + Sync + 'static,
    {
        self.error_handlers.push(Arc::new(handler));
        self
    }

    /// Validates the bindings and builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns a [`DefinitionError`] if a jober is bound to an unknown or
    /// non-state node, bound twice, or declared by a node but never supplied.
    pub fn build(self) -> Result<FlowPipeline<T>, DefinitionError> {
        let mut explicit: HashMap<String, Arc<dyn Jober<T>>> = HashMap::new();
        for (node_id, jober) in self.bindings {
            let Some(node) = self.definition.lookup_node(&node_id) else {
                return Err(binding_error(
                    &node_id,
                    "FLOW-DEF-JOBER_UNKNOWN_NODE",
                    format!("Jober '{}' bound to unknown node '{node_id}'", jober.name()),
                ));
            };
            if node.kind != NodeKind::State {
                return Err(binding_error(
                    &node_id,
                    "FLOW-DEF-JOBER_NOT_STATE",
                    format!("Jober '{}' bound to {} node '{node_id}'", jober.name(), node.kind),
                ));
            }
            if explicit.insert(node_id.clone(), jober).is_some() {
                return Err(binding_error(
                    &node_id,
                    "FLOW-DEF-JOBER_DUPLICATE",
                    format!("Node '{node_id}' has more than one jober bound"),
                ));
            }
        }

        let mut slots = HashMap::new();
        for node in self.definition.nodes().filter(|n| n.kind == NodeKind::State) {
            let jober: Arc<dyn Jober<T>> = match (explicit.remove(&node.id), &node.jober) {
                (Some(jober), _) => jober,
                (None, Some(wanted)) => self
                    .registered
                    .iter()
                    .find(|j| j.name() == wanted)
                    .cloned()
                    .ok_or_else(|| {
                        binding_error(
                            &node.id,
                            "FLOW-DEF-JOBER_MISSING",
                            format!(
                                "Node '{}' declares jober '{wanted}' but none was registered",
                                node.id
                            ),
                        )
                    })?,
                (None, None) => Arc::new(EchoJober::new()),
            };
            slots.insert(node.id.clone(), JoberSlot::new(jober));
        }

        Ok(FlowPipeline::new(
            Arc::new(self.definition),
            slots,
            self.completion,
            self.error_handlers,
            self.services,
        ))
    }
}

fn binding_error(node: &str, code: &str, message: String) -> DefinitionError {
    DefinitionError::new(message.clone())
        .with_nodes(vec![node.to_string()])
        .with_error_info(
            DefinitionErrorInfo::new(code, message)
                .with_fix_hint("Bind jobers only to declared state nodes, once each."),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FlowNode, Guard};
    use serde_json::Value;

    fn definition() -> FlowDefinition {
        FlowDefinition::builder("bind", "1")
            .node(FlowNode::state("fetch").with_jober("fetcher").to("check"))
            .node(
                FlowNode::condition("check")
                    .when(Guard::exists("ok"), "store")
                    .otherwise("end"),
            )
            .node(FlowNode::state("store").to("end"))
            .node(FlowNode::end("end"))
            .build()
            .unwrap()
    }

    fn builder() -> PipelineBuilder<Value> {
        PipelineBuilder::new(definition(), FlowServices::in_memory())
    }

    #[test]
    fn test_registered_jober_matches_declared_name() {
        let pipeline = builder()
            .register(Arc::new(EchoJober::named("fetcher")))
            .build()
            .unwrap();
        assert_eq!(pipeline.jober("fetch").unwrap().name(), "fetcher");
        assert_eq!(pipeline.jober("store").unwrap().name(), "echo");
        assert!(pipeline.jober("check").is_none());
    }

    #[test]
    fn test_explicit_binding_wins() {
        let pipeline = builder()
            .register(Arc::new(EchoJober::named("fetcher")))
            .bind("fetch", Arc::new(EchoJober::named("override")))
            .build()
            .unwrap();
        assert_eq!(pipeline.jober("fetch").unwrap().name(), "override");
    }

    #[test]
    fn test_missing_declared_jober() {
        let err = builder().build().unwrap_err();
        assert_eq!(err.code(), Some("FLOW-DEF-JOBER_MISSING"));
        assert_eq!(err.nodes, vec!["fetch".to_string()]);
    }

    #[test]
    fn test_binding_defects() {
        let err = builder()
            .bind("ghost", Arc::new(EchoJober::new()))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("FLOW-DEF-JOBER_UNKNOWN_NODE"));

        let err = builder()
            .bind("check", Arc::new(EchoJober::new()))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("FLOW-DEF-JOBER_NOT_STATE"));

        let err = builder()
            .bind("store", Arc::new(EchoJober::new()))
            .bind("store", Arc::new(EchoJober::new()))
            .build()
            .unwrap_err();
        assert_eq!(err.code(), Some("FLOW-DEF-JOBER_DUPLICATE"));
    }
}
