//! The immutable graph model.
//!
//! A [`FlowDefinition`] is produced once by an external parser (through
//! [`FlowDefinitionBuilder`]) and is read-only afterwards. Contexts refer to
//! nodes by id only.

mod definition;
mod guard;
mod node;

pub use definition::{FlowDefinition, FlowDefinitionBuilder};
pub use guard::{CompareOp, Guard};
pub use node::{FanIn, FanInMode, FlowEvent, FlowNode, NodeKind};
