//! Core runtime types: context status, the flow context token, and the
//! payload contract.

mod context;
mod data;
mod status;

pub use context::{BatchKey, FlowContext};
pub use data::FlowData;
pub use status::FlowStatus;
