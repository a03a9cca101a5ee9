//! The payload contract for flow contexts.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;

/// Business data carried by a flow context.
///
/// Payloads must be serializable so that stores can persist them and guards
/// can inspect their JSON view. `merge` is applied when a parked context is
/// resumed with an external payload.
pub trait FlowData: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Merges `patch` into `self`.
    fn merge(&mut self, patch: Self);
}

impl FlowData for serde_json::Value {
    fn merge(&mut self, patch: Self) {
        merge_value(self, patch);
    }
}

impl FlowData for HashMap<String, serde_json::Value> {
    fn merge(&mut self, patch: Self) {
        for (key, value) in patch {
            match self.get_mut(&key) {
                Some(existing) => merge_value(existing, value),
                None => {
                    self.insert(key, value);
                }
            }
        }
    }
}

/// Deep-merges objects; any other shape is replaced.
fn merge_value(target: &mut serde_json::Value, patch: serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}
