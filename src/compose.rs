//! Layered node configuration.
//!
//! Node configuration documents are composed from layers with a deep merge:
//! objects merge key by key, everything else (arrays included) is replaced
//! by the overlay. The composed document is pushed to every radio node
//! during pre-run.

use serde_json::Value;
use tracing::info;

use crate::context::RunContext;
use crate::device::{DeviceType, NodeId};
use crate::error::StepError;

/// Where radio nodes read their configuration from.
pub const NODE_CONFIG_FILE: &str = "/data/cfg/node_config.json";

/// Key inside a node's nodes-data entry holding its config overlay.
pub const NODE_CONFIG_KEY: &str = "node_config";

/// Merges `overlay` into `base` in place.
pub fn merge_into(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (slot, replacement) => *slot = replacement,
    }
}

/// Returns `base` with `overlay` deep-merged on top.
#[must_use]
pub fn deep_merge(mut base: Value, overlay: Value) -> Value {
    merge_into(&mut base, overlay);
    base
}

/// Folds `layers` left to right, starting from an empty object.
pub fn compose(layers: impl IntoIterator<Item = Value>) -> Value {
    layers
        .into_iter()
        .fold(Value::Object(serde_json::Map::new()), deep_merge)
}

/// Composes and pushes the node configuration of every radio node that has
/// a `node_config` entry in the nodes data. Other nodes are left untouched.
///
/// Returns the node ids that received a document.
///
/// # Errors
///
/// Returns [`StepError::DeviceCmd`] naming the nodes whose push failed.
pub async fn push_node_configs(
    ctx: &RunContext,
    base: Option<&Value>,
) -> Result<Vec<NodeId>, StepError> {
    let mut pushed = Vec::new();
    let mut failed = Vec::new();
    for device in ctx.registry().of_type(DeviceType::RadioNode) {
        let Some(overlay) = ctx
            .nodes_data()
            .node(device.node_id)
            .and_then(|entry| entry.get(NODE_CONFIG_KEY))
        else {
            continue;
        };
        let document = compose(base.cloned().into_iter().chain([overlay.clone()]));
        ctx.log(&format!(
            "Pushing node config to node {} ({NODE_CONFIG_FILE})",
            device.node_id
        ));
        match crate::transfer::push_json(ctx, device.node_id, &document, NODE_CONFIG_FILE).await {
            Ok(()) => pushed.push(device.node_id),
            Err(err) => {
                ctx.log(&format!("Node {}: {err}", device.node_id));
                failed.push(device.node_id);
            }
        }
    }
    if !failed.is_empty() {
        return Err(StepError::device_cmd(format!(
            "Failed to push node config to nodes {failed:?}"
        )));
    }
    info!(nodes = ?pushed, "node configs pushed");
    Ok(pushed)
}
