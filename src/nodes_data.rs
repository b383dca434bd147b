//! Per-node test data.
//!
//! Nodes data is a JSON object keyed by stringified node id. It carries
//! whatever a test needs to know about each node, including the
//! `node_config` overlay pushed during pre-run.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use serde_json::{Value, json};
use thiserror::Error;

use crate::compose::{NODE_CONFIG_KEY, merge_into};
use crate::device::NodeId;
use crate::error::StepError;
use crate::test_args::TestArgs;

/// Errors raised while loading nodes data.
#[derive(Debug, Error)]
pub enum NodesDataError {
    /// The file could not be read.
    #[error("failed to read nodes data {path}: {message}")]
    Read {
        /// File that was read.
        path: Utf8PathBuf,
        /// Operating system error text.
        message: String,
    },
    /// The file is not a JSON object.
    #[error("failed to parse nodes data {path}: {message}")]
    Parse {
        /// File that was parsed.
        path: Utf8PathBuf,
        /// Parser message.
        message: String,
    },
    /// A top-level key is not a node id.
    #[error("invalid node id '{key}' in nodes data")]
    InvalidNodeId {
        /// Offending key.
        key: String,
    },
    /// Required dotted paths are absent.
    #[error("Required fields are missing from node data: {}", quoted(.fields))]
    MissingFields {
        /// Missing dotted paths.
        fields: Vec<String>,
    },
}

fn quoted(fields: &[String]) -> String {
    fields
        .iter()
        .map(|field| format!("'{field}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<NodesDataError> for StepError {
    fn from(value: NodesDataError) -> Self {
        Self::DeviceConfig(value.to_string())
    }
}

/// Nodes data keyed by node id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodesData {
    nodes: BTreeMap<NodeId, Value>,
}

impl NodesData {
    /// Builds nodes data from a JSON object with stringified node ids.
    ///
    /// # Errors
    ///
    /// Returns [`NodesDataError::InvalidNodeId`] for keys that are not
    /// unsigned integers.
    pub fn from_value(value: Value) -> Result<Self, NodesDataError> {
        let Value::Object(map) = value else {
            return Ok(Self::default());
        };
        let mut nodes = BTreeMap::new();
        for (key, entry) in map {
            let node_id = key
                .trim()
                .parse::<NodeId>()
                .map_err(|_| NodesDataError::InvalidNodeId { key: key.clone() })?;
            nodes.insert(node_id, entry);
        }
        Ok(Self { nodes })
    }

    /// Entry of one node.
    #[must_use]
    pub fn node(&self, node_id: NodeId) -> Option<&Value> {
        self.nodes.get(&node_id)
    }

    /// Node ids with an entry.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    /// Whether no node has an entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Deep-merges `amendment` on top, node by node.
    #[must_use]
    pub fn merged(mut self, amendment: Self) -> Self {
        for (node_id, overlay) in amendment.nodes {
            match self.nodes.get_mut(&node_id) {
                Some(existing) => merge_into(existing, overlay),
                None => {
                    self.nodes.insert(node_id, overlay);
                }
            }
        }
        self
    }

    /// Applies the common test-arg amendments to `radio_nodes`.
    ///
    /// `disable_gps` turns GPS off; `enable_fw_logs` turns firmware logging on.
    #[must_use]
    pub fn with_test_arg_amendments(self, args: &TestArgs, radio_nodes: &[NodeId]) -> Self {
        let mut overlay = Value::Object(serde_json::Map::new());
        if args.flag("disable_gps") {
            merge_into(
                &mut overlay,
                json!({NODE_CONFIG_KEY: {
                    "envParams": {"GPSD_ENABLED": "0"},
                    "radioParamsBase": {"fwParams": {"forceGpsDisable": 1}},
                }}),
            );
        }
        if args.flag("enable_fw_logs") {
            merge_into(
                &mut overlay,
                json!({NODE_CONFIG_KEY: {"envParams": {"FW_LOGGING_ENABLED": "1"}}}),
            );
        }
        if overlay.as_object().is_some_and(serde_json::Map::is_empty) {
            return self;
        }
        let amendment = Self {
            nodes: radio_nodes
                .iter()
                .map(|node_id| (*node_id, overlay.clone()))
                .collect(),
        };
        self.merged(amendment)
    }

    /// Checks that every node carries each dotted path in `required`.
    ///
    /// # Errors
    ///
    /// Returns [`NodesDataError::MissingFields`] listing the absent paths.
    pub fn require(&self, required: &[&str]) -> Result<(), NodesDataError> {
        let mut missing: Vec<String> = required
            .iter()
            .filter(|path| {
                self.nodes.is_empty() || self.nodes.values().any(|entry| lookup(entry, path).is_none())
            })
            .map(|path| (*path).to_owned())
            .collect();
        missing.dedup();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(NodesDataError::MissingFields { fields: missing })
        }
    }
}

fn lookup<'a>(value: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted
        .split('.')
        .try_fold(value, |current, key| current.get(key))
}

/// Resolves `path` against `dir` when it is relative and a directory is
/// given.
#[must_use]
pub fn resolve_path(path: &Utf8Path, dir: Option<&Utf8Path>) -> Utf8PathBuf {
    match dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_owned(),
    }
}

/// Reads nodes data from `path` and checks the `required` dotted paths.
///
/// # Errors
///
/// Returns [`NodesDataError`] when the file cannot be read or parsed, or
/// when a required field is missing.
pub fn read_nodes_data(path: &Utf8Path, required: &[&str]) -> Result<NodesData, NodesDataError> {
    let read_error = |message: String| NodesDataError::Read {
        path: path.to_owned(),
        message,
    };
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| read_error(String::from("not a file path")))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| read_error(err.to_string()))?;
    let text = dir
        .read_to_string(file_name)
        .map_err(|err| read_error(err.to_string()))?;
    let value: Value = serde_json::from_str(&text).map_err(|err| NodesDataError::Parse {
        path: path.to_owned(),
        message: err.to_string(),
    })?;
    if !value.is_object() {
        return Err(NodesDataError::Parse {
            path: path.to_owned(),
            message: String::from("expected a JSON object keyed by node id"),
        });
    }
    let data = NodesData::from_value(value)?;
    data.require(required)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::test_args::common_params;

    fn write(dir: &tempfile::TempDir, name: &str, contents: &str) -> Utf8PathBuf {
        let path = Utf8PathBuf::from_path_buf(dir.path().join(name)).expect("utf8 path");
        std::fs::write(&path, contents).expect("write nodes data");
        path
    }

    #[test]
    fn keys_become_node_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(&dir, "nd.json", r#"{"1": {"mac": "aa"}, "2": {"mac": "bb"}}"#);
        let data = read_nodes_data(&path, &["mac"]).expect("nodes data");
        assert_eq!(data.node_ids(), vec![1, 2]);
        assert_eq!(data.node(2).and_then(|n| n.get("mac")), Some(&json!("bb")));
    }

    #[test]
    fn missing_required_fields_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(&dir, "nd.json", r#"{"1": {"a": {"c": 1}}}"#);
        let err = read_nodes_data(&path, &["a.b", "a.c"]).expect_err("missing");
        assert_eq!(
            err.to_string(),
            "Required fields are missing from node data: 'a.b'"
        );
        assert_eq!(
            StepError::from(err).kind(),
            crate::error::StepErrorKind::DeviceConfig
        );
    }

    #[rstest]
    #[case(r#"{"one": {}}"#)]
    #[case("[1, 2]")]
    #[case("not json")]
    fn malformed_files_are_rejected(#[case] contents: &str) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write(&dir, "nd.json", contents);
        assert!(read_nodes_data(&path, &[]).is_err());
    }

    #[test]
    fn relative_paths_resolve_against_the_data_dir() {
        let dir = Utf8Path::new("/srv/nodes");
        assert_eq!(
            resolve_path(Utf8Path::new("lab.json"), Some(dir)),
            Utf8PathBuf::from("/srv/nodes/lab.json")
        );
        assert_eq!(
            resolve_path(Utf8Path::new("/tmp/x.json"), Some(dir)),
            Utf8PathBuf::from("/tmp/x.json")
        );
    }

    #[test]
    fn test_arg_amendments_touch_only_radio_nodes() {
        let data = NodesData::from_value(json!({"1": {"node_config": {"envParams": {"A": "1"}}}}))
            .expect("data");
        let args = TestArgs::parse(
            &common_params(),
            &[String::from("disable_gps=true"), String::from("enable_fw_logs=1")],
            None,
        )
        .expect("args");

        let amended = data.with_test_arg_amendments(&args, &[1]);
        let env = amended
            .node(1)
            .and_then(|n| n.pointer("/node_config/envParams"))
            .expect("env params");
        assert_eq!(env, &json!({"A": "1", "GPSD_ENABLED": "0", "FW_LOGGING_ENABLED": "1"}));
        assert!(amended.node(2).is_none());
    }

    #[test]
    fn merging_adds_and_overrides_nodes() {
        let base = NodesData::from_value(json!({"1": {"a": 1, "b": 1}})).expect("base");
        let amend = NodesData::from_value(json!({"1": {"b": 2}, "3": {"c": 1}})).expect("amend");
        let merged = base.merged(amend);
        assert_eq!(merged.node(1), Some(&json!({"a": 1, "b": 2})));
        assert_eq!(merged.node_ids(), vec![1, 3]);
    }
}
