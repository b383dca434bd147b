//! Test definitions and the built-in catalog.
//!
//! A test is a value: its parameters plus three producers invoked in order
//! (`test args -> nodes data amendment -> step list`). Variants of a test
//! are just differently configured definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::device::DeviceType;
use crate::error::StepError;
use crate::fanout::{CommandSpec, require_all_success, wait_for_cmds};
use crate::nodes_data::NodesData;
use crate::step::Step;
use crate::test_args::{ParamKind, TestArgs, TestArgsError, TestParam, common_params};

/// Produces steps from the resolved arguments and nodes data.
pub type StepsProducer = Arc<dyn Fn(&TestArgs, &NodesData) -> Vec<Step> + Send + Sync>;

/// Produces the nodes-data amendment of a test.
pub type AmendProducer = Arc<dyn Fn(&TestArgs) -> NodesData + Send + Sync>;

/// Errors raised while looking tests up.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum CatalogError {
    /// No test is registered under the name.
    #[error("Unknown test '{name}'")]
    UnknownTest {
        /// Requested name.
        name: String,
    },
}

impl From<CatalogError> for StepError {
    fn from(value: CatalogError) -> Self {
        Self::TestUsage(value.to_string())
    }
}

/// One runnable test.
#[derive(Clone)]
pub struct TestDefinition {
    /// Name used on the command line.
    pub name: String,
    /// One-line description.
    pub description: String,
    /// Parameters beyond the common ones.
    pub params: Vec<TestParam>,
    /// Dotted paths every node's data must carry.
    pub required_node_fields: Vec<String>,
    /// Remote log files to collect after the run, by device type.
    pub logfiles: BTreeMap<DeviceType, Vec<String>>,
    /// Base layer of the node configuration pushed during pre-run.
    pub base_node_config: Option<Value>,
    steps: StepsProducer,
    amend: AmendProducer,
    pre_run: StepsProducer,
    post_run: StepsProducer,
}

impl fmt::Debug for TestDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("params", &self.params)
            .field("logfiles", &self.logfiles)
            .finish_non_exhaustive()
    }
}

fn no_steps() -> StepsProducer {
    Arc::new(|_, _| Vec::new())
}

impl TestDefinition {
    /// Defines a test whose steps come from `steps`.
    pub fn new<F>(name: &str, description: &str, steps: F) -> Self
    where
        F: Fn(&TestArgs, &NodesData) -> Vec<Step> + Send + Sync + 'static,
    {
        Self {
            name: name.to_owned(),
            description: description.to_owned(),
            params: Vec::new(),
            required_node_fields: Vec::new(),
            logfiles: BTreeMap::new(),
            base_node_config: None,
            steps: Arc::new(steps),
            amend: Arc::new(|_| NodesData::default()),
            pre_run: no_steps(),
            post_run: no_steps(),
        }
    }

    /// Declares a parameter.
    #[must_use]
    pub fn param(mut self, param: TestParam) -> Self {
        self.params.push(param);
        self
    }

    /// Requires `fields` in every node's data.
    #[must_use]
    pub fn require_node_fields(mut self, fields: &[&str]) -> Self {
        self.required_node_fields
            .extend(fields.iter().map(|field| (*field).to_owned()));
        self
    }

    /// Collects `paths` from devices of `device_type` after the run.
    #[must_use]
    pub fn logfiles(mut self, device_type: DeviceType, paths: &[&str]) -> Self {
        self.logfiles
            .entry(device_type)
            .or_default()
            .extend(paths.iter().map(|path| (*path).to_owned()));
        self
    }

    /// Sets the base node configuration layer.
    #[must_use]
    pub fn base_node_config(mut self, config: Value) -> Self {
        self.base_node_config = Some(config);
        self
    }

    /// Sets the nodes-data amendment producer.
    #[must_use]
    pub fn amend_nodes_data<F>(mut self, amend: F) -> Self
    where
        F: Fn(&TestArgs) -> NodesData + Send + Sync + 'static,
    {
        self.amend = Arc::new(amend);
        self
    }

    /// Sets the test's own pre-run steps.
    #[must_use]
    pub fn pre_run<F>(mut self, steps: F) -> Self
    where
        F: Fn(&TestArgs, &NodesData) -> Vec<Step> + Send + Sync + 'static,
    {
        self.pre_run = Arc::new(steps);
        self
    }

    /// Sets the test's own post-run steps.
    #[must_use]
    pub fn post_run<F>(mut self, steps: F) -> Self
    where
        F: Fn(&TestArgs, &NodesData) -> Vec<Step> + Send + Sync + 'static,
    {
        self.post_run = Arc::new(steps);
        self
    }

    /// Common parameters followed by the test's own.
    #[must_use]
    pub fn all_params(&self) -> Vec<TestParam> {
        let mut params = common_params();
        params.extend(self.params.iter().cloned());
        params
    }

    /// Parses operator-supplied arguments against [`TestDefinition::all_params`].
    ///
    /// # Errors
    ///
    /// Returns [`TestArgsError`] for unknown, missing or invalid arguments.
    pub fn parse_args(
        &self,
        pairs: &[String],
        json_args: Option<&str>,
    ) -> Result<TestArgs, TestArgsError> {
        TestArgs::parse(&self.all_params(), pairs, json_args)
    }

    /// The test's nodes-data amendment.
    #[must_use]
    pub fn nodes_data_amend(&self, args: &TestArgs) -> NodesData {
        (self.amend)(args)
    }

    /// The test's steps.
    #[must_use]
    pub fn steps(&self, args: &TestArgs, nodes_data: &NodesData) -> Vec<Step> {
        (self.steps)(args, nodes_data)
    }

    /// The test's own pre-run steps.
    #[must_use]
    pub fn pre_run_steps(&self, args: &TestArgs, nodes_data: &NodesData) -> Vec<Step> {
        (self.pre_run)(args, nodes_data)
    }

    /// The test's own post-run steps.
    #[must_use]
    pub fn post_run_steps(&self, args: &TestArgs, nodes_data: &NodesData) -> Vec<Step> {
        (self.post_run)(args, nodes_data)
    }
}

/// Tests known to the binary, keyed by name.
#[derive(Clone, Debug, Default)]
pub struct TestCatalog {
    tests: BTreeMap<String, TestDefinition>,
}

impl TestCatalog {
    /// An empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The catalog shipped with the binary.
    #[must_use]
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(hello());
        catalog.register(connectivity());
        catalog
    }

    /// Adds or replaces a definition.
    pub fn register(&mut self, test: TestDefinition) {
        self.tests.insert(test.name.clone(), test);
    }

    /// Looks a test up.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::UnknownTest`] for unregistered names.
    pub fn get(&self, name: &str) -> Result<&TestDefinition, CatalogError> {
        self.tests.get(name).ok_or_else(|| CatalogError::UnknownTest {
            name: name.to_owned(),
        })
    }

    /// Every definition, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = &TestDefinition> {
        self.tests.values()
    }
}

fn hello() -> TestDefinition {
    TestDefinition::new("hello", "Fetch the date from node 1", |_, _| {
        vec![
            Step::fanout("Get date from node 1", CommandSpec::from("date"), Some(vec![1]))
                .success_message("Node 1 answered"),
        ]
    })
}

fn connectivity() -> TestDefinition {
    TestDefinition::new(
        "connectivity",
        "Run a command on every node and require success",
        |args, _| {
            let command = args.get_str("command").unwrap_or("uname -a").to_owned();
            vec![Step::new(format!("Run '{command}' on every node"), move |ctx| {
                let spec = CommandSpec::Broadcast(command.clone());
                async move {
                    let nodes = ctx.registry().node_ids();
                    if nodes.is_empty() {
                        return Err(StepError::usage("The test setup has no devices"));
                    }
                    let results = wait_for_cmds(ctx.fanout().run(&spec, Some(&nodes), None)?).await?;
                    require_all_success(&results)
                }
            })]
        },
    )
    .param(TestParam::optional(
        "command",
        "Command run on every node",
        ParamKind::Str,
        Value::String(String::from("uname -a")),
    ))
    .logfiles(DeviceType::RadioNode, &["/var/log/messages"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tests_are_listed_by_name() {
        let catalog = TestCatalog::builtin();
        let names: Vec<&str> = catalog.iter().map(|test| test.name.as_str()).collect();
        assert_eq!(names, vec!["connectivity", "hello"]);
    }

    #[test]
    fn unknown_tests_are_usage_errors() {
        let err = TestCatalog::builtin().get("warp").expect_err("unknown");
        assert_eq!(err.to_string(), "Unknown test 'warp'");
        assert_eq!(StepError::from(err).kind(), crate::error::StepErrorKind::TestUsage);
    }

    #[test]
    fn connectivity_uses_the_command_argument() {
        let catalog = TestCatalog::builtin();
        let test = catalog.get("connectivity").expect("registered");
        let args = test
            .parse_args(&[String::from("command=hostname")], None)
            .expect("args");
        let steps = test.steps(&args, &NodesData::default());
        assert_eq!(
            steps.iter().map(|step| step.name.as_str()).collect::<Vec<_>>(),
            vec!["Run 'hostname' on every node"]
        );
        assert_eq!(
            test.logfiles.get(&DeviceType::RadioNode),
            Some(&vec![String::from("/var/log/messages")])
        );
    }

    #[test]
    fn params_include_the_common_ones() {
        let catalog = TestCatalog::builtin();
        let test = catalog.get("hello").expect("registered");
        let names: Vec<String> = test.all_params().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["enable_fw_logs", "disable_gps"]);
    }
}
