//! Command-line interface definitions for the `ctf` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, ValueEnum};

/// Top-level CLI for the `ctf` binary.
#[derive(Debug, Parser)]
#[command(
    name = "ctf",
    about = "Run connected tests against a reserved test setup",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Reserve a setup and run one test or a suite of tests on it.
    #[command(name = "run", about = "Run a test or a suite of tests")]
    Run(RunCommand),
    /// List the tests built into the binary.
    #[command(name = "list-tests", about = "List all possible tests")]
    ListTests,
    /// List the team's test setups.
    #[command(name = "list-setups", about = "List all of the team's test setups")]
    ListSetups(ListSetupsCommand),
    /// Show a test's parameters.
    #[command(name = "describe", about = "Show test details")]
    Describe(DescribeCommand),
    /// Free a setup left busy by a dead run.
    #[command(name = "force-free", about = "Forcefully free a test setup")]
    ForceFree(ForceFreeCommand),
}

/// Wrapper phases that can be skipped.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum SkipPhase {
    /// Config push and the test's pre-run steps.
    #[value(name = "pre_run")]
    PreRun,
    /// The test's post-run steps.
    #[value(name = "post_run")]
    PostRun,
}

/// Arguments for the `ctf run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Test names; several names run as a suite.
    #[arg(required = true, value_name = "TEST")]
    pub(crate) tests: Vec<String>,
    /// Test setup ID in the result server (see `list-setups`).
    #[arg(long, value_name = "ID")]
    pub(crate) test_setup_id: Option<u64>,
    /// Team owning the setup.
    #[arg(long, value_name = "ID", env = "CTF_TEAM_ID", default_value_t = 1)]
    pub(crate) team_id: u64,
    /// Budget of each step, in seconds.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) timeout: Option<u64>,
    /// Budget of the log collection step, in seconds.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) log_collect_timeout: Option<u64>,
    /// Budget of a batch of file copies, in seconds.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) scp_timeout: Option<u64>,
    /// Maximum simultaneous device operations.
    #[arg(long, value_name = "N")]
    pub(crate) max_workers: Option<usize>,
    /// Skip the remaining tests of a suite after the first failure.
    #[arg(long)]
    pub(crate) abort_suite_on_failure: bool,
    /// Wrapper phases to skip.
    #[arg(long, value_enum, num_args = 1..)]
    pub(crate) skip: Vec<SkipPhase>,
    /// JSON file with per-node data for the setup.
    #[arg(long, value_name = "PATH")]
    pub(crate) nodes_data: Option<String>,
    /// Directory relative `--nodes-data` paths are resolved against.
    #[arg(long, value_name = "DIR")]
    pub(crate) nodes_data_dir: Option<String>,
    /// Test-specific arguments.
    #[arg(long, value_name = "KEY=VAL", num_args = 1..)]
    pub(crate) test_args: Vec<String>,
    /// JSON object of test arguments, applied over `--test-args`.
    #[arg(long, value_name = "JSON")]
    pub(crate) json_args: Option<String>,
    /// Log at debug verbosity.
    #[arg(long)]
    pub(crate) debug: bool,
    /// Keep collected logs in this directory.
    #[arg(
        long,
        value_name = "DIR",
        num_args = 0..=1,
        default_missing_value = "/tmp/ctf_logs/"
    )]
    pub(crate) store_logs_locally: Option<String>,
}

/// Arguments for the `ctf list-setups` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ListSetupsCommand {
    /// Team whose setups are listed.
    #[arg(long, value_name = "ID", env = "CTF_TEAM_ID", default_value_t = 1)]
    pub(crate) team_id: u64,
}

/// Arguments for the `ctf describe` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct DescribeCommand {
    /// Test name.
    #[arg(value_name = "TEST")]
    pub(crate) test: String,
}

/// Arguments for the `ctf force-free` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ForceFreeCommand {
    /// Test setup ID in the result server.
    #[arg(value_name = "SETUP_ID")]
    pub(crate) test_setup_id: u64,
    /// Team owning the setup.
    #[arg(long, value_name = "ID", env = "CTF_TEAM_ID", default_value_t = 1)]
    pub(crate) team_id: u64,
}
