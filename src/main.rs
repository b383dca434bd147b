//! Binary entry point for the `ctf` CLI.

mod cli;

use std::env;
use std::fmt::Display;
use std::io::{self, Write};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use shell_escape::unix::escape;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use ctf::sink::SetupSummary;
use ctf::test_args::TestParam;
use ctf::{
    CatalogError, Collaborators, ConfigError, CredentialsFile, NodesData, NodesDataError, PortPool,
    ProcessCommandRunner, ReservationError, ReservationManager, RunConfig, RunError, RunRequest,
    Session, SessionReport, SetupApi, SignalListener, SinkError, SkipPhases, Teardown,
    TermSignal, TestCatalog, TestDefinition, TransportFactory, read_nodes_data, resolve_path,
    run_index_from_env,
};

use cli::{Cli, DescribeCommand, ForceFreeCommand, ListSetupsCommand, RunCommand, SkipPhase};

const EXIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_SETUP: i32 = 3;

/// How long the signal handler waits for the interrupted run to write its
/// results before exiting on its own.
const SIGNAL_EXIT_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    NodesData(#[from] NodesDataError),
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("result server error: {0}")]
    Server(#[from] SinkError),
    #[error(transparent)]
    Reservation(#[from] ReservationError),
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),
}

impl CliError {
    const fn exit_code(&self) -> i32 {
        match self {
            Self::Catalog(_) | Self::Config(_) | Self::NodesData(_) | Self::Usage(_) => EXIT_USAGE,
            Self::Run(err) => err.exit_code(),
            Self::Server(_) | Self::Reservation(_) | Self::Signals(_) => EXIT_SETUP,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let debug = matches!(&cli, Cli::Run(command) if command.debug);
    if let Err(err) = ctf::logging::init(debug) {
        write_error(io::stderr(), &err);
    }

    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            write_error(io::stderr(), &err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let catalog = TestCatalog::builtin();
    match cli {
        Cli::Run(command) => run_command(&catalog, &command).await,
        Cli::ListTests => {
            list_tests(&catalog, io::stdout());
            Ok(0)
        }
        Cli::Describe(command) => describe_command(&catalog, &command),
        Cli::ListSetups(command) => list_setups_command(&command).await,
        Cli::ForceFree(command) => force_free_command(&command).await,
    }
}

fn load_config() -> Result<RunConfig, CliError> {
    let config = RunConfig::load_without_cli_args()?;
    let Some(path) = CredentialsFile::default_path() else {
        return Ok(config);
    };
    Ok(config.with_credentials(CredentialsFile::read(&path)?))
}

async fn run_command(catalog: &TestCatalog, command: &RunCommand) -> Result<i32, CliError> {
    let tests = command
        .tests
        .iter()
        .map(|name| catalog.get(name))
        .collect::<Result<Vec<_>, _>>()?;

    let config = load_config()?;
    let setup_id = command
        .test_setup_id
        .or(config.client_test_setup_id)
        .ok_or_else(|| CliError::Usage(String::from("--test-setup-id is required")))?;
    let nodes_data = match command.nodes_data.as_deref() {
        Some(path) => read_nodes_data(
            &resolve_path(Utf8Path::new(path), command.nodes_data_dir.as_deref().map(Utf8Path::new)),
            &[],
        )?,
        None => NodesData::default(),
    };

    let client = Arc::new(config.server_client()?);
    let port_pool = Arc::new(PortPool::new());
    let deps = Collaborators {
        sink: Arc::clone(&client) as _,
        setup_api: client,
        factory: Arc::new(TransportFactory::new(
            config.ssh_settings(),
            Arc::new(ProcessCommandRunner),
            Arc::clone(&port_pool),
        )),
        port_pool,
    };

    let request = RunRequest {
        team_id: command.team_id,
        setup_id,
        test_args: command.test_args.clone(),
        json_args: command.json_args.clone(),
        nodes_data,
        skip: SkipPhases {
            pre_run: command.skip.contains(&SkipPhase::PreRun),
            post_run: command.skip.contains(&SkipPhase::PostRun),
        },
        settings: run_settings(&config, command),
        worker: config.worker_link(run_index_from_env()?),
        command_line: render_command_line(env::args_os().map(|arg| arg.to_string_lossy().into_owned())),
    };

    let teardown = Arc::new(Teardown::new(CancellationToken::new()));
    spawn_signal_handler(SignalListener::install().map_err(CliError::Signals)?, &teardown);

    let outcomes = run_suite(
        &tests,
        &deps,
        &teardown,
        &request,
        command.abort_suite_on_failure,
    )
    .await;
    write_suite_summary(io::stdout(), &outcomes);

    let code = outcomes.iter().map(SuiteOutcome::exit_code).max().unwrap_or(0);
    Ok(teardown.signal().map_or(code, TermSignal::exit_code))
}

fn run_settings(config: &RunConfig, command: &RunCommand) -> ctf::RunSettings {
    let mut settings = config.run_settings();
    if let Some(seconds) = command.timeout {
        settings.step_timeout = Duration::from_secs(seconds);
    }
    if let Some(seconds) = command.log_collect_timeout {
        settings.log_collect_timeout = Duration::from_secs(seconds);
    }
    if let Some(seconds) = command.scp_timeout {
        settings.scp_timeout = Duration::from_secs(seconds);
    }
    if let Some(workers) = command.max_workers {
        settings.max_workers = workers;
    }
    settings.store_logs_locally = command.store_logs_locally.as_deref().map(Utf8PathBuf::from);
    settings
}

/// Cancels the run and tears down on the first SIGINT or SIGTERM. The main
/// flow normally finishes the cancelled run and exits with the signal's code;
/// the handler exits on its own when that takes too long.
fn spawn_signal_handler(mut listener: SignalListener, teardown: &Arc<Teardown>) {
    let shared = Arc::clone(teardown);
    tokio::spawn(async move {
        let received = listener.recv().await;
        let code = shared.on_signal(received).await;
        tokio::time::sleep(SIGNAL_EXIT_GRACE).await;
        error!(signal = received.name(), "run did not stop in time, exiting");
        process::exit(code);
    });
}

/// What happened to one test of a suite.
#[derive(Debug)]
enum SuiteOutcome {
    Skipped { name: String },
    Finished { name: String, report: SessionReport },
    NotStarted { name: String, message: String, code: i32 },
}

impl SuiteOutcome {
    const fn exit_code(&self) -> i32 {
        match self {
            Self::Skipped { .. } => 0,
            Self::Finished { report, .. } => report.exit_code(),
            Self::NotStarted { code, .. } => *code,
        }
    }

    const fn failed(&self) -> bool {
        self.exit_code() != 0
    }
}

async fn run_suite(
    tests: &[&TestDefinition],
    deps: &Collaborators,
    teardown: &Teardown,
    request: &RunRequest,
    abort_on_failure: bool,
) -> Vec<SuiteOutcome> {
    let mut outcomes: Vec<SuiteOutcome> = Vec::with_capacity(tests.len());
    for test in tests {
        let name = test.name.clone();
        let suite_failed = abort_on_failure && outcomes.iter().any(SuiteOutcome::failed);
        if suite_failed || teardown.signal().is_some() {
            info!(test = %name, "skipping test");
            outcomes.push(SuiteOutcome::Skipped { name });
            continue;
        }
        let mut out = io::stdout();
        let outcome = match Session::new(test, deps, teardown)
            .execute(request.clone(), &mut out)
            .await
        {
            Ok(report) => {
                if let Some(teardown_error) = report.teardown_error.as_deref() {
                    write_error(io::stderr(), &teardown_error);
                }
                SuiteOutcome::Finished { name, report }
            }
            Err(err) => {
                write_error(io::stderr(), &err);
                SuiteOutcome::NotStarted {
                    name,
                    message: err.to_string(),
                    code: err.exit_code(),
                }
            }
        };
        outcomes.push(outcome);
    }
    outcomes
}

fn write_suite_summary(mut target: impl Write, outcomes: &[SuiteOutcome]) {
    for outcome in outcomes {
        match outcome {
            SuiteOutcome::Skipped { name } => writeln!(target, "[SKIPPED] {name}").ok(),
            SuiteOutcome::Finished { name, report } => {
                let verdict = if report.passed() { "PASS" } else { "FAIL" };
                writeln!(target, "[{verdict}] {name}: {}", report.url).ok()
            }
            SuiteOutcome::NotStarted { name, message, .. } => {
                writeln!(target, "[FAIL] {name}: {message}").ok()
            }
        };
    }
}

fn render_command_line(args: impl IntoIterator<Item = String>) -> String {
    args.into_iter()
        .map(|arg| escape(arg.into()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn list_tests(catalog: &TestCatalog, mut target: impl Write) {
    let width = catalog.iter().map(|test| test.name.len()).max().unwrap_or(0);
    for test in catalog.iter() {
        writeln!(target, "{:<width$}  {}", test.name, test.description).ok();
    }
}

fn describe_command(catalog: &TestCatalog, command: &DescribeCommand) -> Result<i32, CliError> {
    describe(catalog.get(&command.test)?, io::stdout());
    Ok(0)
}

fn describe(test: &TestDefinition, mut target: impl Write) {
    writeln!(target, "{}: {}", test.name, test.description).ok();
    writeln!(target, "Parameters:").ok();
    for param in test.all_params() {
        writeln!(target, "  {}", describe_param(&param)).ok();
    }
    if !test.required_node_fields.is_empty() {
        writeln!(target, "Required nodes data: {}", test.required_node_fields.join(", ")).ok();
    }
}

fn describe_param(param: &TestParam) -> String {
    format!(
        "{} ({}) {}: {}",
        param.name,
        param.kind,
        param.requirement_note(),
        param.desc
    )
}

async fn list_setups_command(command: &ListSetupsCommand) -> Result<i32, CliError> {
    let client = load_config()?.server_client()?;
    list_setups(&client, command.team_id, io::stdout()).await?;
    Ok(0)
}

async fn list_setups(api: &dyn SetupApi, team_id: u64, target: impl Write) -> Result<(), CliError> {
    let setups = api.list_setups(team_id).await?;
    write_setups(target, &setups);
    Ok(())
}

fn write_setups(mut target: impl Write, setups: &[SetupSummary]) {
    let name_width = setups
        .iter()
        .map(|setup| setup.name.len())
        .chain([4])
        .max()
        .unwrap_or(4);
    writeln!(target, "{:>6}  {:<name_width$}  {:<8}  DESCRIPTION", "ID", "NAME", "STATUS").ok();
    for setup in setups {
        writeln!(
            target,
            "{:>6}  {:<name_width$}  {:<8}  {}",
            setup.id, setup.name, setup.status, setup.description
        )
        .ok();
    }
}

async fn force_free_command(command: &ForceFreeCommand) -> Result<i32, CliError> {
    let client: Arc<dyn SetupApi> = Arc::new(load_config()?.server_client()?);
    let message = force_free(client, command.team_id, command.test_setup_id).await?;
    writeln!(io::stdout(), "{message}").ok();
    Ok(0)
}

async fn force_free(api: Arc<dyn SetupApi>, team_id: u64, setup_id: u64) -> Result<String, CliError> {
    let reservation = ReservationManager::new(api, team_id, setup_id);
    Ok(if reservation.force_free().await? {
        format!("Test setup {setup_id} was freed")
    } else {
        format!("Test setup {setup_id} is already free")
    })
}

fn write_error(mut target: impl Write, err: &dyn Display) {
    writeln!(target, "ctf: {err}").ok();
}
