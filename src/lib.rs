//! Core library for the `ctf` connected test runner.
//!
//! A run reserves a test setup on the result server, opens connections to
//! its devices, drives the test's steps against them (sequentially or in
//! concurrent groups), and publishes every step result as it completes.
//! Teardown releases the devices and the reservation on every exit path,
//! signals included.

pub mod catalog;
pub mod compose;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod executor;
pub mod fanout;
pub mod logging;
pub mod nodes_data;
pub mod process;
pub mod registry;
pub mod reservation;
pub mod retry;
pub mod runner;
pub mod sink;
pub mod step;
pub mod teardown;
pub mod test_args;
pub mod test_support;
pub mod transfer;

pub use catalog::{CatalogError, TestCatalog, TestDefinition};
pub use config::{ConfigError, CredentialsFile, RunConfig, run_index_from_env};
pub use context::{RunContext, RunSettings};
pub use device::{ConnectionFactory, DeviceType, NodeId, PortPool, TransportFactory};
pub use error::{StepError, StepErrorKind};
pub use nodes_data::{NodesData, NodesDataError, read_nodes_data, resolve_path};
pub use process::ProcessCommandRunner;
pub use registry::DeviceRegistry;
pub use reservation::{ReservationError, ReservationManager};
pub use runner::session::{
    Collaborators, RunError, RunRequest, Session, SessionReport, SkipPhases, WorkerLink,
};
pub use runner::{RunState, RunSummary, StepPlan, TestRunner};
pub use sink::{ResultSink, ServerClient, SetupApi, SinkError};
pub use step::{Outcome, Step, StepResult};
pub use teardown::{SignalListener, TermSignal, Teardown};
