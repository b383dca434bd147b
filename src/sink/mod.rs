//! Result server collaborators.
//!
//! The engine talks to the result server through two narrow traits:
//! [`ResultSink`] for run and step results, and [`SetupApi`] for the test
//! setup reservation endpoints. [`ServerClient`] implements both over HTTP;
//! tests substitute in-memory fakes.

mod envelope;
mod http;

use std::future::Future;
use std::pin::Pin;

use camino::Utf8PathBuf;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::step::StepResult;

pub use envelope::Envelope;
pub use http::{ServerClient, ServerEndpoints};

/// Future returned by sink operations.
pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SinkError>> + Send + 'a>>;

/// Identifier of a run on the result server.
pub type RunId = u64;

/// Identifier of a saved step (a "test action result") on the server.
pub type ActionId = u64;

/// Identifier of a team.
pub type TeamId = u64;

/// Identifier of a test setup.
pub type SetupId = u64;

/// Errors raised while talking to the result server.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Authentication was refused or could not be attempted.
    #[error("login failed: {message}")]
    Login {
        /// Reason reported by the server or the client.
        message: String,
    },
    /// The request could not be sent or the response could not be read.
    #[error("request to {endpoint} failed: {message}")]
    Http {
        /// Endpoint path that was called.
        endpoint: String,
        /// Transport error text.
        message: String,
    },
    /// The server answered with a non-zero `error` code or a bad status.
    #[error("{endpoint} returned error {code}: {message}")]
    Server {
        /// Endpoint path that was called.
        endpoint: String,
        /// Envelope error code or HTTP status.
        code: i64,
        /// Message from the server.
        message: String,
    },
    /// The response body did not have the expected shape.
    #[error("unexpected reply from {endpoint}: {message}")]
    Decode {
        /// Endpoint path that was called.
        endpoint: String,
        /// What was missing or malformed.
        message: String,
    },
    /// A log file could not be uploaded.
    #[error("failed to upload log {path}: {message}")]
    SaveLog {
        /// Local file that was being uploaded.
        path: Utf8PathBuf,
        /// Reason for the failure.
        message: String,
    },
    /// Structured step data lacked the mandatory `ctf_data` key.
    #[error("ctf_data needs to be specified in structured step data")]
    MissingCtfData,
}

/// Fields sent when a run is created.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct NewRun {
    /// Run title, usually the test name.
    pub name: String,
    /// Test identifier.
    pub identifier: String,
    /// Free-form description.
    pub description: String,
    /// Owning team.
    pub team_id: TeamId,
    /// Setup the run executes on.
    #[serde(rename = "test_setup")]
    pub setup_id: SetupId,
}

/// A step result to persist, with its position in the run hierarchy.
#[derive(Clone, Copy, Debug)]
pub struct StepSubmission<'a> {
    /// Run the step belongs to.
    pub run_id: RunId,
    /// The finished step.
    pub result: &'a StepResult,
    /// Parent action when the run is nested under an outer worker.
    pub parent_action: Option<ActionId>,
    /// Replay index within the worker.
    pub run_index: u32,
}

/// A file to upload into a run's log store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogUpload {
    /// Local file to send.
    pub path: Utf8PathBuf,
    /// Destination directory inside the run's log store.
    pub constructive_path: String,
    /// Optional server-side log type.
    pub log_type: Option<u32>,
    /// Step the log is attached to, when known.
    pub action_id: Option<ActionId>,
}

/// Closing information for a run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunOutcome {
    /// `[{label, link}]` dashboard entries shown next to the run.
    pub dashboard_details: Vec<Value>,
    /// Free-form summary rows.
    pub summary: Vec<Value>,
}

/// One row of the setup listing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SetupSummary {
    /// Setup identifier.
    pub id: SetupId,
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Status label as reported by the server.
    pub status: String,
}

/// Append-only store for run and step results.
pub trait ResultSink: Send + Sync + std::fmt::Debug {
    /// Creates a run and returns its id.
    fn create_run<'a>(&'a self, run: &'a NewRun) -> SinkFuture<'a, RunId>;

    /// Saves one step result and returns the server's action id.
    fn save_step<'a>(&'a self, submission: StepSubmission<'a>) -> SinkFuture<'a, ActionId>;

    /// Attaches structured data to a saved step. `data` must carry a
    /// `ctf_data` key.
    fn save_step_json<'a>(&'a self, action_id: ActionId, data: &'a Value) -> SinkFuture<'a, ()>;

    /// Uploads a file into the run's log store.
    fn upload_log<'a>(&'a self, run_id: RunId, upload: &'a LogUpload) -> SinkFuture<'a, ()>;

    /// Closes the run.
    fn finish_run<'a>(&'a self, run_id: RunId, outcome: &'a RunOutcome) -> SinkFuture<'a, ()>;

    /// Operator-facing URL of a run.
    fn run_url(&self, run_id: RunId) -> String;
}

/// Reservation and inventory endpoints of the result server.
pub trait SetupApi: Send + Sync + std::fmt::Debug {
    /// Whether the setup is currently free.
    fn check_free(&self, team_id: TeamId, setup_id: SetupId) -> SinkFuture<'_, bool>;

    /// Marks the setup busy; `false` when the server refused.
    fn set_busy(&self, team_id: TeamId, setup_id: SetupId) -> SinkFuture<'_, bool>;

    /// Marks the setup free; `false` when the server refused.
    fn set_free(&self, team_id: TeamId, setup_id: SetupId) -> SinkFuture<'_, bool>;

    /// Raw device list of the setup, as returned in the reply's `data`.
    fn device_details(&self, team_id: TeamId, setup_id: SetupId) -> SinkFuture<'_, Value>;

    /// Setups visible to the team.
    fn list_setups(&self, team_id: TeamId) -> SinkFuture<'_, Vec<SetupSummary>>;
}

/// Checks that structured step data carries the `ctf_data` key.
///
/// # Errors
///
/// Returns [`SinkError::MissingCtfData`] when the key is absent.
pub fn require_ctf_data(data: &Value) -> Result<(), SinkError> {
    if data.get("ctf_data").is_some() {
        Ok(())
    } else {
        Err(SinkError::MissingCtfData)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ctf_data_key_is_mandatory() {
        assert!(require_ctf_data(&json!({"ctf_data": {"rssi": -40}})).is_ok());
        assert!(matches!(
            require_ctf_data(&json!({"rssi": -40})),
            Err(SinkError::MissingCtfData)
        ));
    }

    #[test]
    fn new_run_serialises_setup_as_test_setup() {
        let run = NewRun {
            name: String::from("hello"),
            identifier: String::from("hello"),
            description: String::new(),
            team_id: 1,
            setup_id: 7,
        };
        let body = serde_json::to_value(&run).expect("serialise");
        assert_eq!(body["test_setup"], json!(7));
        assert!(body.get("setup_id").is_none());
    }
}
