//! HTTP client for the result server.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::envelope::Envelope;
use super::{
    ActionId, LogUpload, NewRun, ResultSink, RunId, RunOutcome, SetupApi, SetupId, SetupSummary,
    SinkError, SinkFuture, StepSubmission, TeamId, require_ctf_data,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const SETUP_STATUS_IDLE: u64 = 0;

const LOGIN: &str = "web_server_api/user/login/";
const CHECK_FREE: &str = "web_server_api/test_setup/check_if_test_setup_is_free_from_terminal/";
const SET_BUSY: &str = "web_server_api/test_setup/set_test_setup_busy_from_terminal/";
const SET_FREE: &str = "web_server_api/test_setup/set_test_setup_free_from_terminal/";
const DEVICE_DETAILS: &str = "web_server_api/test_setup/get_device_connection_details/";
const LIST_SETUPS: &str = "web_server_api/test_setup/all/";
const CREATE_RUN: &str = "web_server_api/test_run_result/create_test_run_result_from_terminal/";
const SAVE_ACTION: &str = "web_server_api/test_run_result/save_test_action_result_from_terminal/";
const SAVE_ACTION_JSON: &str = "web_server_api/test_run_result/save_test_action_result_json_data/";
const SAVE_OUTCOME: &str = "web_server_api/test_run_result/save_test_run_outcome_from_terminal/";
const WRITE_LOG: &str = "file_server_api/logs/write_log_file/";

/// Where the result server lives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerEndpoints {
    /// Base URL of the API server.
    pub api_server_url: String,
    /// Base URL of the file server.
    pub file_server_url: String,
    /// Template for operator-facing run links; `{id}` is replaced with the
    /// run id and `{api}` with the API base URL.
    pub results_url_template: String,
}

/// How the client authenticates.
#[derive(Clone)]
enum Auth {
    Password { user: String, password: String },
    Token,
}

/// Result server client implementing [`ResultSink`] and [`SetupApi`].
///
/// The token is obtained lazily on the first request unless a worker token
/// was supplied up front.
pub struct ServerClient {
    http: reqwest::Client,
    endpoints: ServerEndpoints,
    auth: Auth,
    token: RwLock<Option<String>>,
}

impl std::fmt::Debug for ServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerClient")
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

impl ServerClient {
    /// Client that logs in with `user` and `password` on first use.
    #[must_use]
    pub fn with_password(endpoints: ServerEndpoints, user: &str, password: &str) -> Self {
        Self::build(
            endpoints,
            Auth::Password {
                user: user.to_owned(),
                password: password.to_owned(),
            },
            None,
        )
    }

    /// Client that uses a preset worker token and never logs in.
    #[must_use]
    pub fn with_token(endpoints: ServerEndpoints, token: &str) -> Self {
        Self::build(endpoints, Auth::Token, Some(token.to_owned()))
    }

    fn build(endpoints: ServerEndpoints, auth: Auth, token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            endpoints,
            auth,
            token: RwLock::new(token),
        }
    }

    async fn token(&self) -> Result<String, SinkError> {
        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(token.clone());
        }
        let mut slot = self.token.write().await;
        if let Some(token) = slot.as_ref() {
            return Ok(token.clone());
        }
        let token = self.login().await?;
        *slot = Some(token.clone());
        Ok(token)
    }

    async fn login(&self) -> Result<String, SinkError> {
        let Auth::Password { user, password } = &self.auth else {
            return Err(SinkError::Login {
                message: String::from("worker token rejected and no credentials configured"),
            });
        };
        let url = join_url(&self.endpoints.api_server_url, LOGIN);
        let response = self
            .http
            .post(&url)
            .form(&[("username", user.as_str()), ("password", password.as_str())])
            .send()
            .await
            .map_err(|err| SinkError::Login {
                message: err.to_string(),
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|err| SinkError::Login {
            message: err.to_string(),
        })?;
        if !status.is_success() {
            return Err(SinkError::Login {
                message: format!("invalid response: {body} status: {}", status.as_u16()),
            });
        }
        let envelope = Envelope::parse(LOGIN, &body).map_err(|err| SinkError::Login {
            message: err.to_string(),
        })?;
        let token = envelope.data_str(LOGIN, "token").map_err(|err| SinkError::Login {
            message: err.to_string(),
        })?;
        info!(user = %user, "logged in to result server");
        Ok(token)
    }

    async fn post_json(&self, endpoint: &str, body: &Value) -> Result<Envelope, SinkError> {
        let token = self.token().await?;
        let url = join_url(&self.endpoints.api_server_url, endpoint);
        debug!(%url, "result server request");
        let request = self
            .http
            .post(&url)
            .header("Authorization", format!("Token {token}"))
            .json(body);
        read_envelope(endpoint, request).await
    }

    async fn get(&self, endpoint: &str) -> Result<Envelope, SinkError> {
        let token = self.token().await?;
        let url = join_url(&self.endpoints.api_server_url, endpoint);
        let request = self
            .http
            .get(&url)
            .header("Authorization", format!("Token {token}"));
        read_envelope(endpoint, request).await
    }

    async fn upload(&self, run_id: RunId, upload: &LogUpload) -> Result<(), SinkError> {
        let save_log = |message: String| SinkError::SaveLog {
            path: upload.path.clone(),
            message,
        };
        let token = self.token().await?;
        let bytes = tokio::fs::read(&upload.path)
            .await
            .map_err(|err| save_log(err.to_string()))?;
        let file_name = upload.path.file_name().unwrap_or("log").to_owned();
        let mut form = Form::new()
            .text("test_execution_id", run_id.to_string())
            .text("constructive_path", upload.constructive_path.clone())
            .part("log_file", Part::bytes(bytes).file_name(file_name));
        if let Some(log_type) = upload.log_type {
            form = form.text("log_type", log_type.to_string());
        }
        if let Some(action_id) = upload.action_id {
            form = form.text("test_action_result_id", action_id.to_string());
        }

        let url = join_url(&self.endpoints.file_server_url, WRITE_LOG);
        let request = self
            .http
            .post(&url)
            .header("Authorization", format!("Token {token}"))
            .multipart(form);
        read_envelope(WRITE_LOG, request)
            .await
            .map(|_| ())
            .map_err(|err| save_log(err.to_string()))
    }
}

async fn read_envelope(
    endpoint: &str,
    request: reqwest::RequestBuilder,
) -> Result<Envelope, SinkError> {
    let http_error = |err: reqwest::Error| SinkError::Http {
        endpoint: endpoint.to_owned(),
        message: err.to_string(),
    };
    let response = request.send().await.map_err(http_error)?;
    let status = response.status();
    let body = response.text().await.map_err(http_error)?;
    if !status.is_success() {
        return Err(SinkError::Server {
            endpoint: endpoint.to_owned(),
            code: i64::from(status.as_u16()),
            message: body,
        });
    }
    Envelope::parse(endpoint, &body)
}

/// Joins a base URL and a relative path with exactly one slash.
fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn setup_status_label(status: &Value) -> String {
    match status.as_u64() {
        Some(0) => String::from("idle"),
        Some(1) => String::from("dirty"),
        Some(2) => String::from("busy"),
        Some(3) => String::from("insta-stop"),
        _ => status
            .as_str()
            .map_or_else(|| status.to_string(), str::to_owned),
    }
}

fn parse_setup(entry: &Value) -> Option<SetupSummary> {
    let text = |key: &str| {
        entry
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    };
    Some(SetupSummary {
        id: entry.get("id")?.as_u64()?,
        name: text("name"),
        description: text("description"),
        status: entry
            .get("status")
            .map_or_else(String::new, setup_status_label),
    })
}

impl ResultSink for ServerClient {
    fn create_run<'a>(&'a self, run: &'a NewRun) -> SinkFuture<'a, RunId> {
        Box::pin(async move {
            let body = serde_json::to_value(run).map_err(|err| SinkError::Decode {
                endpoint: CREATE_RUN.to_owned(),
                message: err.to_string(),
            })?;
            let envelope = self.post_json(CREATE_RUN, &body).await?;
            let run_id = envelope.data_u64(CREATE_RUN, "id")?;
            info!(run_id, name = %run.name, "created test run");
            Ok(run_id)
        })
    }

    fn save_step<'a>(&'a self, submission: StepSubmission<'a>) -> SinkFuture<'a, ActionId> {
        Box::pin(async move {
            let result = submission.result;
            let body = json!({
                "run_execution": submission.run_id,
                "description": result.name,
                "outcome": result.outcome.code(),
                "logs": result.log,
                "start_time": result.started_at.to_rfc3339(),
                "end_time": result.finished_at.to_rfc3339(),
                "parent_action": submission.parent_action,
                "tags": serde_json::to_string(&result.tags).unwrap_or_default(),
                "run_index": submission.run_index,
            });
            let envelope = self.post_json(SAVE_ACTION, &body).await?;
            let action_id = envelope.data_u64(SAVE_ACTION, "test_action_result_id")?;
            if let Some(data) = &result.structured_data {
                self.save_step_json(action_id, data).await?;
            }
            Ok(action_id)
        })
    }

    fn save_step_json<'a>(&'a self, action_id: ActionId, data: &'a Value) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            require_ctf_data(data)?;
            let body = json!({
                "test_action_result": action_id,
                "ctf_json_data_all": data.to_string(),
            });
            self.post_json(SAVE_ACTION_JSON, &body).await.map(|_| ())
        })
    }

    fn upload_log<'a>(&'a self, run_id: RunId, upload: &'a LogUpload) -> SinkFuture<'a, ()> {
        Box::pin(self.upload(run_id, upload))
    }

    fn finish_run<'a>(&'a self, run_id: RunId, outcome: &'a RunOutcome) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            let body = json!({
                "test_run_id": run_id,
                "dashboard_details": Value::Array(outcome.dashboard_details.clone()).to_string(),
                "test_result_summary": Value::Array(outcome.summary.clone()).to_string(),
            });
            let envelope = self.post_json(SAVE_OUTCOME, &body).await?;
            info!(run_id, message = %envelope.message, "run outcome saved");
            Ok(())
        })
    }

    fn run_url(&self, run_id: RunId) -> String {
        self.endpoints
            .results_url_template
            .replace("{api}", self.endpoints.api_server_url.trim_end_matches('/'))
            .replace("{id}", &run_id.to_string())
    }
}

impl SetupApi for ServerClient {
    fn check_free(&self, team_id: TeamId, setup_id: SetupId) -> SinkFuture<'_, bool> {
        Box::pin(async move {
            let body = json!({"test_setup_id": setup_id, "team_id": team_id});
            let envelope = self.post_json(CHECK_FREE, &body).await?;
            Ok(envelope
                .data_field("status")
                .and_then(Value::as_u64)
                .is_some_and(|status| status == SETUP_STATUS_IDLE))
        })
    }

    fn set_busy(&self, team_id: TeamId, setup_id: SetupId) -> SinkFuture<'_, bool> {
        Box::pin(async move {
            let endpoint = format!("{SET_BUSY}{setup_id}/");
            let envelope = self.post_json(&endpoint, &json!({"team_id": team_id})).await?;
            Ok(envelope
                .data_field("status")
                .and_then(Value::as_u64)
                .is_some_and(|status| status != SETUP_STATUS_IDLE))
        })
    }

    fn set_free(&self, team_id: TeamId, setup_id: SetupId) -> SinkFuture<'_, bool> {
        Box::pin(async move {
            let endpoint = format!("{SET_FREE}{setup_id}/");
            let envelope = self.post_json(&endpoint, &json!({"team_id": team_id})).await?;
            Ok(envelope
                .data_field("is_free")
                .and_then(Value::as_bool)
                .unwrap_or(true))
        })
    }

    fn device_details(&self, team_id: TeamId, setup_id: SetupId) -> SinkFuture<'_, Value> {
        Box::pin(async move {
            let body = json!({"test_setup_id": setup_id, "team_id": team_id});
            let envelope = self.post_json(DEVICE_DETAILS, &body).await?;
            if envelope.data.is_null() {
                return Err(SinkError::Decode {
                    endpoint: DEVICE_DETAILS.to_owned(),
                    message: format!("no device details for setup {setup_id}"),
                });
            }
            Ok(envelope.data)
        })
    }

    fn list_setups(&self, team_id: TeamId) -> SinkFuture<'_, Vec<SetupSummary>> {
        Box::pin(async move {
            let endpoint = format!("{LIST_SETUPS}{team_id}");
            let envelope = self.get(&endpoint).await?;
            let entries = envelope.data.as_array().cloned().unwrap_or_default();
            Ok(entries.iter().filter_map(parse_setup).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    /// Answers one request per connection with the next canned body and
    /// records the request line plus body of each request.
    async fn canned_server(bodies: Vec<&'static str>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);
        tokio::spawn(async move {
            for body in bodies {
                let (stream, _) = listener.accept().await.expect("accept");
                let mut reader = BufReader::new(stream);
                let mut request_line = String::new();
                reader.read_line(&mut request_line).await.expect("request line");
                let mut content_length = 0_usize;
                loop {
                    let mut header = String::new();
                    reader.read_line(&mut header).await.expect("header");
                    if header.trim().is_empty() {
                        break;
                    }
                    if let Some(value) = header.to_ascii_lowercase().strip_prefix("content-length:") {
                        content_length = value.trim().parse().expect("length");
                    }
                }
                let mut payload = vec![0_u8; content_length];
                reader.read_exact(&mut payload).await.expect("body");
                recorded.lock().expect("lock").push(format!(
                    "{} {}",
                    request_line.trim(),
                    String::from_utf8_lossy(&payload)
                ));
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                reader
                    .get_mut()
                    .write_all(response.as_bytes())
                    .await
                    .expect("write");
            }
        });
        (format!("http://{addr}/"), seen)
    }

    fn endpoints(base: &str) -> ServerEndpoints {
        ServerEndpoints {
            api_server_url: base.to_owned(),
            file_server_url: base.to_owned(),
            results_url_template: String::from("{api}/test_run_result/{id}"),
        }
    }

    #[tokio::test]
    async fn logs_in_once_then_creates_a_run() {
        let (base, seen) = canned_server(vec![
            r#"{"error":0,"message":"ok","data":{"token":"t0k"}}"#,
            r#"{"error":0,"message":"ok","data":{"id":77}}"#,
        ])
        .await;
        let client = ServerClient::with_password(endpoints(&base), "ci", "pw");
        let run = NewRun {
            name: String::from("hello"),
            identifier: String::from("hello"),
            description: String::new(),
            team_id: 1,
            setup_id: 9,
        };

        let run_id = client.create_run(&run).await.expect("create run");

        assert_eq!(run_id, 77);
        let requests = seen.lock().expect("lock").clone();
        assert!(requests.first().expect("login").starts_with("POST /web_server_api/user/login/"));
        let create = requests.get(1).expect("create");
        assert!(create.contains("create_test_run_result_from_terminal"));
        assert!(create.contains(r#""test_setup":9"#));
    }

    #[tokio::test]
    async fn worker_token_skips_login_and_reads_free_status() {
        let (base, seen) =
            canned_server(vec![r#"{"error":0,"message":"","data":{"status":0}}"#]).await;
        let client = ServerClient::with_token(endpoints(&base), "worker");

        assert!(client.check_free(4, 12).await.expect("check"));
        let requests = seen.lock().expect("lock").clone();
        assert_eq!(requests.len(), 1);
        assert!(requests.first().expect("check").contains(r#""test_setup_id":12"#));
    }

    #[tokio::test]
    async fn server_error_code_surfaces() {
        let (base, _) =
            canned_server(vec![r#"{"error":1,"message":"setup busy","data":null}"#]).await;
        let client = ServerClient::with_token(endpoints(&base), "worker");

        let err = client.set_busy(1, 2).await.expect_err("server error");
        assert!(matches!(err, SinkError::Server { code: 1, .. }), "got {err:?}");
    }

    #[test]
    fn run_url_fills_the_template() {
        let client = ServerClient::with_token(endpoints("https://ctf.example/"), "t");
        assert_eq!(client.run_url(5), "https://ctf.example/test_run_result/5");
    }

    #[test]
    fn urls_join_with_a_single_slash() {
        assert_eq!(join_url("http://a/", "/b/"), "http://a/b/");
        assert_eq!(join_url("http://a", "b"), "http://a/b");
    }

    #[test]
    fn setup_rows_parse_status_codes() {
        let row = parse_setup(&json!({"id": 3, "name": "lab", "status": 2})).expect("row");
        assert_eq!(row.status, "busy");
        assert!(parse_setup(&json!({"name": "no id"})).is_none());
    }
}
