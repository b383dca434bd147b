//! Configuration loading via `ortho-config`.
//!
//! [`RunConfig`] merges defaults, a discovered `ctf.toml` and `CTF_*`
//! environment variables. Credentials may also come from `~/.ctf_config`,
//! which takes precedence over the environment when present.

use std::env;
use std::ffi::OsString;
use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::context::RunSettings;
use crate::device::SshSettings;
use crate::runner::session::WorkerLink;
use crate::sink::{ServerClient, ServerEndpoints};

/// Default link template for runs on the result server.
pub const DEFAULT_RESULTS_URL_TEMPLATE: &str = "{api}/test_run_result/{id}";

/// Name of the per-user credentials file in the home directory.
pub const CREDENTIALS_FILE_NAME: &str = ".ctf_config";

/// Replay index variable set by outer workers; it carries no prefix.
pub const RUN_INDEX_VAR: &str = "RUN_INDEX";

/// Runner settings derived from environment variables and configuration
/// files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "CTF",
    discovery(
        app_name = "ctf",
        env_var = "CTF_CONFIG_PATH",
        config_file_name = "ctf.toml",
        dotfile_name = ".ctf.toml",
        project_file_name = "ctf.toml"
    )
)]
pub struct RunConfig {
    /// Base URL of the result server API.
    pub api_server_url: Option<String>,
    /// Base URL of the file server receiving logs.
    pub file_server_url: Option<String>,
    /// Login user.
    pub user: Option<String>,
    /// Login password.
    pub password: Option<String>,
    /// Preset token; when set no login happens.
    pub worker_auth_token: Option<String>,
    /// Set by an outer worker that owns the reservation.
    pub client_test_setup_id: Option<u64>,
    /// Run created by an outer worker.
    pub client_test_exe_id: Option<u64>,
    /// Parent action of every saved step.
    pub client_test_parent_action_id: Option<u64>,
    /// Per-step budget in seconds.
    #[ortho_config(default = 60)]
    pub timeout: u64,
    /// Log collection budget in seconds.
    #[ortho_config(default = 300)]
    pub log_collect_timeout: u64,
    /// File copy budget in seconds.
    #[ortho_config(default = 180)]
    pub scp_timeout: u64,
    /// Worker pool size.
    #[ortho_config(default = 10)]
    pub max_workers: usize,
    /// `ssh` client binary.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// `scp` client binary.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Link template for runs; `{api}` and `{id}` are substituted.
    #[ortho_config(default = DEFAULT_RESULTS_URL_TEMPLATE.to_owned())]
    pub results_url_template: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

fn require_field(value: Option<&str>, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    match value.map(str::trim) {
        Some(found) if !found.is_empty() => Ok(()),
        _ => Err(ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to ctf.toml or ~/{CREDENTIALS_FILE_NAME}",
            metadata.description, metadata.env_var, metadata.toml_key
        ))),
    }
}

impl RunConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("ctf")]).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Overlays values from the credentials file.
    #[must_use]
    pub fn with_credentials(mut self, file: CredentialsFile) -> Self {
        self.user = file.user.or(self.user);
        self.password = file.pwd.or(self.password);
        self.api_server_url = file.api_server_url.or(self.api_server_url);
        self.file_server_url = file.file_server_url.or(self.file_server_url);
        self
    }

    /// Checks that the server can be reached and authenticated against.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the variable or key to
    /// set, and [`ConfigError::Invalid`] for a zero-sized worker pool.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            self.api_server_url.as_deref(),
            &FieldMetadata::new("result server URL", "CTF_API_SERVER_URL", "api_server_url"),
        )?;
        require_field(
            self.file_server_url.as_deref(),
            &FieldMetadata::new("file server URL", "CTF_FILE_SERVER_URL", "file_server_url"),
        )?;
        if self.worker_auth_token.is_none() {
            require_field(
                self.user.as_deref(),
                &FieldMetadata::new("result server user", "CTF_USER", "user"),
            )?;
            require_field(
                self.password.as_deref(),
                &FieldMetadata::new("result server password", "CTF_PASSWORD", "password"),
            )?;
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid {
                field: String::from("max_workers"),
                value: String::from("0"),
            });
        }
        Ok(())
    }

    /// Where the result server lives.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn endpoints(&self) -> Result<ServerEndpoints, ConfigError> {
        self.validate()?;
        Ok(ServerEndpoints {
            api_server_url: self.api_server_url.clone().unwrap_or_default(),
            file_server_url: self.file_server_url.clone().unwrap_or_default(),
            results_url_template: self.results_url_template.clone(),
        })
    }

    /// Client authenticated with the preset token or the credentials.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn server_client(&self) -> Result<ServerClient, ConfigError> {
        let endpoints = self.endpoints()?;
        if let Some(token) = self.worker_auth_token.as_deref() {
            return Ok(ServerClient::with_token(endpoints, token));
        }
        Ok(ServerClient::with_password(
            endpoints,
            self.user.as_deref().unwrap_or_default(),
            self.password.as_deref().unwrap_or_default(),
        ))
    }

    /// Timing and sizing knobs of a run.
    #[must_use]
    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            step_timeout: Duration::from_secs(self.timeout),
            log_collect_timeout: Duration::from_secs(self.log_collect_timeout),
            scp_timeout: Duration::from_secs(self.scp_timeout),
            max_workers: self.max_workers,
            ..RunSettings::default()
        }
    }

    /// Client binaries for the SSH-based transports.
    #[must_use]
    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            ssh_bin: self.ssh_bin.clone(),
            scp_bin: self.scp_bin.clone(),
            ..SshSettings::default()
        }
    }

    /// Outer worker settings, with the replay index taken from `run_index`.
    #[must_use]
    pub const fn worker_link(&self, run_index: u32) -> WorkerLink {
        WorkerLink {
            manages_reservation: self.client_test_setup_id.is_some(),
            test_exe_id: self.client_test_exe_id,
            parent_action: self.client_test_parent_action_id,
            run_index,
        }
    }
}

/// Reads the replay index from `RUN_INDEX`; unset means 0.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] when the value is not a non-negative
/// integer.
pub fn run_index_from_env() -> Result<u32, ConfigError> {
    let Ok(raw) = env::var(RUN_INDEX_VAR) else {
        return Ok(0);
    };
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        field: String::from(RUN_INDEX_VAR),
        value: raw,
    })
}

/// Contents of `~/.ctf_config`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct CredentialsFile {
    /// Login user.
    pub user: Option<String>,
    /// Login password.
    pub pwd: Option<String>,
    /// Base URL of the result server API.
    pub api_server_url: Option<String>,
    /// Base URL of the file server.
    pub file_server_url: Option<String>,
}

impl CredentialsFile {
    /// `~/.ctf_config`, when the home directory is known.
    #[must_use]
    pub fn default_path() -> Option<Utf8PathBuf> {
        let home = env::var("HOME").ok().filter(|home| !home.is_empty())?;
        Some(Utf8PathBuf::from(home).join(CREDENTIALS_FILE_NAME))
    }

    /// Reads the file at `path`; a missing file reads as empty.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Credentials`] when the file exists but cannot
    /// be read or parsed.
    pub fn read(path: &Utf8Path) -> Result<Self, ConfigError> {
        let failure = |message: String| ConfigError::Credentials {
            path: path.to_owned(),
            message,
        };
        let parent = path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        let Some(file_name) = path.file_name() else {
            return Err(failure(String::from("not a file path")));
        };
        let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(failure(err.to_string())),
        };
        let text = match dir.read_to_string(file_name) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(failure(err.to_string())),
        };
        serde_json::from_str(&text).map_err(|err| failure(err.to_string()))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// A value is out of range.
    #[error("invalid value '{value}' for {field}")]
    Invalid {
        /// Field or variable name.
        field: String,
        /// Offending value.
        value: String,
    },
    /// The credentials file could not be read.
    #[error("failed to read credentials from {path}: {message}")]
    Credentials {
        /// File that was read.
        path: Utf8PathBuf,
        /// Reason for the failure.
        message: String,
    },
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
