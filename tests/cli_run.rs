//! Behavioural tests for `ctf run` failures that happen before any server
//! traffic.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use tempfile::TempDir;

const SERVER_VARS: [&str; 6] = [
    "CTF_API_SERVER_URL",
    "CTF_FILE_SERVER_URL",
    "CTF_USER",
    "CTF_PASSWORD",
    "CTF_WORKER_AUTH_TOKEN",
    "CTF_CONFIG_PATH",
];

fn isolated_run(home: &TempDir) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("ctf");
    cmd.current_dir(home.path())
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join(".config"));
    for var in SERVER_VARS {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn unknown_tests_are_usage_errors() {
    let mut cmd = cargo_bin_cmd!("ctf");
    cmd.args(["run", "warp-drive", "--test-setup-id", "4"]);
    cmd.assert()
        .code(2)
        .stderr(contains("Unknown test 'warp-drive'"));
}

#[test]
fn unknown_skip_phases_are_rejected_by_the_parser() {
    let mut cmd = cargo_bin_cmd!("ctf");
    cmd.args(["run", "hello", "--test-setup-id", "4", "--skip", "teardown"]);
    cmd.assert().code(2).stderr(contains("pre_run"));
}

#[test]
fn missing_server_settings_name_the_variable_to_set() {
    let home = TempDir::new().expect("temp home");
    let mut cmd = isolated_run(&home);
    cmd.args(["run", "hello", "--test-setup-id", "4"]);
    cmd.assert()
        .code(2)
        .stderr(contains("CTF_API_SERVER_URL"));
}

#[test]
fn a_setup_id_is_required() {
    let home = TempDir::new().expect("temp home");
    let mut cmd = isolated_run(&home);
    cmd.env_remove("CTF_CLIENT_TEST_SETUP_ID")
        .args(["run", "hello"]);
    cmd.assert()
        .code(2)
        .stderr(contains("--test-setup-id is required"));
}
