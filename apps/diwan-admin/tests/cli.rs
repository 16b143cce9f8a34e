//! Binary smoke tests. None of these reach a database.

use assert_cmd::Command;
use predicates::prelude::*;

fn admin() -> Command {
    let mut cmd = Command::cargo_bin("diwan-admin").unwrap();
    cmd.env_remove("DIWAN_CONFIG").env("NO_COLOR", "1");
    cmd
}

#[test]
fn test_help_lists_commands() {
    admin()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("diagnose"))
        .stdout(predicate::str::contains("fix"))
        .stdout(predicate::str::contains("progress"));
}

#[test]
fn test_version() {
    admin()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_malformed_request_id_is_a_usage_error() {
    admin()
        .args(["show", "not-a-uuid"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("not-a-uuid"));
}

#[test]
fn test_missing_config_file_fails_before_connecting() {
    admin()
        .args(["--config", "/nonexistent/diwan.toml", "migrate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}
