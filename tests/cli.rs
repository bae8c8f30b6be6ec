use assert_cmd::Command;
use predicates::prelude::*;

fn cloudctl() -> Command {
    Command::cargo_bin("cloudctl").unwrap()
}

#[test]
fn test_help_exits_successfully() {
    cloudctl().arg("--help").assert().success();
}

#[test]
fn test_version_exits_successfully() {
    cloudctl()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("cloudctl"));
}

#[test]
fn test_no_args_shows_usage() {
    cloudctl()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_unknown_subcommand_fails() {
    cloudctl()
        .arg("nonexistent")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn test_help_lists_all_subcommands() {
    let assert = cloudctl().arg("--help").assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();

    for cmd in ["instance", "vhost", "port", "routing"] {
        assert!(output.contains(cmd), "help output should list '{cmd}' subcommand");
    }
}

#[test]
fn test_instance_help_lists_all_actions() {
    let assert = cloudctl().args(["instance", "--help"]).assert().success();
    let output = String::from_utf8(assert.get_output().stdout.clone()).unwrap();

    for action in [
        "create",
        "list",
        "show",
        "start",
        "shutdown",
        "stop",
        "delete",
        "mark-active",
        "reset-root-user",
    ] {
        assert!(output.contains(action), "instance help should list '{action}'");
    }
}

#[test]
fn test_vhost_help_lists_add_and_remove() {
    cloudctl()
        .args(["vhost", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("add"))
        .stdout(predicate::str::contains("remove"));
}

#[test]
fn test_port_help_lists_add_and_remove() {
    cloudctl()
        .args(["port", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("add"))
        .stdout(predicate::str::contains("remove"));
}

#[test]
fn test_routing_help_shows_json_flag() {
    cloudctl()
        .args(["routing", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--json"));
}

#[test]
fn test_global_output_flag_listed_in_help() {
    cloudctl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output"))
        .stdout(predicate::str::contains("--config"));
}

#[test]
fn test_instance_create_help_lists_kind_values() {
    cloudctl()
        .args(["instance", "create", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("container"))
        .stdout(predicate::str::contains("vm"));
}

#[test]
fn test_missing_config_file_fails_gracefully() {
    // No config exists at the default path inside the test sandbox, so any
    // real action should fail with a config-loading error, not panic.
    cloudctl()
        .args(["--config", "/nonexistent/path/config.toml", "instance", "list"])
        .assert()
        .failure();
}
