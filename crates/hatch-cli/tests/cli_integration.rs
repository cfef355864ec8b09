//! CLI subprocess integration tests.
//!
//! These tests invoke the `hatch` binary against the mock backend and
//! verify exit codes, stdout content, and the recorded environments.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn hatch_bin(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_hatch"));
    cmd.env("HATCH_HOME", home)
        .env("HATCH_INSTALLER_BACKEND", "mock")
        .env_remove("HATCH_AUTO_APPROVE")
        .env_remove("HATCH_LOG");
    cmd
}

fn write_package(dir: &Path, body: &str) -> PathBuf {
    let pkg = dir.join("pkg");
    std::fs::create_dir_all(&pkg).unwrap();
    std::fs::write(pkg.join("hatch_metadata.json"), body).unwrap();
    pkg
}

fn demo_package(dir: &Path) -> PathBuf {
    write_package(
        dir,
        r#"{
  "name": "demo",
  "version": "1.0.0",
  "system_dependencies": [{"name": "curl", "package_manager": "mock:"}],
  "python_dependencies": [
    {"name": "requests", "version_constraint": "==2.31.0", "package_manager": "mock:"},
    {"name": "numpy", "version_constraint": ">=1.24", "package_manager": "mock:"}
  ]
}"#,
    )
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn environments_json(home: &Path) -> Option<serde_json::Value> {
    let content = std::fs::read_to_string(home.join("environments.json")).ok()?;
    Some(serde_json::from_str(&content).unwrap())
}

#[test]
fn cli_version_and_help_exit_zero() {
    let home = tempfile::tempdir().unwrap();
    let output = hatch_bin(home.path()).arg("--version").output().unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("hatch"));

    let output = hatch_bin(home.path()).arg("--help").output().unwrap();
    assert!(output.status.success());
    let help = stdout(&output);
    for cmd in ["plan", "install", "list", "doctor"] {
        assert!(help.contains(cmd), "help must list '{cmd}': {help}");
    }
}

#[test]
fn cli_plan_prints_stages_and_fingerprint() {
    let home = tempfile::tempdir().unwrap();
    let pkg = demo_package(home.path());
    let output = hatch_bin(home.path()).arg("plan").arg(&pkg).output().unwrap();
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("'demo'"), "{out}");
    assert!(out.contains("requests==2.31.0"), "{out}");
    assert!(out.contains("fingerprint: "), "{out}");
    assert!(environments_json(home.path()).is_none(), "plan must not install");
}

#[test]
fn cli_plan_json_is_stable() {
    let home = tempfile::tempdir().unwrap();
    let pkg = demo_package(home.path());
    let run = || {
        let output = hatch_bin(home.path())
            .args(["--json", "plan"])
            .arg(&pkg)
            .output()
            .unwrap();
        assert!(output.status.success(), "stderr: {}", stderr(&output));
        serde_json::from_str::<serde_json::Value>(&stdout(&output)).unwrap()
    };
    let first = run();
    let second = run();
    assert_eq!(first, second);
    assert_eq!(first["package"], "demo");
    assert_eq!(first["dependencies"], 3);
    assert_eq!(first["fingerprint"].as_str().unwrap().len(), 64);
}

#[test]
fn cli_install_records_environment() {
    let home = tempfile::tempdir().unwrap();
    let pkg = demo_package(home.path());
    let output = hatch_bin(home.path())
        .args(["install", "--env", "dev"])
        .arg(&pkg)
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("succeeded"));

    let envs = environments_json(home.path()).expect("environments.json written");
    let records = envs["environments"]["dev"].as_array().unwrap();
    assert_eq!(records.len(), 3);
    assert!(records
        .iter()
        .any(|r| r["name"] == "requests" && r["version"] == "2.31.0"));

    let output = hatch_bin(home.path())
        .args(["--json", "list", "--env", "dev"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let listed: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 3);

    let output = hatch_bin(home.path()).arg("list").output().unwrap();
    assert!(stdout(&output).contains("dev"));
}

#[test]
fn cli_install_json_report() {
    let home = tempfile::tempdir().unwrap();
    let pkg = demo_package(home.path());
    let output = hatch_bin(home.path())
        .args(["--json", "install", "--yes"])
        .arg(&pkg)
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(report["outcome"], "succeeded");
    assert_eq!(report["state"], "completed");
    assert_eq!(report["results"].as_array().unwrap().len(), 3);
    assert_eq!(report["manifest"].as_array().unwrap().len(), 3);
}

#[test]
fn cli_install_failure_rolls_back_with_exit_one() {
    let home = tempfile::tempdir().unwrap();
    let pkg = write_package(
        home.path(),
        r#"{
  "name": "broken",
  "system_dependencies": [{"name": "curl", "package_manager": "mock:"}],
  "python_dependencies": [{"name": "bad", "package_manager": "mock:fail"}]
}"#,
    );
    let output = hatch_bin(home.path())
        .args(["--json", "install"])
        .arg(&pkg)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1), "stderr: {}", stderr(&output));
    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(report["outcome"], "rolled_back");
    assert_eq!(report["trigger"]["dependency"], "runtime:bad");
    let curl = report["results"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["dependency"]["name"] == "curl")
        .unwrap();
    assert_eq!(curl["status"], "rolled_back");
    assert!(environments_json(home.path()).is_none());
}

#[test]
fn cli_rollback_failure_exits_four() {
    let home = tempfile::tempdir().unwrap();
    let pkg = write_package(
        home.path(),
        r#"{
  "name": "sticky",
  "system_dependencies": [{"name": "curl", "package_manager": "mock:fail-uninstall"}],
  "python_dependencies": [{"name": "bad", "package_manager": "mock:fail"}]
}"#,
    );
    let output = hatch_bin(home.path()).arg("install").arg(&pkg).output().unwrap();
    assert_eq!(output.status.code(), Some(4), "stdout: {}", stdout(&output));
    assert!(stderr(&output).contains("manual cleanup required for: system:curl"));
}

#[test]
fn cli_refusal_exits_three_and_installs_nothing() {
    let home = tempfile::tempdir().unwrap();
    let pkg = demo_package(home.path());
    let output = hatch_bin(home.path())
        .args(["install", "--no"])
        .arg(&pkg)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
    assert!(stderr(&output).contains("installation not approved"));
    assert!(environments_json(home.path()).is_none());
}

#[test]
fn cli_bad_declarations_exit_two() {
    let home = tempfile::tempdir().unwrap();
    let pkg = write_package(home.path(), "{ not json");
    let output = hatch_bin(home.path()).arg("install").arg(&pkg).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("declaration error"));

    let pkg = write_package(
        home.path(),
        r#"{"name": "odd", "conda_dependencies": [{"name": "x"}]}"#,
    );
    let output = hatch_bin(home.path()).arg("plan").arg(&pkg).output().unwrap();
    assert_eq!(output.status.code(), Some(2), "stderr: {}", stderr(&output));

    let pkg = write_package(
        home.path(),
        r#"{"name": "loop", "python_dependencies": [
            {"name": "a", "after": "b"},
            {"name": "b", "after": "a"}
        ]}"#,
    );
    let output = hatch_bin(home.path()).arg("plan").arg(&pkg).output().unwrap();
    assert_eq!(output.status.code(), Some(2), "stderr: {}", stderr(&output));

    let missing = home.path().join("nowhere");
    let output = hatch_bin(home.path()).arg("plan").arg(&missing).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn cli_unsafe_dependency_names_exit_two() {
    let home = tempfile::tempdir().unwrap();
    let pkg = write_package(
        home.path(),
        r#"{"name": "sneaky", "python_dependencies": [
            {"name": "--index-url=http://mirror.invalid/simple"}
        ]}"#,
    );
    let output = hatch_bin(home.path())
        .args(["install", "--yes"])
        .arg(&pkg)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2), "stderr: {}", stderr(&output));
    assert!(stderr(&output).contains("invalid runtime dependency name"));
    assert!(environments_json(home.path()).is_none());
}

#[test]
fn cli_dry_run_records_nothing() {
    let home = tempfile::tempdir().unwrap();
    let pkg = demo_package(home.path());
    let output = hatch_bin(home.path())
        .args(["--json", "install", "--dry-run"])
        .arg(&pkg)
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(report["simulation"], true);
    assert!(report["manifest"].as_array().unwrap().is_empty());
    assert!(environments_json(home.path()).is_none());
}

#[test]
fn cli_expect_plan_guards_against_drift() {
    let home = tempfile::tempdir().unwrap();
    let pkg = demo_package(home.path());
    let output = hatch_bin(home.path())
        .args(["--json", "plan"])
        .arg(&pkg)
        .output()
        .unwrap();
    let plan: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    let fingerprint = plan["fingerprint"].as_str().unwrap().to_owned();

    let output = hatch_bin(home.path())
        .args(["install", "--expect-plan", &fingerprint])
        .arg(&pkg)
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let output = hatch_bin(home.path())
        .args(["install", "--expect-plan", "deadbeef"])
        .arg(&pkg)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("plan fingerprint mismatch"));
}

#[test]
fn cli_invalid_environment_name_fails() {
    let home = tempfile::tempdir().unwrap();
    let pkg = demo_package(home.path());
    let output = hatch_bin(home.path())
        .args(["install", "--env", "../evil"])
        .arg(&pkg)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn cli_list_unknown_environment_fails() {
    let home = tempfile::tempdir().unwrap();
    let output = hatch_bin(home.path())
        .args(["list", "--env", "ghost"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    let output = hatch_bin(home.path()).arg("list").output().unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("no environments found"));
}

#[test]
fn cli_doctor_reports_mock_backend() {
    let home = tempfile::tempdir().unwrap();
    let output = hatch_bin(home.path())
        .args(["--json", "doctor"])
        .output()
        .unwrap();
    assert!(output.status.success(), "stdout: {}", stdout(&output));
    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(report["healthy"], true);
    assert!(report["checks"]
        .as_array()
        .unwrap()
        .iter()
        .any(|c| c["name"] == "backend"));
}

#[test]
fn cli_doctor_rejects_bad_config() {
    let home = tempfile::tempdir().unwrap();
    std::fs::write(home.path().join("config.toml"), "concurrency = 0\n").unwrap();
    let output = hatch_bin(home.path()).arg("doctor").output().unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn cli_completions_and_man_pages() {
    let home = tempfile::tempdir().unwrap();
    let output = hatch_bin(home.path())
        .args(["completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("hatch"));

    let man = home.path().join("man");
    let output = hatch_bin(home.path())
        .arg("man-pages")
        .arg(&man)
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(man.join("hatch.1").exists());
    assert!(man.join("hatch-install.1").exists());
}
