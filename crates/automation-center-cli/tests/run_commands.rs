use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use automation_center_domain::RunId;
use serde_json::Value;
use ulid::Ulid;

fn temp_path(name: &str, ext: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ac-cli-test-{}-{}.{}", name, Ulid::new(), ext))
}

fn write_definition(name: &str, body: &str) -> PathBuf {
    let path = temp_path(name, "yaml");
    fs::write(&path, body)
        .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
    path
}

fn cli(db: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_automation-center"))
        .arg("--db")
        .arg(db)
        .args(args)
        .env_remove("AUTOMATION_CENTER_DB")
        .env_remove("AUTOMATION_CENTER_PRIVILEGED")
        .env_remove("AUTOMATION_CENTER_STEP_TIMEOUT_MS")
        .output()
        .unwrap_or_else(|err| panic!("failed to spawn automation-center: {err}"))
}

fn stdout_of(output: &Output) -> String {
    assert!(
        output.status.success(),
        "command failed\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn extract_run_id(stdout: &str) -> Option<RunId> {
    for token in stdout.split_whitespace() {
        if let Some(raw) = token.strip_prefix("run_id=") {
            let parsed = Ulid::from_string(raw).ok()?;
            return Some(RunId(parsed));
        }
    }
    None
}

const THREE_STEPS: &str = r#"
automation_name: nightly-report
automation_version: "1"
steps:
  - step_key: fetch
    kind: mock
    input:
      source: warehouse
  - step_key: render
    kind: mock
    input: {}
  - step_key: publish
    kind: mock
    input:
      channel: reports
"#;

const FAILS_SECOND: &str = r#"
automation_name: flaky
automation_version: "1"
steps:
  - step_key: prepare
    kind: mock
    input: {}
  - step_key: explode
    kind: mock
    input:
      mock_fail: true
      mock_error: disk full
  - step_key: cleanup
    kind: mock
    input: {}
"#;

#[test]
fn run_then_inspect_completed_run() {
    let db = temp_path("completed", "sqlite3");
    let definition = write_definition("completed", THREE_STEPS);
    let definition_arg = definition.to_string_lossy().to_string();

    let stdout = stdout_of(&cli(
        &db,
        &["run", "--definition", &definition_arg, "--owner", "alice"],
    ));
    assert!(stdout.contains("status=completed"), "{stdout}");
    assert!(stdout.contains("steps_total=3"), "{stdout}");
    assert!(stdout.contains("steps_succeeded=3"), "{stdout}");
    let run_id = extract_run_id(&stdout)
        .unwrap_or_else(|| panic!("missing run_id in {stdout}"))
        .to_string();

    let status = stdout_of(&cli(&db, &["status", "--run-id", &run_id]));
    let snapshot: Value = serde_json::from_str(status.trim())
        .unwrap_or_else(|err| panic!("status is not JSON: {err}"));
    assert_eq!(snapshot["run"]["status"], "completed");
    assert_eq!(snapshot["steps"].as_array().map(Vec::len), Some(3));

    let runs = stdout_of(&cli(&db, &["runs"]));
    assert_eq!(runs.lines().count(), 1);

    let logs = stdout_of(&cli(&db, &["logs", "--run-id", &run_id]));
    let counters: Vec<u64> = logs
        .lines()
        .map(|line| {
            let entry: Value = serde_json::from_str(line)
                .unwrap_or_else(|err| panic!("log line is not JSON: {err}"));
            entry["counter"].as_u64().unwrap_or_else(|| unreachable!())
        })
        .collect();
    assert_eq!(counters, (1..=8).collect::<Vec<u64>>());

    let verify = stdout_of(&cli(&db, &["verify", "--run-id", &run_id]));
    assert!(verify.contains("entries=8"), "{verify}");
    assert!(verify.contains("chain_valid=true"), "{verify}");

    let out = temp_path("export", "jsonl");
    let out_arg = out.to_string_lossy().to_string();
    let export = stdout_of(&cli(
        &db,
        &["export", "--run-id", &run_id, "--out", &out_arg],
    ));
    assert!(export.starts_with("exported 8 log entries to"), "{export}");
    let exported = fs::read_to_string(&out)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", out.display()));
    assert_eq!(exported.lines().count(), 8);
}

#[test]
fn failing_step_cancels_the_rest() {
    let db = temp_path("failed", "sqlite3");
    let definition = write_definition("failed", FAILS_SECOND);
    let definition_arg = definition.to_string_lossy().to_string();

    let stdout = stdout_of(&cli(
        &db,
        &["run", "--definition", &definition_arg, "--owner", "alice"],
    ));
    assert!(stdout.contains("status=failed"), "{stdout}");
    assert!(stdout.contains("steps_succeeded=1"), "{stdout}");
    assert!(stdout.contains("steps_failed=1"), "{stdout}");
    assert!(stdout.contains("steps_cancelled=1"), "{stdout}");
}

#[test]
fn stop_requires_owner_or_privilege() {
    let db = temp_path("stop", "sqlite3");
    let definition = write_definition("stop", THREE_STEPS);
    let definition_arg = definition.to_string_lossy().to_string();

    let stdout = stdout_of(&cli(
        &db,
        &["run", "--definition", &definition_arg, "--owner", "alice"],
    ));
    let run_id = extract_run_id(&stdout)
        .unwrap_or_else(|| panic!("missing run_id in {stdout}"))
        .to_string();

    let denied = cli(
        &db,
        &["stop", "--run-id", &run_id, "--requester", "mallory"],
    );
    assert!(!denied.status.success());

    let privileged = stdout_of(&cli(
        &db,
        &[
            "stop",
            "--run-id",
            &run_id,
            "--requester",
            "ops",
            "--privileged-actor",
            "ops",
        ],
    ));
    assert!(privileged.contains("already_finished=true"), "{privileged}");
    assert!(privileged.contains("status=completed"), "{privileged}");

    let owner = stdout_of(&cli(
        &db,
        &["stop", "--run-id", &run_id, "--requester", "alice"],
    ));
    assert!(owner.contains("already_finished=true"), "{owner}");
    assert!(owner.contains("cancelled_steps=0"), "{owner}");
}

#[test]
fn unknown_and_malformed_run_ids_fail() {
    let db = temp_path("unknown", "sqlite3");

    let malformed = cli(&db, &["status", "--run-id", "not-a-ulid"]);
    assert!(!malformed.status.success());
    assert!(String::from_utf8_lossy(&malformed.stderr).contains("invalid run_id ULID"));

    let unknown = Ulid::new().to_string();
    assert!(!cli(&db, &["status", "--run-id", &unknown]).status.success());
    assert!(!cli(&db, &["verify", "--run-id", &unknown]).status.success());
}

#[test]
fn recover_on_clean_store_finds_nothing() {
    let db = temp_path("recover", "sqlite3");
    let stdout = stdout_of(&cli(&db, &["recover"]));
    assert_eq!(stdout.trim(), "recovered=0");
}

#[test]
fn invalid_definition_is_rejected_before_persisting() {
    let db = temp_path("invalid", "sqlite3");
    let definition = write_definition(
        "invalid",
        "automation_name: empty\nautomation_version: \"1\"\nsteps: []\n",
    );
    let definition_arg = definition.to_string_lossy().to_string();

    let output = cli(
        &db,
        &["run", "--definition", &definition_arg, "--owner", "alice"],
    );
    assert!(!output.status.success());
}

#[test]
fn recover_help_warns_about_other_processes() {
    let db = temp_path("recover-help", "sqlite3");
    let help = stdout_of(&cli(&db, &["recover", "--help"]));
    let flowed = help.split_whitespace().collect::<Vec<_>>().join(" ");
    assert!(
        flowed.contains("while another automation-center process is still driving runs"),
        "{help}"
    );
}
