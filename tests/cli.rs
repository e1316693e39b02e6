use assert_cmd::Command;
use predicates::prelude::*;

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("rucio-workflow").unwrap();
    // keep the host environment from leaking into settings
    for var in [
        "RUST_LOG",
        "RUCIO_WORKFLOW_CONFIG",
        "RUCIO_RUCIO_HOST",
        "RUCIO_AUTH_HOST",
        "RUCIO_AUTH_TYPE",
        "RUCIO_ACCOUNT",
        "RUCIO_AUTH_TOKEN",
        "RUCIO_REQUEST_TIMEOUT",
        "RUCIO_MAX_RETRIES",
        "RUCIO_DEFAULT_RSE",
        "RUCIO_DEFAULT_SCOPE",
        "RUCIO_BATCH_SIZE",
        "RUCIO_ENABLE_DETAILED_LOGGING",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn runs() {
    cli()
        .assert()
        .success()
        .stdout(predicate::str::contains("rucio-workflow 0.1.0"))
        .stdout(predicate::str::contains("--help"));
}

#[test]
fn outputs_tool_name() {
    cli()
        .arg("-V")
        .assert()
        .success()
        .stdout("rucio-workflow 0.1.0\n");
}

// execute-workflow

#[test]
fn dry_run_workflow_succeeds() {
    cli()
        .args([
            "--dry-run",
            "execute-workflow",
            "user.test.workflow_dataset",
            "--rse",
            "TEST_DISK",
            "--file-list",
            "tests/fixtures/files.json",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Workflow SUCCESS"))
        .stdout(predicate::str::contains("files registered:       2"))
        .stdout(predicate::str::contains("dataset closed:         yes"));
}

#[test]
fn dry_run_workflow_json_output() {
    let output = cli()
        .args([
            "--dry-run",
            "execute-workflow",
            "user.test:workflow_dataset",
            "--rse",
            "TEST_DISK",
            "--file-list",
            "tests/fixtures/files.json",
            "--batch-size",
            "1",
            "--output",
            "json",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["files_added_to_dataset"], 2);
    assert_eq!(json["stage"], "done");
    assert_eq!(json["dataset"]["scope"], "user.test");
}

#[test]
fn workflow_reads_file_list_from_stdin() {
    let files = std::fs::read_to_string("tests/fixtures/files.json").unwrap();
    cli()
        .args([
            "--dry-run",
            "execute-workflow",
            "user.test.stdin_dataset",
            "--rse",
            "TEST_DISK",
            "--file-list",
            "-",
        ])
        .write_stdin(files)
        .assert()
        .success()
        .stdout(predicate::str::contains("Workflow SUCCESS"));
}

#[test]
fn workflow_with_invalid_files_fails() {
    cli()
        .args([
            "--dry-run",
            "execute-workflow",
            "user.test.workflow_dataset",
            "--rse",
            "TEST_DISK",
            "--file-list",
            "tests/fixtures/invalid_files.json",
        ])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Workflow FAILED"))
        .stderr(predicate::str::contains("Failed to register files"));
}

#[test]
fn workflow_rejects_malformed_dataset_name() {
    cli()
        .args([
            "--dry-run",
            "execute-workflow",
            "nodots",
            "--file-list",
            "tests/fixtures/files.json",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Validation error"));
}

#[test]
fn workflow_reports_missing_file_list() {
    cli()
        .args([
            "--dry-run",
            "execute-workflow",
            "user.test.ds",
            "--file-list",
            "tests/fixtures/does_not_exist.json",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("IO error"));
}

// dataset commands

#[test]
fn create_dataset_prints_name() {
    cli()
        .args([
            "--dry-run",
            "create-dataset",
            "user.test.new_dataset",
            "--metadata",
            r#"{"campaign": "mc23"}"#,
            "--lifetime",
            "7",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Dataset created successfully: user.test:new_dataset",
        ));
}

#[test]
fn create_dataset_rejects_bad_metadata() {
    cli()
        .args([
            "--dry-run",
            "create-dataset",
            "user.test.new_dataset",
            "--metadata",
            "{not json",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid metadata JSON"));
}

#[test]
fn list_missing_dataset_fails() {
    cli()
        .args(["--dry-run", "list-dataset", "user.test.absent"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Dataset not found"));
}

#[test]
fn attach_to_missing_dataset_fails() {
    cli()
        .args([
            "--dry-run",
            "attach-files",
            "user.test.absent",
            "--file-list",
            "tests/fixtures/attach.json",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Dataset not found"));
}

#[test]
fn verify_fails_on_empty_catalog() {
    cli()
        .args([
            "--dry-run",
            "verify",
            "user.test.absent",
            "--expected-files",
            "2",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Verification failed"));
}

// register-files

#[test]
fn register_files_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.root"), b"first file").unwrap();
    std::fs::create_dir(dir.path().join("nested")).unwrap();
    std::fs::write(dir.path().join("nested").join("b.root"), b"second").unwrap();

    cli()
        .args(["--dry-run", "register-files", "--rse", "LOCAL_DISK", "--from-dir"])
        .arg(dir.path())
        .args(["--scope", "user.local"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Registered 2/2 files at LOCAL_DISK"))
        .stdout(predicate::str::contains("a.root"))
        .stdout(predicate::str::contains("b.root"));
}

#[test]
fn register_files_needs_a_source() {
    cli()
        .args(["--dry-run", "register-files", "--rse", "LOCAL_DISK"])
        .assert()
        .failure();
}

#[test]
fn register_files_sources_are_exclusive() {
    cli()
        .args([
            "--dry-run",
            "register-files",
            "--file-list",
            "tests/fixtures/files.json",
            "--pfn",
            "/data/x.root",
        ])
        .assert()
        .failure();
}

// config

#[test]
fn config_shows_defaults() {
    cli()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("voatlasrucio-server-prod.cern.ch"));
}

#[test]
fn config_validate_passes_with_defaults() {
    cli()
        .args(["config", "--validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 error(s)"));
}

#[test]
fn config_validate_fails_on_zero_batch_size() {
    cli()
        .args(["config", "--validate"])
        .env("RUCIO_BATCH_SIZE", "0")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

#[test]
fn config_file_is_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.yaml");
    std::fs::write(
        &path,
        "catalog:\n  account: alice\nworkflow:\n  default_rse: ALICE_DISK\n",
    )
    .unwrap();

    cli()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("alice"))
        .stdout(predicate::str::contains("ALICE_DISK"));
}

#[test]
fn env_overrides_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.yaml");
    std::fs::write(&path, "catalog:\n  account: alice\n").unwrap();

    cli()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .env("RUCIO_ACCOUNT", "bob")
        .assert()
        .success()
        .stdout(predicate::str::contains("bob"))
        .stdout(predicate::str::contains("alice").not());
}

#[test]
fn config_does_not_open_a_catalog() {
    cli()
        .arg("config")
        .env("RUCIO_RUCIO_HOST", "not a url")
        .assert()
        .success()
        .stdout(predicate::str::contains("not a url"));
}

#[test]
fn catalog_commands_reject_invalid_host() {
    cli()
        .args(["close-dataset", "user.test.ds"])
        .env("RUCIO_RUCIO_HOST", "not a url")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid catalog URL"));
}

#[test]
fn catalog_commands_reject_unknown_auth_type() {
    cli()
        .args(["close-dataset", "user.test.ds"])
        .env("RUCIO_AUTH_TYPE", "kerberos")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown auth type 'kerberos'"));
}
