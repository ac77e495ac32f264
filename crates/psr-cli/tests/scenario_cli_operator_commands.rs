use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::path::Path;
use std::process::Command;

/// Command bound to a private store + audit log under `dir`.
fn psr(dir: &Path) -> Command {
    let cfg = dir.join("psr.yaml");
    if !cfg.exists() {
        std::fs::write(
            &cfg,
            format!(
                "audit:\n  path: \"{}\"\n",
                dir.join("logs/sensor_audit.jsonl").display()
            ),
        )
        .unwrap();
    }

    let mut cmd = Command::cargo_bin("psr").unwrap();
    cmd.current_dir(dir)
        .env(psr_config::ENV_CONFIG_PATHS, &cfg)
        .env(
            psr_config::ENV_DB_URL,
            format!("sqlite://{}", dir.join("parking.db").display()),
        );
    cmd
}

#[test]
fn frame_decode_prints_byte_swapped_ids() {
    let dir = tempfile::tempdir().unwrap();
    psr(dir.path())
        .args(["frame", "decode", "00112233440181CAE53081CAE175"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"sensor_external_id\": \"75E1CA81\""))
        .stdout(predicate::str::contains("\"collector_id\": \"30E5CA81\""))
        .stdout(predicate::str::contains("\"occupied\": true"));
}

#[test]
fn frame_decode_rejects_short_frame() {
    let dir = tempfile::tempdir().unwrap();
    psr(dir.path())
        .args(["frame", "decode", "0011223344"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("short_frame"));
}

#[test]
fn audit_query_on_empty_log() {
    let dir = tempfile::tempdir().unwrap();
    psr(dir.path())
        .args(["audit", "query", "--tail", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("total=0"));

    psr(dir.path())
        .args(["audit", "query", "--action", "bogus"])
        .assert()
        .failure();
}

#[test]
fn provision_then_status_and_sweep() {
    let dir = tempfile::tempdir().unwrap();

    psr(dir.path())
        .args(["db", "migrate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("migrations_applied=true"));

    psr(dir.path())
        .args(["sensor", "add", "--external-id", "75e1ca81", "--collector-id", "30E5CA81"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sensor_id=1"))
        .stdout(predicate::str::contains("external_id=75E1CA81"));

    psr(dir.path())
        .args(["space", "add", "--sensor-id", "1", "--actor", "admin:ops"])
        .assert()
        .success()
        .stdout(predicate::str::contains("status=vacant"));

    psr(dir.path())
        .args(["sensor", "add", "--external-id", "DEADBEEF", "--actor", "nobody"])
        .assert()
        .failure();

    psr(dir.path())
        .args(["db", "diag"])
        .assert()
        .success()
        .stdout(predicate::str::contains("schema_version=1"))
        .stdout(predicate::str::contains("sensors_live=1"))
        .stdout(predicate::str::contains("spaces_vacant=1"));

    psr(dir.path())
        .args(["sweep", "once"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"inspected\":0"));
}
