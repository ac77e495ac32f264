//! Audit log append / rotation / read-back.
//!
//! # Invariants under test
//!
//! 1. Each append produces exactly one JSON line with the documented keys.
//! 2. Once the live file exceeds `max_bytes`, the next append rotates it to
//!    `.1` and shifts older generations; at most `generations` files are kept.
//! 3. Reads merge rotated files and the live file newest-first.
//! 4. Concurrent writers never interleave partial lines.

use std::sync::Arc;

use psr_audit::{AuditAction, AuditEntry, AuditLog, AuditQuery};

fn log_in(dir: &tempfile::TempDir, max_bytes: u64, generations: usize) -> AuditLog {
    AuditLog::new(dir.path().join("sensor_audit.jsonl"), max_bytes, generations).unwrap()
}

#[test]
fn append_writes_one_json_line_per_entry() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(&dir, 1024 * 1024, 5);

    log.append(
        &AuditEntry::new(AuditAction::Updated, "vacant -> occupied")
            .sensor("75E1CA81")
            .collector("30E5CA81")
            .raw_hex("00112233440181CAE53081CAE175")
            .parsed(serde_json::json!({"occupied": true})),
    )
    .unwrap();
    log.append(&AuditEntry::new(AuditAction::Error, "short frame")).unwrap();

    let content = std::fs::read_to_string(log.path()).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);

    let v: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    for key in ["timestamp", "wpsd_id", "wdc_id", "action", "raw_hex", "parsed_data", "message"] {
        assert!(v.get(key).is_some(), "missing key {key}");
    }
    assert_eq!(v["action"], "updated");
    assert_eq!(v["wpsd_id"], "75E1CA81");

    let v: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert!(v["wpsd_id"].is_null());
}

#[test]
fn rotation_shifts_generations_and_drops_oldest() {
    let dir = tempfile::tempdir().unwrap();
    // Tiny limit: every append after the first line rotates.
    let log = log_in(&dir, 10, 3);

    for i in 0..6 {
        log.append(&AuditEntry::new(AuditAction::Received, format!("e{i}")))
            .unwrap();
    }

    assert!(log.path().exists());
    for n in 1..=3 {
        assert!(log.rotated_path(n).exists(), "generation {n} missing");
    }
    assert!(!log.rotated_path(4).exists(), "only 3 generations are kept");

    let page = log.query(&AuditQuery::default()).unwrap();
    let msgs: Vec<_> = page.entries.iter().map(|e| e.message.as_str()).collect();
    // live + 3 rotated = 4 surviving entries, newest first.
    assert_eq!(msgs, ["e5", "e4", "e3", "e2"]);
}

#[test]
fn no_rotation_below_limit() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(&dir, 1024 * 1024, 5);
    for i in 0..10 {
        log.append(&AuditEntry::new(AuditAction::Received, format!("e{i}")))
            .unwrap();
    }
    assert!(!log.rotated_path(1).exists());
    assert_eq!(log.query(&AuditQuery::default()).unwrap().total, 10);
}

#[test]
fn query_on_missing_log_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(&dir, 1024, 5);
    let page = log.query(&AuditQuery::tail(10)).unwrap();
    assert_eq!(page.total, 0);
    assert!(page.entries.is_empty());
}

#[test]
fn malformed_lines_are_skipped_on_read() {
    let dir = tempfile::tempdir().unwrap();
    let log = log_in(&dir, 1024 * 1024, 5);
    log.append(&AuditEntry::new(AuditAction::Received, "ok")).unwrap();
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap();
        writeln!(f, "{{not json").unwrap();
    }
    log.append(&AuditEntry::new(AuditAction::Received, "ok2")).unwrap();

    let page = log.query(&AuditQuery::default()).unwrap();
    assert_eq!(page.total, 2);
}

#[test]
fn concurrent_writers_produce_whole_lines() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(log_in(&dir, 4096, 5));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                for i in 0..25 {
                    log.append(
                        &AuditEntry::new(AuditAction::Received, format!("t{t}-{i}"))
                            .sensor(format!("{t:08X}")),
                    )
                    .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    // Every surviving line parses; nothing was torn.
    let mut files = vec![log.path().to_path_buf()];
    files.extend((1..=5).map(|n| log.rotated_path(n)));
    for f in files.into_iter().filter(|f| f.exists()) {
        for line in std::fs::read_to_string(&f).unwrap().lines() {
            serde_json::from_str::<AuditEntry>(line).unwrap();
        }
    }
}
