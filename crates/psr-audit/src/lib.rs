//! psr-audit
//!
//! Append-only sensor audit trail. One JSON object per line:
//!
//! ```text
//! {"timestamp":..,"wpsd_id":..,"wdc_id":..,"action":..,"raw_hex":..,"parsed_data":..,"message":..}
//! ```
//!
//! Writers serialize on an exclusive advisory lock held on a sidecar
//! `<log>.lock` file, so rotation and append happen as one critical section
//! even across processes. Rotation keeps `generations` historical files
//! (`<log>.1` newest .. `<log>.N` oldest); the oldest is dropped.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

mod query;

pub use query::{AuditPage, AuditQuery};

/// Rotate once the live file exceeds this many bytes.
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Number of rotated files kept next to the live one.
pub const DEFAULT_GENERATIONS: usize = 5;

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Received,
    Updated,
    IgnoredReservation,
    IgnoredUnknown,
    Error,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Received => "received",
            AuditAction::Updated => "updated",
            AuditAction::IgnoredReservation => "ignored_reservation",
            AuditAction::IgnoredUnknown => "ignored_unknown",
            AuditAction::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "received" => Ok(AuditAction::Received),
            "updated" => Ok(AuditAction::Updated),
            "ignored_reservation" => Ok(AuditAction::IgnoredReservation),
            "ignored_unknown" => Ok(AuditAction::IgnoredUnknown),
            "error" => Ok(AuditAction::Error),
            other => Err(anyhow::anyhow!("invalid audit action: {}", other)),
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub wpsd_id: Option<String>,
    pub wdc_id: Option<String>,
    pub action: AuditAction,
    pub raw_hex: Option<String>,
    pub parsed_data: Option<Value>,
    pub message: String,
}

impl AuditEntry {
    pub fn new(action: AuditAction, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            wpsd_id: None,
            wdc_id: None,
            action,
            raw_hex: None,
            parsed_data: None,
            message: message.into(),
        }
    }

    pub fn sensor(mut self, wpsd_id: impl Into<String>) -> Self {
        self.wpsd_id = Some(wpsd_id.into());
        self
    }

    pub fn collector(mut self, wdc_id: impl Into<String>) -> Self {
        self.wdc_id = Some(wdc_id.into());
        self
    }

    pub fn raw_hex(mut self, raw_hex: impl Into<String>) -> Self {
        self.raw_hex = Some(raw_hex.into());
        self
    }

    pub fn parsed(mut self, parsed_data: Value) -> Self {
        self.parsed_data = Some(parsed_data);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

/// Handle to one rotating audit log. Stateless apart from its paths, so it
/// can be shared behind an `Arc` by every connection worker.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    lock_path: PathBuf,
    max_bytes: u64,
    generations: usize,
}

impl AuditLog {
    /// Creates the log handle and ensures parent dirs exist.
    pub fn new(path: impl AsRef<Path>, max_bytes: u64, generations: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create_dir_all {:?}", parent))?;
            }
        }
        let lock_path = with_suffix(&path, "lock");

        Ok(Self {
            path,
            lock_path,
            max_bytes,
            generations,
        })
    }

    pub fn with_defaults(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(path, DEFAULT_MAX_BYTES, DEFAULT_GENERATIONS)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of rotated generation `n` (1 = most recent).
    pub fn rotated_path(&self, n: usize) -> PathBuf {
        with_suffix(&self.path, &n.to_string())
    }

    /// Append one entry, rotating first if the live file is over the limit.
    pub fn append(&self, entry: &AuditEntry) -> Result<()> {
        let line = serde_json::to_string(entry).context("serialize audit entry failed")?;

        let lock = self.open_lock()?;
        lock.lock_exclusive()
            .with_context(|| format!("lock audit log {:?}", self.lock_path))?;

        let res = self.rotate_if_needed().and_then(|_| append_line(&self.path, &line));

        if let Err(e) = FileExt::unlock(&lock) {
            warn!(path = ?self.lock_path, error = %e, "audit unlock failed");
        }
        res
    }

    /// Read, filter and paginate across the live file and all rotated files.
    /// Results are newest-first.
    pub fn query(&self, q: &AuditQuery) -> Result<AuditPage> {
        let lock = self.open_lock()?;
        lock.lock_shared()
            .with_context(|| format!("lock audit log {:?}", self.lock_path))?;
        let entries = self.read_all_newest_first();
        if let Err(e) = FileExt::unlock(&lock) {
            warn!(path = ?self.lock_path, error = %e, "audit unlock failed");
        }
        Ok(q.apply(entries?))
    }

    fn open_lock(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .with_context(|| format!("open audit lock {:?}", self.lock_path))
    }

    fn rotate_if_needed(&self) -> Result<()> {
        let size = match fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("stat {:?}", self.path)),
        };
        if size <= self.max_bytes {
            return Ok(());
        }

        if self.generations == 0 {
            return remove_if_exists(&self.path);
        }

        remove_if_exists(&self.rotated_path(self.generations))?;
        for n in (1..self.generations).rev() {
            rename_if_exists(&self.rotated_path(n), &self.rotated_path(n + 1))?;
        }
        fs::rename(&self.path, self.rotated_path(1))
            .with_context(|| format!("rotate {:?}", self.path))?;
        Ok(())
    }

    /// Oldest generation first, live file last, then reversed.
    fn read_all_newest_first(&self) -> Result<Vec<AuditEntry>> {
        let mut files: Vec<PathBuf> = (1..=self.generations)
            .rev()
            .map(|n| self.rotated_path(n))
            .collect();
        files.push(self.path.clone());

        let mut out = Vec::new();
        for f in files {
            let content = match fs::read_to_string(&f) {
                Ok(c) => c,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("read audit log {:?}", f)),
            };
            for (i, line) in content.lines().enumerate() {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditEntry>(trimmed) {
                    Ok(ev) => out.push(ev),
                    Err(e) => warn!(file = ?f, line = i + 1, error = %e, "skipping malformed audit line"),
                }
            }
        }
        out.reverse();
        Ok(out)
    }
}

/// Write a single line to file (with trailing newline).
fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open audit log {:?}", path))?;
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    f.write_all(&buf).context("write audit line failed")?;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(".");
    s.push(suffix);
    PathBuf::from(s)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {:?}", path)),
    }
}

fn rename_if_exists(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("rename {:?} -> {:?}", from, to)),
    }
}
