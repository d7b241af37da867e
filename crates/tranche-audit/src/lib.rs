//! tranche-audit
//!
//! Append-only JSONL journal for administrative ledger changes (repairs,
//! cancellations). One entry per line, keys sorted, optional SHA-256 hash
//! chain so any edit or deletion of an earlier line is detectable.
//!
//! Entries carry the before/after values needed to reverse a change by hand.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Derived from chain position and payload; no RNG.
    pub entry_id: Uuid,
    /// 0-based position in the file.
    pub seq: u64,
    /// Groups entries written by one batch (one scan/repair run).
    pub batch_id: Uuid,
    pub ts_utc: DateTime<Utc>,
    /// What happened, e.g. `repair_applied`.
    pub kind: String,
    /// What it happened to, e.g. an issue id or `order:42`.
    pub subject: String,
    pub payload: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

/// Appends entries to one journal file.
pub struct JournalWriter {
    path: PathBuf,
    hash_chain: bool,
    last_hash: Option<String>,
    seq: u64,
}

impl JournalWriter {
    /// Open `path` for appending, creating parent directories. If the file
    /// already has entries, the chain resumes from its last line.
    pub fn open(path: impl AsRef<Path>, hash_chain: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("create_dir_all {:?}", parent))?;
        }

        let (last_hash, seq) = match fs::read_to_string(&path) {
            Ok(content) => match content.lines().rev().find(|l| !l.trim().is_empty()) {
                Some(line) => {
                    let last: JournalEntry = serde_json::from_str(line.trim())
                        .with_context(|| format!("parse last journal entry in {:?}", path))?;
                    (last.hash_self, last.seq + 1)
                }
                None => (None, 0),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (None, 0),
            Err(e) => return Err(e).with_context(|| format!("read journal {:?}", path)),
        };

        Ok(Self {
            path,
            hash_chain,
            last_hash,
            seq,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_hash(&self) -> Option<&str> {
        self.last_hash.as_deref()
    }

    /// Number of entries in the file.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn append(
        &mut self,
        batch_id: Uuid,
        ts_utc: DateTime<Utc>,
        kind: &str,
        subject: &str,
        payload: Value,
    ) -> Result<JournalEntry> {
        let entry_id = derive_entry_id(self.last_hash.as_deref(), self.seq, &payload)?;

        let mut entry = JournalEntry {
            entry_id,
            seq: self.seq,
            batch_id,
            ts_utc,
            kind: kind.to_string(),
            subject: subject.to_string(),
            payload,
            hash_prev: None,
            hash_self: None,
        };

        if self.hash_chain {
            entry.hash_prev = self.last_hash.clone();
            entry.hash_self = Some(compute_entry_hash(&entry)?);
        }

        let line = canonical_json_line(&entry)?;
        append_line(&self.path, &line)?;

        // Advance only once the line is on disk.
        self.seq += 1;
        if self.hash_chain {
            self.last_hash = entry.hash_self.clone();
        }
        Ok(entry)
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open journal {:?}", path))?;
    f.write_all(line.as_bytes())
        .and_then(|_| f.write_all(b"\n"))
        .context("write journal line failed")?;
    Ok(())
}

fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize journal entry failed")?;
    serde_json::to_string(&sort_keys(&raw)).context("json stringify failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), sort_keys(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

fn derive_entry_id(prev: Option<&str>, seq: u64, payload: &Value) -> Result<Uuid> {
    let mut hasher = Sha256::new();
    hasher.update(prev.unwrap_or("").as_bytes());
    hasher.update(seq.to_be_bytes());
    hasher.update(canonical_json_line(payload)?.as_bytes());
    let digest = hasher.finalize();
    Uuid::from_slice(&digest[..16]).context("derive entry id")
}

/// SHA-256 of the canonical entry with `hash_self` cleared.
pub fn compute_entry_hash(entry: &JournalEntry) -> Result<String> {
    let mut clone = entry.clone();
    clone.hash_self = None;
    let canonical = canonical_json_line(&clone)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { entries: usize },
    Broken { line: usize, reason: String },
}

impl VerifyResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, VerifyResult::Valid { .. })
    }
}

pub fn verify_journal(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read journal {:?}", path.as_ref()))?;
    verify_journal_str(&content)
}

/// Checks, per line: parseable, `seq` contiguous from 0, `hash_prev` equal to
/// the previous `hash_self`, and `hash_self` matching the content.
pub fn verify_journal_str(content: &str) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;
    let mut expected_seq = 0u64;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let entry: JournalEntry = serde_json::from_str(trimmed)
            .with_context(|| format!("parse journal entry at line {}", i + 1))?;

        if entry.seq != expected_seq {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!("seq gap: expected {expected_seq}, got {}", entry.seq),
            });
        }
        if entry.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!(
                    "hash_prev mismatch: expected {:?}, got {:?}",
                    prev_hash, entry.hash_prev
                ),
            });
        }
        if let Some(claimed) = &entry.hash_self {
            let recomputed = compute_entry_hash(&entry)?;
            if *claimed != recomputed {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: format!("hash_self mismatch: claimed {claimed}, recomputed {recomputed}"),
                });
            }
        }

        prev_hash = entry.hash_self;
        expected_seq += 1;
    }

    Ok(VerifyResult::Valid {
        entries: expected_seq as usize,
    })
}

/// All entries in file order.
pub fn read_journal(path: impl AsRef<Path>) -> Result<Vec<JournalEntry>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read journal {:?}", path.as_ref()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| {
            serde_json::from_str(l.trim())
                .with_context(|| format!("parse journal entry at line {}", i + 1))
        })
        .collect()
}
