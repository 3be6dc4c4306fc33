use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

use super::month_bucket;

/// The literal an operator must type before a purge runs. Deliberate
/// friction against accidental data loss, not a technical safeguard.
pub const PURGE_CONFIRMATION: &str = "DELETE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeOutcome {
    pub removed: usize,
    pub kept: usize,
    /// Parseable records whose timestamp could not be bucketed. They are
    /// always kept; the count is surfaced so the operator knows records may
    /// have escaped the selection.
    pub kept_unknown_bucket: usize,
    pub backup_path: PathBuf,
}

/// Physically removes every record whose year-month bucket is in `months`.
///
/// Lines that fail to parse as JSON are always kept verbatim, since their
/// bucket cannot be determined. The full pre-purge file is copied to a `.bak`
/// sibling before anything is rewritten, and the rewrite itself goes through
/// a temporary file plus atomic rename so the log is never left truncated.
pub fn purge(path: &Path, months: &BTreeSet<String>, confirm: &str) -> Result<PurgeOutcome> {
    if confirm != PURGE_CONFIRMATION {
        bail!("confirmation mismatch: type {PURGE_CONFIRMATION} to delete log records");
    }
    if months.is_empty() {
        bail!("no months selected");
    }

    let raw = std::fs::read(path)
        .with_context(|| format!("failed to read log file {}", path.display()))?;

    let mut kept_lines: Vec<&[u8]> = Vec::new();
    let mut removed = 0usize;
    let mut kept_unknown_bucket = 0usize;
    for line in raw.split(|byte| *byte == b'\n') {
        if line.iter().all(|byte| byte.is_ascii_whitespace()) {
            continue;
        }
        let parsed = std::str::from_utf8(line)
            .ok()
            .and_then(|text| serde_json::from_str::<Map<String, Value>>(text.trim()).ok());
        let Some(record) = parsed else {
            // Bucket unknown, keep the raw bytes untouched.
            kept_lines.push(line);
            continue;
        };
        let bucket = record
            .get("ts")
            .and_then(Value::as_str)
            .and_then(month_bucket);
        match bucket {
            Some(month) if months.contains(&month) => removed += 1,
            Some(_) => kept_lines.push(line),
            None => {
                kept_unknown_bucket += 1;
                kept_lines.push(line);
            }
        }
    }

    let backup_path = sibling(path, ".bak");
    std::fs::write(&backup_path, &raw)
        .with_context(|| format!("failed to write backup {}", backup_path.display()))?;

    let tmp_path = sibling(path, ".tmp");
    let mut out = Vec::with_capacity(raw.len());
    for line in &kept_lines {
        out.extend_from_slice(line);
        out.push(b'\n');
    }
    std::fs::write(&tmp_path, out)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;

    Ok(PurgeOutcome {
        removed,
        kept: kept_lines.len(),
        kept_unknown_bucket,
        backup_path,
    })
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{name}{suffix}"))
}
