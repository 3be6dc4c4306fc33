use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_json::{Map, Value};

use super::{jst, ANONYMOUS_USER};

/// Actions that count toward the image-usage pivots.
const COUNTED_ACTIONS: [&str; 2] = ["generate", "edit"];

/// One parsed log line with its derived date and month bucket.
#[derive(Debug, Clone)]
pub struct LogRow {
    pub ts: Option<DateTime<FixedOffset>>,
    pub date: Option<NaiveDate>,
    pub month: Option<String>,
    pub user: String,
    pub action: String,
    pub raw: Map<String, Value>,
}

impl LogRow {
    fn from_record(record: Map<String, Value>) -> Self {
        let ts = record
            .get("ts")
            .and_then(Value::as_str)
            .and_then(super::parse_ts);
        let user = record
            .get("user")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .unwrap_or(ANONYMOUS_USER)
            .to_string();
        let action = record
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            date: ts.map(|ts| ts.with_timezone(&jst()).date_naive()),
            month: ts.map(|ts| ts.with_timezone(&jst()).format("%Y-%m").to_string()),
            ts,
            user,
            action,
            raw: record,
        }
    }
}

/// Headline counters over a (filtered) table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub generate_count: usize,
    pub edit_count: usize,
    pub unique_users: usize,
}

/// A 2-D count pivot: one labelled row per index key, zero-filled columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pivot {
    pub index_name: String,
    pub columns: Vec<String>,
    pub rows: Vec<PivotRow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotRow {
    pub key: String,
    pub values: Vec<u64>,
}

impl Pivot {
    pub fn value(&self, key: &str, column: &str) -> Option<u64> {
        let col = self.columns.iter().position(|name| name == column)?;
        self.rows
            .iter()
            .find(|row| row.key == key)
            .and_then(|row| row.values.get(col).copied())
    }

    /// Restricts the pivot to the given row keys, preserving order.
    pub fn select_rows(&self, keys: &BTreeSet<String>) -> Pivot {
        Pivot {
            index_name: self.index_name.clone(),
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .filter(|row| keys.contains(&row.key))
                .cloned()
                .collect(),
        }
    }

    /// Delimited export with a byte-order mark for spreadsheet compatibility.
    pub fn to_csv(&self) -> String {
        let mut out = String::from("\u{feff}");
        out.push_str(&csv_field(&self.index_name));
        for column in &self.columns {
            out.push(',');
            out.push_str(&csv_field(column));
        }
        out.push('\n');
        for row in &self.rows {
            out.push_str(&csv_field(&row.key));
            for value in &row.values {
                out.push(',');
                out.push_str(&value.to_string());
            }
            out.push('\n');
        }
        out
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// The usage log loaded into rows, the read-side counterpart of
/// [`super::writer::UsageLogger`].
#[derive(Debug, Clone, Default)]
pub struct LogTable {
    pub rows: Vec<LogRow>,
}

impl LogTable {
    /// A missing file yields an empty table; lines that fail to parse as a
    /// JSON object are skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => return Err(err.into()),
        };
        let rows = raw
            .lines()
            .filter_map(|line| {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return None;
                }
                serde_json::from_str::<Map<String, Value>>(trimmed).ok()
            })
            .map(LogRow::from_record)
            .collect();
        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Inclusive date-range filter on the derived date plus a set-membership
    /// filter on user. Rows without a derived date fail any date bound.
    pub fn filter(
        &self,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
        users: Option<&BTreeSet<String>>,
    ) -> LogTable {
        let rows = self
            .rows
            .iter()
            .filter(|row| {
                if let Some(from) = date_from {
                    if row.date.map(|date| date >= from) != Some(true) {
                        return false;
                    }
                }
                if let Some(to) = date_to {
                    if row.date.map(|date| date <= to) != Some(true) {
                        return false;
                    }
                }
                if let Some(users) = users {
                    if !users.contains(&row.user) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();
        LogTable { rows }
    }

    pub fn users(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.rows.iter().map(|row| row.user.as_str()).collect();
        set.into_iter().map(str::to_string).collect()
    }

    pub fn months(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self
            .rows
            .iter()
            .filter_map(|row| row.month.as_deref())
            .collect();
        set.into_iter().map(str::to_string).collect()
    }

    pub fn date_range(&self) -> Option<(NaiveDate, NaiveDate)> {
        let mut dates = self.rows.iter().filter_map(|row| row.date);
        let first = dates.next()?;
        let (min, max) = dates.fold((first, first), |(min, max), date| {
            (min.min(date), max.max(date))
        });
        Some((min, max))
    }

    pub fn summary(&self) -> Summary {
        Summary {
            generate_count: self
                .rows
                .iter()
                .filter(|row| row.action == "generate")
                .count(),
            edit_count: self.rows.iter().filter(|row| row.action == "edit").count(),
            unique_users: self.users().len(),
        }
    }

    fn counted_rows(&self) -> impl Iterator<Item = &LogRow> {
        self.rows
            .iter()
            .filter(|row| COUNTED_ACTIONS.contains(&row.action.as_str()))
    }

    /// Rows = users, columns = `generate`, `edit`, `total`, sorted by total
    /// descending (ties by user name).
    pub fn user_action_pivot(&self) -> Pivot {
        let mut counts: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for row in self.counted_rows() {
            let entry = counts.entry(row.user.clone()).or_default();
            if row.action == "generate" {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        }
        let mut rows: Vec<PivotRow> = counts
            .into_iter()
            .map(|(user, (gen, edit))| PivotRow {
                key: user,
                values: vec![gen, edit, gen + edit],
            })
            .collect();
        rows.sort_by(|a, b| b.values[2].cmp(&a.values[2]).then(a.key.cmp(&b.key)));
        Pivot {
            index_name: "user".to_string(),
            columns: vec![
                "generate".to_string(),
                "edit".to_string(),
                "total".to_string(),
            ],
            rows,
        }
    }

    /// Rows = month buckets in calendar order, columns as above.
    pub fn month_action_pivot(&self) -> Pivot {
        let mut counts: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for row in self.counted_rows() {
            let Some(month) = row.month.clone() else {
                continue;
            };
            let entry = counts.entry(month).or_default();
            if row.action == "generate" {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        }
        let rows = counts
            .into_iter()
            .map(|(month, (gen, edit))| PivotRow {
                key: month,
                values: vec![gen, edit, gen + edit],
            })
            .collect();
        Pivot {
            index_name: "month".to_string(),
            columns: vec![
                "generate".to_string(),
                "edit".to_string(),
                "total".to_string(),
            ],
            rows,
        }
    }

    /// Rows = users, columns = every month seen in counted rows, values =
    /// counts of the given action (or of both when `action` is `None`).
    /// Missing user/month combinations are filled with 0.
    pub fn user_month_pivot(&self, action: Option<&str>) -> Pivot {
        let months: Vec<String> = {
            let set: BTreeSet<String> = self
                .counted_rows()
                .filter_map(|row| row.month.clone())
                .collect();
            set.into_iter().collect()
        };
        let users: BTreeSet<String> = self.counted_rows().map(|row| row.user.clone()).collect();

        let mut counts: BTreeMap<(String, String), u64> = BTreeMap::new();
        for row in self.counted_rows() {
            if let Some(wanted) = action {
                if row.action != wanted {
                    continue;
                }
            }
            let Some(month) = row.month.clone() else {
                continue;
            };
            *counts.entry((row.user.clone(), month)).or_default() += 1;
        }

        let rows = users
            .into_iter()
            .map(|user| {
                let values = months
                    .iter()
                    .map(|month| {
                        counts
                            .get(&(user.clone(), month.clone()))
                            .copied()
                            .unwrap_or(0)
                    })
                    .collect();
                PivotRow { key: user, values }
            })
            .collect();
        Pivot {
            index_name: "user".to_string(),
            columns: months,
            rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_log(lines: &[&str]) -> Result<(tempfile::TempDir, std::path::PathBuf)> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("atelier.log.jsonl");
        let mut file = std::fs::File::create(&path)?;
        for line in lines {
            writeln!(file, "{line}")?;
        }
        Ok((temp, path))
    }

    fn record(ts: &str, user: &str, action: &str) -> String {
        format!(r#"{{"ts":"{ts}","app":"atelier","page":"p","user":"{user}","action":"{action}"}}"#)
    }

    #[test]
    fn load_missing_file_yields_empty_table() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let table = LogTable::load(&temp.path().join("absent.jsonl"))?;
        assert!(table.is_empty());
        Ok(())
    }

    #[test]
    fn load_skips_unparseable_lines_and_defaults_missing_users() -> Result<()> {
        let (_temp, path) = write_log(&[
            &record("2026-03-01T10:00:00+09:00", "alice", "generate"),
            "this is not json",
            r#"{"ts":"2026-03-01T11:00:00+09:00","action":"edit"}"#,
            r#"{"ts":"garbage","user":"bob","action":"generate"}"#,
        ])?;
        let table = LogTable::load(&path)?;
        assert_eq!(table.len(), 3);
        assert_eq!(table.rows[1].user, ANONYMOUS_USER);
        assert_eq!(table.rows[2].month, None);
        assert_eq!(table.rows[0].month.as_deref(), Some("2026-03"));
        Ok(())
    }

    #[test]
    fn filter_applies_inclusive_date_range_and_user_set() -> Result<()> {
        let (_temp, path) = write_log(&[
            &record("2026-03-01T10:00:00+09:00", "alice", "generate"),
            &record("2026-03-02T10:00:00+09:00", "bob", "generate"),
            &record("2026-03-03T10:00:00+09:00", "alice", "edit"),
        ])?;
        let table = LogTable::load(&path)?;

        let from = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let filtered = table.filter(Some(from), Some(to), None);
        assert_eq!(filtered.len(), 2);

        let users: BTreeSet<String> = ["alice".to_string()].into();
        let filtered = table.filter(None, None, Some(&users));
        assert_eq!(filtered.len(), 2);
        assert!(filtered.rows.iter().all(|row| row.user == "alice"));
        Ok(())
    }

    #[test]
    fn summary_counts_actions_and_distinct_users() -> Result<()> {
        let (_temp, path) = write_log(&[
            &record("2026-03-01T10:00:00+09:00", "alice", "generate"),
            &record("2026-03-01T11:00:00+09:00", "alice", "edit"),
            &record("2026-03-01T12:00:00+09:00", "bob", "upload_loaded"),
            &record("2026-03-01T13:00:00+09:00", "bob", "generate"),
        ])?;
        let summary = LogTable::load(&path)?.summary();
        assert_eq!(summary.generate_count, 2);
        assert_eq!(summary.edit_count, 1);
        assert_eq!(summary.unique_users, 2);
        Ok(())
    }

    #[test]
    fn user_pivot_fills_missing_actions_and_sorts_by_total() -> Result<()> {
        let (_temp, path) = write_log(&[
            &record("2026-03-01T10:00:00+09:00", "alice", "generate"),
            &record("2026-03-01T11:00:00+09:00", "bob", "edit"),
            &record("2026-03-01T12:00:00+09:00", "bob", "edit"),
            &record("2026-03-01T13:00:00+09:00", "bob", "reset"),
        ])?;
        let pivot = LogTable::load(&path)?.user_action_pivot();
        assert_eq!(pivot.rows[0].key, "bob");
        assert_eq!(pivot.value("bob", "generate"), Some(0));
        assert_eq!(pivot.value("bob", "edit"), Some(2));
        assert_eq!(pivot.value("bob", "total"), Some(2));
        assert_eq!(pivot.value("alice", "total"), Some(1));
        Ok(())
    }

    #[test]
    fn user_month_pivot_matches_per_action_counts() -> Result<()> {
        // 3 generates and 2 edits for alice in 2026-03, 1 generate in 2026-04.
        let (_temp, path) = write_log(&[
            &record("2026-03-01T10:00:00+09:00", "alice", "generate"),
            &record("2026-03-02T10:00:00+09:00", "alice", "generate"),
            &record("2026-03-03T10:00:00+09:00", "alice", "generate"),
            &record("2026-03-04T10:00:00+09:00", "alice", "edit"),
            &record("2026-03-05T10:00:00+09:00", "alice", "edit"),
            &record("2026-04-01T10:00:00+09:00", "alice", "generate"),
            &record("2026-04-02T10:00:00+09:00", "bob", "edit"),
        ])?;
        let table = LogTable::load(&path)?;

        let total = table.user_month_pivot(None);
        let gen = table.user_month_pivot(Some("generate"));
        let edit = table.user_month_pivot(Some("edit"));

        assert_eq!(total.value("alice", "2026-03"), Some(5));
        assert_eq!(gen.value("alice", "2026-03"), Some(3));
        assert_eq!(edit.value("alice", "2026-03"), Some(2));
        // Zero-filled combinations exist for every user and month.
        assert_eq!(gen.value("bob", "2026-03"), Some(0));
        assert_eq!(gen.value("alice", "2026-04"), Some(1));

        // Summing the generate pivot across months equals the filtered total.
        let alice_row = gen.rows.iter().find(|row| row.key == "alice").unwrap();
        let alice_generates: u64 = alice_row.values.iter().sum();
        let users: BTreeSet<String> = ["alice".to_string()].into();
        let alice_summary = table.filter(None, None, Some(&users)).summary();
        assert_eq!(alice_generates as usize, alice_summary.generate_count);
        Ok(())
    }

    #[test]
    fn csv_export_has_bom_header_and_escaping() {
        let pivot = Pivot {
            index_name: "user".to_string(),
            columns: vec!["generate".to_string(), "edit".to_string()],
            rows: vec![PivotRow {
                key: "team, \"ops\"".to_string(),
                values: vec![3, 1],
            }],
        };
        let csv = pivot.to_csv();
        assert!(csv.starts_with('\u{feff}'));
        let mut lines = csv.trim_start_matches('\u{feff}').lines();
        assert_eq!(lines.next(), Some("user,generate,edit"));
        assert_eq!(lines.next(), Some("\"team, \"\"ops\"\"\",3,1"));
    }

    #[test]
    fn select_rows_keeps_only_requested_users() -> Result<()> {
        let (_temp, path) = write_log(&[
            &record("2026-03-01T10:00:00+09:00", "alice", "generate"),
            &record("2026-03-01T11:00:00+09:00", "bob", "generate"),
        ])?;
        let pivot = LogTable::load(&path)?.user_month_pivot(None);
        let picked: BTreeSet<String> = ["bob".to_string()].into();
        let selected = pivot.select_rows(&picked);
        assert_eq!(selected.rows.len(), 1);
        assert_eq!(selected.rows[0].key, "bob");
        Ok(())
    }
}
