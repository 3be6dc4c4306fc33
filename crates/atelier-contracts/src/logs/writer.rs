use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::jst;

pub type LogPayload = Map<String, Value>;

/// Whether `generate`/`edit` records carry the full prompt text in addition
/// to its hash.
pub const INCLUDE_FULL_PROMPT_IN_LOG: bool = true;

/// Append-only writer for the per-application usage log
/// (`<data_dir>/logs/<app>.log.jsonl`).
///
/// Every record gets `ts` (RFC 3339, UTC+9), `app`, `page`, and `action`
/// before the caller payload is merged; the payload is merged last and can
/// override the defaults. One compact JSON object per line.
#[derive(Debug, Clone)]
pub struct UsageLogger {
    inner: Arc<UsageLoggerInner>,
}

#[derive(Debug)]
struct UsageLoggerInner {
    path: PathBuf,
    app: String,
    page: String,
    lock: Mutex<()>,
}

impl UsageLogger {
    pub fn new(data_dir: &Path, app: impl Into<String>, page: impl Into<String>) -> Self {
        let app = app.into();
        let path = data_dir.join("logs").join(format!("{app}.log.jsonl"));
        Self::with_path(path, app, page)
    }

    pub fn with_path(
        path: impl Into<PathBuf>,
        app: impl Into<String>,
        page: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(UsageLoggerInner {
                path: path.into(),
                app: app.into(),
                page: page.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn append(&self, action: &str, payload: LogPayload) -> anyhow::Result<Value> {
        let mut record = Map::new();
        record.insert("ts".to_string(), Value::String(now_jst_iso()));
        record.insert("app".to_string(), Value::String(self.inner.app.clone()));
        record.insert("page".to_string(), Value::String(self.inner.page.clone()));
        record.insert("action".to_string(), Value::String(action.to_string()));
        for (key, value) in payload {
            record.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&record)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("usage logger lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(record))
    }
}

/// Deterministic 16-hex-character prefix of the SHA-256 digest, used so
/// prompts can be correlated across log lines without storing full text.
pub fn sha256_short(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn now_jst_iso() -> String {
    Utc::now()
        .with_timezone(&jst())
        .to_rfc3339_opts(SecondsFormat::Micros, false)
}
