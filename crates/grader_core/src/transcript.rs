use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::Result;

/// JSON-lines log of every command sent to and record received from GDB.
#[derive(Debug)]
pub struct Transcript {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl Transcript {
    pub async fn create(dir: &Path, pid: u32) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        let ts = timestamp_millis();
        let path = dir.join(format!("gdb-{pid}-{ts}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn log(&self, direction: &str, payload: &Value) -> Result<()> {
        let envelope = json!({
            "ts_ms": timestamp_millis(),
            "direction": direction,
            "kind": classify(payload),
            "payload": payload,
        });
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

fn classify(payload: &Value) -> &str {
    match payload.get("type").and_then(Value::as_str) {
        Some("command") => "command",
        Some("result") => "result",
        Some("notification") => "notification",
        Some("stream") => "stream",
        Some("error") => "error",
        _ => "other",
    }
}

pub(crate) fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
