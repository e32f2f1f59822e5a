use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::Result;

/// Writes per-test grades as a JSON object keyed by test title.
pub async fn write_results(path: &Path, grades: &BTreeMap<String, u32>) -> Result<()> {
    let json = serde_json::to_string_pretty(grades)?;
    tokio::fs::write(path, json).await?;
    debug!(path = %path.display(), tests = grades.len(), "results written");
    Ok(())
}
