/// Tool-call buffer — the per-session ring of in-flight calls.
///
/// `on-tool` appends one JSONL line per call; `on-stop` drains the whole file
/// and hands the batch to the grouper. The host serializes hooks for a
/// session, so there is exactly one writer at any instant and no locking.
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Paths;

// ── Buffered call ─────────────────────────────────────────────────────────────

/// One raw tool invocation as reported by the host, unsummarized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedCall {
    pub tool_name: String,
    pub tool_input: Value,
    /// Millisecond epoch at append time.
    pub ts: i64,
}

// ── Append / drain ────────────────────────────────────────────────────────────

pub fn buffer_path(paths: &Paths, session_id: &str) -> PathBuf {
    paths.buffer_file(session_id)
}

/// Append a single call. Called once per PostToolUse, so this opens, writes
/// one line, and returns — no state held across hook processes.
pub fn append(paths: &Paths, session_id: &str, tool_name: &str, tool_input: &Value) -> Result<()> {
    let path = buffer_path(paths, session_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let call = BufferedCall {
        tool_name: tool_name.to_string(),
        tool_input: tool_input.clone(),
        ts: Utc::now().timestamp_millis(),
    };
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let line = serde_json::to_string(&call)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Read all buffered calls and truncate the file. Returns an empty list when
/// the buffer is absent or empty. Malformed lines are dropped silently — one
/// corrupt record must not cost the rest of the turn.
pub fn drain(paths: &Paths, session_id: &str) -> Result<Vec<BufferedCall>> {
    let path = buffer_path(paths, session_id);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    std::fs::write(&path, "")
        .with_context(|| format!("Failed to truncate {}", path.display()))?;
    Ok(content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_paths() -> (tempfile::TempDir, Paths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(dir.path().to_path_buf());
        (dir, paths)
    }

    #[test]
    fn test_drain_missing_buffer_is_empty() {
        let (_dir, paths) = test_paths();
        assert!(drain(&paths, "s1").unwrap().is_empty());
    }

    #[test]
    fn test_append_then_drain() {
        let (_dir, paths) = test_paths();
        append(&paths, "s1", "Read", &json!({"file_path": "a.rs"})).unwrap();
        append(&paths, "s1", "Bash", &json!({"command": "ls"})).unwrap();

        let calls = drain(&paths, "s1").unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tool_name, "Read");
        assert_eq!(calls[0].tool_input["file_path"], "a.rs");
        assert_eq!(calls[1].tool_name, "Bash");
        assert!(calls[0].ts > 0);

        // Drained — second read sees nothing
        assert!(drain(&paths, "s1").unwrap().is_empty());
    }

    #[test]
    fn test_drain_drops_malformed_lines() {
        let (_dir, paths) = test_paths();
        append(&paths, "s1", "Read", &json!({"file_path": "a.rs"})).unwrap();
        let path = buffer_path(&paths, "s1");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("this is not json\n");
        content.push('\n');
        std::fs::write(&path, content).unwrap();

        let calls = drain(&paths, "s1").unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool_name, "Read");
    }

    #[test]
    fn test_sessions_are_isolated() {
        let (_dir, paths) = test_paths();
        append(&paths, "s1", "Read", &json!({"file_path": "a.rs"})).unwrap();
        assert!(drain(&paths, "other").unwrap().is_empty());
        assert_eq!(drain(&paths, "s1").unwrap().len(), 1);
    }
}
