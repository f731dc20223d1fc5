/// Grouper — folds a turn's buffered calls into logical entries.
///
/// File tools collapse into one entry per path key (a read-read-edit run on
/// the same file is one unit of work); everything else stands alone. Inputs
/// are summarized down to the key field plus a few tool-specific extras, so
/// the database stores activity shape, not payloads.
use anyhow::Result;
use serde_json::Value;

use crate::buffer::BufferedCall;
use crate::entry::{CallSummary, EntryType};
use crate::store::Store;

// ── Tool tables ───────────────────────────────────────────────────────────────

/// Planning/mode toggles and todo bookkeeping — noise, never recorded.
const IGNORED_TOOLS: &[&str] = &[
    "EnterPlanMode",
    "ExitPlanMode",
    "AskUserQuestion",
    "TodoRead",
    "TodoWrite",
    "TaskCreate",
    "TaskUpdate",
    "TaskList",
    "TaskGet",
];

/// Tools that group by their path key.
const FILE_TOOLS: &[&str] = &["Read", "Write", "Edit", "NotebookEdit", "Glob", "Grep"];

/// Subset whose presence makes a group a `file_change`.
const WRITE_TOOLS: &[&str] = &["Write", "Edit", "NotebookEdit"];

/// The one input field that identifies what a tool operated on.
fn key_field(tool: &str) -> Option<&'static str> {
    match tool {
        "Read" | "Write" | "Edit" => Some("file_path"),
        "NotebookEdit" => Some("notebook_path"),
        "Glob" | "Grep" => Some("pattern"),
        "Bash" => Some("command"),
        "WebSearch" => Some("query"),
        "WebFetch" => Some("url"),
        "Task" => Some("prompt"),
        _ => None,
    }
}

const KEY_MAX: usize = 300;
const EXTRA_MAX: usize = 200;

// ── Grouping ──────────────────────────────────────────────────────────────────

/// A logical entry before it reaches the store.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub file_path: Option<String>,
    pub entry_type: EntryType,
    pub calls: Vec<CallSummary>,
}

/// Fold an ordered batch of buffered calls into pending entries. Entries come
/// out in first-appearance order: a file group sits where its first call
/// occurred, standalone entries sit at their call position. Deterministic for
/// a given input.
pub fn group_calls(calls: &[BufferedCall]) -> Vec<PendingEntry> {
    enum Slot {
        Keyed { key: String, calls: Vec<CallSummary> },
        Standalone(PendingEntry),
    }

    let mut slots: Vec<Slot> = Vec::new();

    for call in calls {
        let tool = call.tool_name.as_str();
        if IGNORED_TOOLS.contains(&tool) {
            continue;
        }

        if FILE_TOOLS.contains(&tool) {
            let key = key_field(tool)
                .and_then(|f| call.tool_input.get(f))
                .and_then(Value::as_str)
                .unwrap_or("_unknown")
                .to_string();
            let summary = summarize_call(call);
            let existing = slots
                .iter()
                .position(|s| matches!(s, Slot::Keyed { key: k, .. } if *k == key));
            match existing {
                Some(i) => {
                    if let Slot::Keyed { calls, .. } = &mut slots[i] {
                        calls.push(summary);
                    }
                }
                None => slots.push(Slot::Keyed { key, calls: vec![summary] }),
            }
        } else {
            let summary = summarize_call(call);
            let entry_type = match tool {
                "Bash" => EntryType::Command,
                "WebSearch" | "WebFetch" => EntryType::Web,
                _ => EntryType::Research,
            };
            slots.push(Slot::Standalone(PendingEntry {
                file_path: summary.target.clone(),
                entry_type,
                calls: vec![summary],
            }));
        }
    }

    slots
        .into_iter()
        .map(|slot| match slot {
            Slot::Keyed { key, calls } => {
                let has_write = calls.iter().any(|c| WRITE_TOOLS.contains(&c.tool.as_str()));
                PendingEntry {
                    file_path: Some(key),
                    entry_type: if has_write {
                        EntryType::FileChange
                    } else {
                        EntryType::Research
                    },
                    calls,
                }
            }
            Slot::Standalone(entry) => entry,
        })
        .collect()
}

/// Group a batch and insert the resulting entries. Returns the new entry ids
/// in insertion order.
pub fn flush(store: &mut Store, prompt_index: i64, calls: &[BufferedCall]) -> Result<Vec<i64>> {
    let mut ids = Vec::new();
    for entry in group_calls(calls) {
        let id = store.insert_entry(
            prompt_index,
            entry.file_path.as_deref(),
            entry.entry_type,
            &entry.calls,
        )?;
        ids.push(id);
    }
    Ok(ids)
}

// ── Call summarization ────────────────────────────────────────────────────────

/// Keep the key field and the handful of extras worth remembering; drop the
/// rest. Full file contents, grep output and friends never reach the store.
fn summarize_call(call: &BufferedCall) -> CallSummary {
    let input = &call.tool_input;
    let field = |name: &str, max: usize| -> Option<String> {
        input.get(name).and_then(Value::as_str).map(|s| truncate_chars(s, max))
    };

    let mut summary = CallSummary {
        tool: call.tool_name.clone(),
        target: key_field(&call.tool_name).and_then(|f| field(f, KEY_MAX)),
        ..Default::default()
    };

    match call.tool_name.as_str() {
        "Edit" => {
            summary.old_string = field("old_string", EXTRA_MAX);
            summary.new_string = field("new_string", EXTRA_MAX);
        }
        "Grep" => {
            summary.glob = field("glob", EXTRA_MAX);
            summary.path = field("path", EXTRA_MAX);
        }
        "Bash" | "Task" => {
            summary.description = field("description", EXTRA_MAX);
        }
        _ => {}
    }

    summary
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(tool: &str, input: Value) -> BufferedCall {
        BufferedCall {
            tool_name: tool.to_string(),
            tool_input: input,
            ts: 0,
        }
    }

    #[test]
    fn test_file_reads_group_by_path() {
        let calls = vec![
            call("Read", json!({"file_path": "a.ts"})),
            call("Grep", json!({"pattern": "foo"})),
            call("Read", json!({"file_path": "a.ts"})),
            call("Bash", json!({"command": "ls"})),
        ];
        let entries = group_calls(&calls);
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].file_path.as_deref(), Some("a.ts"));
        assert_eq!(entries[0].entry_type, EntryType::Research);
        assert_eq!(entries[0].calls.len(), 2);

        assert_eq!(entries[1].file_path.as_deref(), Some("foo"));
        assert_eq!(entries[1].entry_type, EntryType::Research);

        assert_eq!(entries[2].entry_type, EntryType::Command);
        assert_eq!(entries[2].file_path.as_deref(), Some("ls"));
    }

    #[test]
    fn test_ignored_tools_are_dropped() {
        let calls = vec![
            call("TodoWrite", json!({"todos": []})),
            call("EnterPlanMode", json!({})),
            call("Read", json!({"file_path": "x"})),
        ];
        let entries = group_calls(&calls);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file_path.as_deref(), Some("x"));
    }

    #[test]
    fn test_write_makes_file_change() {
        let calls = vec![
            call("Read", json!({"file_path": "src/login.ts"})),
            call("Edit", json!({
                "file_path": "src/login.ts",
                "old_string": "a",
                "new_string": "b"
            })),
        ];
        let entries = group_calls(&calls);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, EntryType::FileChange);
        assert_eq!(entries[0].calls[1].old_string.as_deref(), Some("a"));
        assert_eq!(entries[0].calls[1].new_string.as_deref(), Some("b"));
    }

    #[test]
    fn test_missing_key_falls_back() {
        let calls = vec![call("Read", json!({}))];
        let entries = group_calls(&calls);
        assert_eq!(entries[0].file_path.as_deref(), Some("_unknown"));
    }

    #[test]
    fn test_standalone_types() {
        let calls = vec![
            call("WebSearch", json!({"query": "rust fts5"})),
            call("WebFetch", json!({"url": "https://example.com"})),
            call("Task", json!({"prompt": "explore the auth module", "description": "explore auth"})),
            call("SomethingNew", json!({"arg": 1})),
        ];
        let entries = group_calls(&calls);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].entry_type, EntryType::Web);
        assert_eq!(entries[0].file_path.as_deref(), Some("rust fts5"));
        assert_eq!(entries[1].entry_type, EntryType::Web);
        assert_eq!(entries[2].entry_type, EntryType::Research);
        assert_eq!(entries[2].calls[0].description.as_deref(), Some("explore auth"));
        assert_eq!(entries[3].entry_type, EntryType::Research);
        assert_eq!(entries[3].file_path, None);
    }

    #[test]
    fn test_grep_keeps_glob_and_path() {
        let calls = vec![call("Grep", json!({
            "pattern": "fn main",
            "glob": "*.rs",
            "path": "src"
        }))];
        let entries = group_calls(&calls);
        let c = &entries[0].calls[0];
        assert_eq!(c.target.as_deref(), Some("fn main"));
        assert_eq!(c.glob.as_deref(), Some("*.rs"));
        assert_eq!(c.path.as_deref(), Some("src"));
    }

    #[test]
    fn test_summarization_truncates() {
        let long = "x".repeat(500);
        let calls = vec![call("Bash", json!({"command": long, "description": long.clone()}))];
        let entries = group_calls(&calls);
        let c = &entries[0].calls[0];
        assert_eq!(c.target.as_ref().unwrap().len(), 300);
        assert_eq!(c.description.as_ref().unwrap().len(), 200);
    }

    #[test]
    fn test_grouping_is_deterministic() {
        let calls = vec![
            call("Read", json!({"file_path": "a.ts"})),
            call("Grep", json!({"pattern": "foo"})),
            call("Edit", json!({"file_path": "a.ts", "old_string": "x", "new_string": "y"})),
            call("Bash", json!({"command": "cargo test"})),
        ];
        let first = group_calls(&calls);
        let second = group_calls(&calls);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.file_path, b.file_path);
            assert_eq!(a.entry_type, b.entry_type);
            assert_eq!(a.calls.len(), b.calls.len());
        }
    }

    #[test]
    fn test_flush_inserts_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let paths = crate::config::Paths::at(dir.path().to_path_buf());
        let mut store = Store::open(&paths, "s1").unwrap();
        let calls = vec![
            call("Read", json!({"file_path": "a.ts"})),
            call("Bash", json!({"command": "ls"})),
        ];
        let ids = flush(&mut store, 1, &calls).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1]);
        assert_eq!(store.get_pending(1).unwrap().len(), 2);
    }
}
