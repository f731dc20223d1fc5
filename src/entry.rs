/// Entry model — the unit of recorded activity.
///
/// One entry is one logical thing the assistant did within a prompt turn:
/// a run of edits to a file, a search, a shell command, a web fetch. Entries
/// start `pending` and are enriched by the self-annotator or the LLM
/// annotator; summary entries are a per-turn overview and skip the state
/// machine entirely.
use serde::{Deserialize, Serialize};

// ── Entry type ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    FileChange,
    Research,
    Command,
    Web,
    Summary,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::FileChange => "file_change",
            EntryType::Research => "research",
            EntryType::Command => "command",
            EntryType::Web => "web",
            EntryType::Summary => "summary",
        }
    }

    /// Parse the DB column. Unknown values collapse to `research` — the DB is
    /// only ever written by us, so this is a belt for hand-edited rows.
    pub fn parse(s: &str) -> Self {
        match s {
            "file_change" => EntryType::FileChange,
            "command" => EntryType::Command,
            "web" => EntryType::Web,
            "summary" => EntryType::Summary,
            _ => EntryType::Research,
        }
    }
}

// ── Annotation status ─────────────────────────────────────────────────────────

/// `pending → annotating → annotated | failed`. Failed entries re-enter the
/// next turn's LLM batch through the retry channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationStatus {
    Pending,
    Annotating,
    Annotated,
    Failed,
}

impl AnnotationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationStatus::Pending => "pending",
            AnnotationStatus::Annotating => "annotating",
            AnnotationStatus::Annotated => "annotated",
            AnnotationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "annotating" => AnnotationStatus::Annotating,
            "annotated" => AnnotationStatus::Annotated,
            "failed" => AnnotationStatus::Failed,
            _ => AnnotationStatus::Pending,
        }
    }
}

// ── Link type ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    DependsOn,
    Extends,
    Reverts,
    Related,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::DependsOn => "depends_on",
            LinkType::Extends => "extends",
            LinkType::Reverts => "reverts",
            LinkType::Related => "related",
        }
    }

    /// The LLM picks the type — anything outside the closed set is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "depends_on" => Some(LinkType::DependsOn),
            "extends" => Some(LinkType::Extends),
            "reverts" => Some(LinkType::Reverts),
            "related" => Some(LinkType::Related),
            _ => None,
        }
    }
}

// ── Call summary ──────────────────────────────────────────────────────────────

/// Compact record of one tool call. Only the key field and a handful of
/// tool-specific extras survive summarization; full tool inputs never reach
/// the database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallSummary {
    pub tool: String,
    /// The configured key-field value: file path, pattern, command, query,
    /// url, or subagent prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Edit only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_string: Option<String>,
    /// Grep only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Shell and subagent-task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ── Entry ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Entry {
    pub id: i64,
    /// 1-based turn counter the entry was recorded under.
    pub prompt_index: i64,
    /// Semantic key — the file operated on, or pattern/URL/command for
    /// non-file tools. None when the tool has no key field at all.
    pub file_path: Option<String>,
    pub entry_type: EntryType,
    pub tool_calls: Vec<CallSummary>,
    pub description: Option<String>,
    /// Comma-separated, lowercased.
    pub tags: String,
    pub related_files: Vec<String>,
    pub semantic_group: String,
    /// Advisory only — retrieval never filters on it.
    pub confidence: f64,
    pub low_relevance: bool,
    pub annotation_status: AnnotationStatus,
    /// Millisecond epoch.
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_type_round_trip() {
        for ty in [
            EntryType::FileChange,
            EntryType::Research,
            EntryType::Command,
            EntryType::Web,
            EntryType::Summary,
        ] {
            assert_eq!(EntryType::parse(ty.as_str()), ty);
        }
        assert_eq!(EntryType::parse("garbage"), EntryType::Research);
    }

    #[test]
    fn test_status_round_trip() {
        for st in [
            AnnotationStatus::Pending,
            AnnotationStatus::Annotating,
            AnnotationStatus::Annotated,
            AnnotationStatus::Failed,
        ] {
            assert_eq!(AnnotationStatus::parse(st.as_str()), st);
        }
        assert_eq!(AnnotationStatus::parse(""), AnnotationStatus::Pending);
    }

    #[test]
    fn test_link_type_parse() {
        assert_eq!(LinkType::parse("depends_on"), Some(LinkType::DependsOn));
        assert_eq!(LinkType::parse("extends"), Some(LinkType::Extends));
        assert_eq!(LinkType::parse("reverts"), Some(LinkType::Reverts));
        assert_eq!(LinkType::parse("related"), Some(LinkType::Related));
        assert_eq!(LinkType::parse("friends_with"), None);
    }

    #[test]
    fn test_call_summary_compact_json() {
        let call = CallSummary {
            tool: "Read".to_string(),
            target: Some("src/main.rs".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&call).unwrap();
        // Absent extras must not bloat the stored JSON
        assert_eq!(json, r#"{"tool":"Read","target":"src/main.rs"}"#);

        let back: CallSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool, "Read");
        assert_eq!(back.target.as_deref(), Some("src/main.rs"));
        assert!(back.old_string.is_none());
    }
}
