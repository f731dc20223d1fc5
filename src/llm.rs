/// LLM annotation — best-effort enrichment, run detached from the hook path.
///
/// One call per completed turn: the current turn's raw entries, a metadata
/// window of prior work, and any failed stragglers all go up in a single
/// message; annotations, cross-entry links, and a turn summary come back as
/// JSON. Anything the model skips is marked failed and rides the retry
/// channel into the next turn. Errors never propagate — this process has
/// nobody to report to.
use anyhow::{Context, Result};
use serde::Deserialize;

use crate::client::Provider;
use crate::config::{Config, Paths};
use crate::entry::{Entry, LinkType};
use crate::store::Store;

/// Cap on failed entries carried into one call.
const RETRY_LIMIT: usize = 10;
/// Cap on historical entries included as context.
const HISTORY_LIMIT: usize = 30;

const SYSTEM_PROMPT: &str = "\
You annotate the activity log of a coding assistant. Each entry records tool \
calls the assistant made during one turn of a session. Write annotations that \
will later be retrieved by keyword search to remind the assistant of its own \
prior work.

For every entry in <current_entries> and <retry_entries>, produce one \
annotation:
- description: 1-2 sentences, concrete, past tense (what was done and why, \
if inferable from the user prompt).
- tags: 3-8 lowercase keywords a future search might use.
- semantic_group: a short kebab-case label naming the work-stream this entry \
belongs to (e.g. \"auth-refactor\"). Reuse groups from <historical_entries> \
when the work continues them.
- related_files: paths this work touches beyond the entry's own file, if any.
- confidence: 0.0-1.0, how sure you are the description is accurate.
- low_relevance: true only for noise (exploratory dead ends, trivial lists).

Also emit links between entries (current or historical) where one depends on, \
extends, or reverts another, and a prompt_summary describing the whole turn.

Respond with a single JSON object, no prose, no code fences:
{
  \"annotations\": [
    {\"id\": 1, \"description\": \"...\", \"tags\": [\"...\"], \
\"semantic_group\": \"...\", \"related_files\": [], \"confidence\": 0.9, \
\"low_relevance\": false}
  ],
  \"links\": [
    {\"source\": 1, \"target\": 2, \"type\": \"depends_on|extends|reverts|related\"}
  ],
  \"prompt_summary\": {\"description\": \"...\", \"tags\": [\"...\"]}
}";

// ── Response schema ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AnnotationResponse {
    #[serde(default)]
    pub annotations: Vec<AnnotationItem>,
    #[serde(default)]
    pub links: Vec<LinkItem>,
    #[serde(default)]
    pub prompt_summary: Option<PromptSummary>,
}

#[derive(Debug, Deserialize)]
pub struct AnnotationItem {
    pub id: i64,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub semantic_group: String,
    #[serde(default)]
    pub related_files: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub low_relevance: bool,
}

fn default_confidence() -> f64 {
    0.7
}

#[derive(Debug, Deserialize)]
pub struct LinkItem {
    pub source: i64,
    pub target: i64,
    #[serde(rename = "type")]
    pub link_type: String,
}

#[derive(Debug, Deserialize)]
pub struct PromptSummary {
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Annotate a turn. Swallows every failure: the detached process logs one
/// stderr line and exits 0 regardless.
pub async fn annotate_session(paths: &Paths, config: &Config, session_id: &str, prompt_index: i64) {
    if let Err(e) = run(paths, config, session_id, prompt_index).await {
        eprintln!("distill: annotation failed for {session_id} prompt {prompt_index}: {e}");
    }
}

async fn run(paths: &Paths, config: &Config, session_id: &str, prompt_index: i64) -> Result<()> {
    let mut store = Store::open(paths, session_id)?;

    let current = store.get_pending(prompt_index)?;
    let current_ids: Vec<i64> = current.iter().map(|e| e.id).collect();
    let retries: Vec<Entry> = store
        .get_failed(RETRY_LIMIT)?
        .into_iter()
        .filter(|e| !current_ids.contains(&e.id))
        .collect();
    let retry_ids: Vec<i64> = retries.iter().map(|e| e.id).collect();
    if current.is_empty() && retries.is_empty() {
        return Ok(());
    }

    let mut all_ids = current_ids;
    all_ids.extend(&retry_ids);
    store.mark_annotating(&all_ids)?;

    match annotate_once(&mut store, config, prompt_index, &current, &retries).await {
        Ok(()) => Ok(()),
        Err(e) => {
            // Everything in scope goes back to failed so the next turn retries it
            store.mark_failed(prompt_index)?;
            store.mark_failed_ids(&retry_ids)?;
            Err(e)
        }
    }
}

async fn annotate_once(
    store: &mut Store,
    config: &Config,
    prompt_index: i64,
    current: &[Entry],
    retries: &[Entry],
) -> Result<()> {
    let provider = Provider::from_config(config)?;
    let user_prompt = store
        .get_state(&format!("prompt_{prompt_index}"))?
        .unwrap_or_default();
    let historical = store.get_historical(prompt_index, HISTORY_LIMIT)?;

    let message = build_user_message(&user_prompt, current, &historical, retries);
    let raw = provider.annotate(SYSTEM_PROMPT, &message).await?;
    let response = parse_response(&raw)?;

    let in_scope: Vec<i64> = current.iter().chain(retries).map(|e| e.id).collect();
    apply_response(store, prompt_index, &in_scope, &response)?;
    Ok(())
}

// ── Prompt assembly ───────────────────────────────────────────────────────────

/// XML-delimited blocks: the raw user prompt, current entries with full call
/// JSON, historical metadata, and retry entries with full call JSON. Empty
/// blocks are omitted.
pub fn build_user_message(
    user_prompt: &str,
    current: &[Entry],
    historical: &[Entry],
    retries: &[Entry],
) -> String {
    let mut message = String::new();

    if !user_prompt.is_empty() {
        message.push_str(&format!("<user_prompt>\n{user_prompt}\n</user_prompt>\n\n"));
    }
    if !current.is_empty() {
        message.push_str(&format!(
            "<current_entries>\n{}\n</current_entries>\n\n",
            entries_with_calls(current)
        ));
    }
    if !historical.is_empty() {
        let rows: Vec<serde_json::Value> = historical
            .iter()
            .map(|e| {
                serde_json::json!({
                    "id": e.id,
                    "prompt_index": e.prompt_index,
                    "file_path": e.file_path,
                    "description": e.description,
                    "tags": e.tags,
                    "semantic_group": e.semantic_group,
                })
            })
            .collect();
        message.push_str(&format!(
            "<historical_entries>\n{}\n</historical_entries>\n\n",
            serde_json::to_string_pretty(&rows).unwrap_or_default()
        ));
    }
    if !retries.is_empty() {
        message.push_str(&format!(
            "<retry_entries>\n{}\n</retry_entries>\n\n",
            entries_with_calls(retries)
        ));
    }

    message
}

fn entries_with_calls(entries: &[Entry]) -> String {
    let rows: Vec<serde_json::Value> = entries
        .iter()
        .map(|e| {
            serde_json::json!({
                "id": e.id,
                "prompt_index": e.prompt_index,
                "entry_type": e.entry_type.as_str(),
                "file_path": e.file_path,
                "tool_calls": e.tool_calls,
            })
        })
        .collect();
    serde_json::to_string_pretty(&rows).unwrap_or_default()
}

// ── Response handling ─────────────────────────────────────────────────────────

/// Models fence JSON in Markdown no matter how firmly told not to.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the fence line (may carry a language tag), then the closing fence
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

pub fn parse_response(raw: &str) -> Result<AnnotationResponse> {
    serde_json::from_str(strip_code_fence(raw)).context("provider returned unparseable annotation JSON")
}

/// Write annotations, links, and the summary; mark anything the model skipped
/// as failed. Ids outside the in-scope set (hallucinated or historical) are
/// ignored for annotation but allowed in links.
pub fn apply_response(
    store: &mut Store,
    prompt_index: i64,
    in_scope: &[i64],
    response: &AnnotationResponse,
) -> Result<Vec<i64>> {
    let mut applied = Vec::new();
    for ann in &response.annotations {
        if !in_scope.contains(&ann.id) {
            continue;
        }
        store.annotate_entry(
            ann.id,
            &ann.description,
            &ann.tags.join(",").to_lowercase(),
            &ann.semantic_group,
            &ann.related_files,
            ann.confidence.clamp(0.0, 1.0),
            ann.low_relevance,
        )?;
        applied.push(ann.id);
    }

    for link in &response.links {
        if let Some(link_type) = LinkType::parse(&link.link_type) {
            store.insert_link(link.source, link.target, link_type)?;
        }
    }

    if let Some(summary) = &response.prompt_summary {
        store.insert_summary(
            prompt_index,
            &summary.description,
            &summary.tags.join(",").to_lowercase(),
        )?;
    }

    let missed: Vec<i64> = in_scope
        .iter()
        .copied()
        .filter(|id| !applied.contains(id))
        .collect();
    store.mark_failed_ids(&missed)?;
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{AnnotationStatus, EntryType};

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(dir.path().to_path_buf());
        let store = Store::open(&paths, "s1").unwrap();
        (dir, store)
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1}  "), "{\"a\":1}");
        assert_eq!(strip_code_fence("```json\n{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn test_parse_response() {
        let raw = r#"```json
{
  "annotations": [
    {"id": 3, "description": "Fixed the login redirect", "tags": ["login", "auth"],
     "semantic_group": "auth-fix", "related_files": ["src/session.ts"],
     "confidence": 0.9, "low_relevance": false}
  ],
  "links": [{"source": 3, "target": 1, "type": "extends"}],
  "prompt_summary": {"description": "Fixed auth redirect loop", "tags": ["auth"]}
}
```"#;
        let response = parse_response(raw).unwrap();
        assert_eq!(response.annotations.len(), 1);
        assert_eq!(response.annotations[0].id, 3);
        assert_eq!(response.links.len(), 1);
        assert_eq!(response.prompt_summary.unwrap().description, "Fixed auth redirect loop");
    }

    #[test]
    fn test_parse_response_defaults() {
        let response = parse_response(r#"{"annotations": [{"id": 1, "description": "x"}]}"#).unwrap();
        let ann = &response.annotations[0];
        assert!(ann.tags.is_empty());
        assert!((ann.confidence - 0.7).abs() < f64::EPSILON);
        assert!(!ann.low_relevance);
        assert!(response.links.is_empty());
        assert!(response.prompt_summary.is_none());
    }

    #[test]
    fn test_parse_response_rejects_garbage() {
        assert!(parse_response("Sure! Here are your annotations:").is_err());
    }

    #[test]
    fn test_build_user_message_blocks() {
        let (_dir, mut store) = test_store();
        let id = store
            .insert_entry(2, Some("src/login.ts"), EntryType::FileChange, &[])
            .unwrap();
        let hist_id = store.insert_entry(1, Some("src/auth.rs"), EntryType::Research, &[]).unwrap();
        store
            .annotate_entry(hist_id, "Read the auth module", "auth", "src", &[], 0.3, false)
            .unwrap();

        let current = store.get_pending(2).unwrap();
        let historical = store.get_historical(2, 30).unwrap();
        let message = build_user_message("fix login", &current, &historical, &[]);

        assert!(message.contains("<user_prompt>\nfix login\n</user_prompt>"));
        assert!(message.contains("<current_entries>"));
        assert!(message.contains(&format!("\"id\": {id}")));
        assert!(message.contains("<historical_entries>"));
        assert!(message.contains("Read the auth module"));
        assert!(!message.contains("<retry_entries>"));
    }

    #[test]
    fn test_apply_response_partial_marks_failed() {
        let (_dir, mut store) = test_store();
        let a = store.insert_entry(1, Some("a.rs"), EntryType::FileChange, &[]).unwrap();
        let b = store.insert_entry(1, Some("b.rs"), EntryType::FileChange, &[]).unwrap();
        store.mark_annotating(&[a, b]).unwrap();

        let response = parse_response(&format!(
            r#"{{"annotations": [{{"id": {a}, "description": "Edited a", "tags": ["A", "rust"]}}]}}"#
        ))
        .unwrap();
        let applied = apply_response(&mut store, 1, &[a, b], &response).unwrap();
        assert_eq!(applied, vec![a]);

        let recent = store.get_recent(10).unwrap();
        let entry_a = recent.iter().find(|e| e.id == a).unwrap();
        assert_eq!(entry_a.annotation_status, AnnotationStatus::Annotated);
        assert_eq!(entry_a.tags, "a,rust"); // lowercased on apply
        let entry_b = recent.iter().find(|e| e.id == b).unwrap();
        assert_eq!(entry_b.annotation_status, AnnotationStatus::Failed);

        // The failure is retriable: b shows up in the retry channel
        let failed = store.get_failed(10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, b);
    }

    #[test]
    fn test_apply_response_ignores_unknown_ids_and_bad_links() {
        let (_dir, mut store) = test_store();
        let a = store.insert_entry(1, Some("a.rs"), EntryType::FileChange, &[]).unwrap();

        let response = parse_response(&format!(
            r#"{{
                "annotations": [
                    {{"id": {a}, "description": "Edited a"}},
                    {{"id": 999, "description": "hallucinated"}}
                ],
                "links": [
                    {{"source": {a}, "target": {a}, "type": "related"}},
                    {{"source": {a}, "target": {a}, "type": "friends_with"}}
                ]
            }}"#
        ))
        .unwrap();
        let applied = apply_response(&mut store, 1, &[a], &response).unwrap();
        assert_eq!(applied, vec![a]);
        assert_eq!(store.get_counts().unwrap().links, 1);
    }

    #[test]
    fn test_apply_response_is_idempotent() {
        let (_dir, mut store) = test_store();
        let a = store.insert_entry(1, Some("a.rs"), EntryType::FileChange, &[]).unwrap();
        let response = parse_response(&format!(
            r#"{{
                "annotations": [{{"id": {a}, "description": "Edited a", "tags": ["rust"],
                                 "semantic_group": "core", "confidence": 0.9}}],
                "prompt_summary": {{"description": "Edited core", "tags": ["core"]}}
            }}"#
        ))
        .unwrap();

        apply_response(&mut store, 1, &[a], &response).unwrap();
        apply_response(&mut store, 1, &[a], &response).unwrap();

        let hits = store.search_annotated("\"rust\"", 10, 50).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].description.as_deref(), Some("Edited a"));
        assert_eq!(hits[0].semantic_group, "core");
    }

    #[test]
    fn test_apply_summary() {
        let (_dir, mut store) = test_store();
        let response = parse_response(
            r#"{"annotations": [], "prompt_summary": {"description": "Explored the repo", "tags": ["Survey"]}}"#,
        )
        .unwrap();
        apply_response(&mut store, 4, &[], &response).unwrap();
        let summary = store.summary_for_prompt(4).unwrap().unwrap();
        assert_eq!(summary.description.as_deref(), Some("Explored the repo"));
        assert_eq!(summary.tags, "survey");
        assert_eq!(summary.annotation_status, AnnotationStatus::Annotated);
    }
}
