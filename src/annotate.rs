/// Self-annotation — deterministic, zero model calls.
///
/// Every entry gets a description, tags, and a semantic group derived purely
/// from its tool-call metadata, so retrieval works even when no LLM is
/// configured or the LLM never comes back. Confidence is pinned low; the LLM
/// annotator overwrites these fields when it runs.
use anyhow::Result;

use crate::entry::{CallSummary, Entry, EntryType};
use crate::store::Store;

/// The rule engine can't judge relevance, so everything it writes is kept
/// retrievable at a fixed low confidence.
const SELF_CONFIDENCE: f64 = 0.3;

const PATH_MAX: usize = 60;
const INLINE_MAX: usize = 80;
const PROMPT_KEYWORDS: usize = 5;

// ── Entry annotation ──────────────────────────────────────────────────────────

/// Annotate every in-flight entry of a turn, then insert the turn summary.
pub fn annotate_prompt(store: &mut Store, prompt_index: i64, user_prompt: &str) -> Result<()> {
    let pending = store.get_pending(prompt_index)?;
    if pending.is_empty() {
        return Ok(());
    }

    let mut descriptions = Vec::new();
    let mut summary_tags: Vec<String> = Vec::new();
    for entry in &pending {
        let description = describe(entry);
        let tags = derive_tags(entry, user_prompt);
        let group = derive_group(entry);
        store.annotate_entry(
            entry.id,
            &description,
            &tags.join(","),
            &group,
            &[],
            SELF_CONFIDENCE,
            false,
        )?;
        for tag in tags {
            push_unique(&mut summary_tags, tag);
        }
        descriptions.push(description);
    }

    let summary = if descriptions.len() == 1 {
        descriptions[0].clone()
    } else {
        format!(
            "{} activities: {}...",
            descriptions.len(),
            descriptions
                .iter()
                .take(3)
                .cloned()
                .collect::<Vec<_>>()
                .join("; ")
        )
    };
    store.insert_summary(prompt_index, &summary, &summary_tags.join(","))?;
    Ok(())
}

// ── Description templates ─────────────────────────────────────────────────────

fn describe(entry: &Entry) -> String {
    let short = short_target(entry);
    match entry.entry_type {
        EntryType::FileChange => {
            let only_writes = entry.tool_calls.iter().all(|c| c.tool == "Write");
            let edits = entry
                .tool_calls
                .iter()
                .filter(|c| c.tool == "Edit" || c.tool == "NotebookEdit")
                .count();
            if only_writes {
                format!("Created {short}")
            } else if edits > 0 {
                let plural = if edits == 1 { "" } else { "s" };
                format!("Modified {short} ({edits} edit{plural})")
            } else {
                format!("Changed {short}")
            }
        }
        EntryType::Research => {
            if let Some(search) = find_call(entry, &["Glob", "Grep"]) {
                format!("Searched for \"{}\"", clip(target_of(search), INLINE_MAX))
            } else if find_call(entry, &["Read"]).is_some() {
                format!("Read {short}")
            } else if let Some(task) = find_call(entry, &["Task"]) {
                let desc = task
                    .description
                    .as_deref()
                    .or(task.target.as_deref())
                    .unwrap_or("");
                format!("Subagent: {}", clip(desc, INLINE_MAX))
            } else {
                format!("Researched {short}")
            }
        }
        EntryType::Command => {
            let call = entry.tool_calls.first();
            let text = call
                .and_then(|c| c.description.as_deref().or(c.target.as_deref()))
                .unwrap_or("");
            format!("Ran: {}", clip(text, INLINE_MAX))
        }
        EntryType::Web => {
            if let Some(search) = find_call(entry, &["WebSearch"]) {
                format!("Web search: {}", clip(target_of(search), INLINE_MAX))
            } else if let Some(fetch) = find_call(entry, &["WebFetch"]) {
                format!("Fetched: {}", clip(target_of(fetch), INLINE_MAX))
            } else {
                "Web activity".to_string()
            }
        }
        // Summaries are born annotated and never reach this path
        EntryType::Summary => "Session activity".to_string(),
    }
}

fn find_call<'a>(entry: &'a Entry, tools: &[&str]) -> Option<&'a CallSummary> {
    entry
        .tool_calls
        .iter()
        .find(|c| tools.contains(&c.tool.as_str()))
}

fn target_of(call: &CallSummary) -> &str {
    call.target.as_deref().unwrap_or("")
}

/// The entry's key, shortened for inline display: deep paths render as
/// `.../<last three segments>`.
fn short_target(entry: &Entry) -> String {
    let raw = entry
        .file_path
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(short_path)
        .unwrap_or_else(|| {
            entry
                .tool_calls
                .first()
                .map(|c| c.tool.clone())
                .unwrap_or_default()
        });
    clip(&raw, PATH_MAX)
}

fn short_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() > 3 {
        format!(".../{}", segments[segments.len() - 3..].join("/"))
    } else {
        path.to_string()
    }
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}

// ── Tags ──────────────────────────────────────────────────────────────────────

/// Connective tissue that would pollute the tag index. Deliberately small —
/// the retrieval-side stopword list is the thorough one.
const TAG_STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "are", "was",
    "what", "when", "where", "how", "why", "can", "could", "should", "would",
    "will", "all", "any", "but", "not", "you", "your", "has", "have", "had",
    "its", "out", "use", "using", "used", "get", "set", "add", "fix", "make",
    "run", "file", "files", "new",
];

fn derive_tags(entry: &Entry, user_prompt: &str) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();

    if let Some(path) = entry.file_path.as_deref().filter(|p| !p.is_empty()) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if let Some(filename) = segments.last() {
            push_unique(&mut tags, filename.to_lowercase());
            if let Some((_, ext)) = filename.rsplit_once('.') {
                if !ext.is_empty() {
                    push_unique(&mut tags, ext.to_lowercase());
                }
            }
        }
        if segments.len() >= 2 {
            push_unique(&mut tags, segments[segments.len() - 2].to_lowercase());
        }
    }

    push_unique(&mut tags, entry.entry_type.as_str().to_string());

    for call in &entry.tool_calls {
        push_unique(&mut tags, call.tool.to_lowercase());
        if let Some(desc) = call.description.as_deref() {
            for word in keywords(desc) {
                push_unique(&mut tags, word);
            }
        }
    }

    for word in keywords(user_prompt).into_iter().take(PROMPT_KEYWORDS) {
        push_unique(&mut tags, word);
    }

    tags
}

/// Lowercased alphanumeric tokens of length > 2, minus stopwords.
fn keywords(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| w.len() > 2 && !TAG_STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

fn push_unique(tags: &mut Vec<String>, tag: String) {
    if !tag.is_empty() && !tags.contains(&tag) {
        tags.push(tag);
    }
}

// ── Semantic group ────────────────────────────────────────────────────────────

/// Immediate parent directory of the key (first segment when there is only
/// one), falling back to the entry type.
fn derive_group(entry: &Entry) -> String {
    let Some(path) = entry.file_path.as_deref().filter(|p| !p.is_empty()) else {
        return entry.entry_type.as_str().to_string();
    };
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.len() {
        0 => entry.entry_type.as_str().to_string(),
        1 => segments[0].to_string(),
        n => segments[n - 2].to_string(),
    }
}
