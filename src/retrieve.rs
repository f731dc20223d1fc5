/// Retrieval — turns a new user prompt into a context block of prior work.
///
/// Three layers, cheapest recall first: the previous turn's summary is
/// included unconditionally (continuity survives even a prompt with zero
/// matching tokens), BM25 over the FTS index supplies lexical recall, and
/// semantic-group expansion pulls in work-stream neighbours that the prompt's
/// own tokens would miss. Everything is gated by a character budget so the
/// injected block can't crowd out the actual conversation.
use anyhow::Result;

use crate::entry::Entry;
use crate::store::Store;

pub const CHARS_PER_TOKEN: usize = 4;
const MAX_TERMS: usize = 16;
const SEARCH_LIMIT: usize = 50;
const GROUP_EXPANSION_LIMIT: usize = 3;

/// English function words plus the coding verbs every prompt contains.
/// Anything here would match half the index and rank on noise.
const STOPWORDS: &[&str] = &[
    "about", "after", "again", "all", "also", "and", "any", "are", "back",
    "because", "been", "before", "being", "best", "better", "both", "but",
    "can", "change", "changes", "check", "code", "could", "current", "did",
    "does", "doing", "done", "down", "each", "even", "every", "file", "files",
    "find", "first", "fix", "for", "from", "get", "give", "going", "good",
    "had", "has", "have", "help", "here", "how", "into", "just", "know",
    "last", "like", "look", "make", "many", "may", "maybe", "more", "most",
    "need", "new", "not", "now", "off", "only", "other", "our", "out", "over",
    "please", "put", "run", "same", "see", "set", "should", "show", "some",
    "such", "sure", "take", "than", "that", "the", "their", "them", "then",
    "there", "these", "they", "this", "time", "try", "update", "use", "used",
    "using", "very", "want", "was", "way", "well", "were", "what", "when",
    "where", "which", "why", "will", "with", "work", "would", "you", "your",
];

// ── Query construction ────────────────────────────────────────────────────────

/// Lowercase, strip to `[a-z0-9_/.-]`, drop short tokens and stopwords, quote
/// each surviving term, OR them together. None when nothing survives.
pub fn build_match_query(prompt: &str) -> Option<String> {
    let cleaned: String = prompt
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '/' | '.' | '-') {
                c
            } else {
                ' '
            }
        })
        .collect();
    let terms: Vec<String> = cleaned
        .split_whitespace()
        .filter(|t| t.len() > 2 && !STOPWORDS.contains(t))
        .take(MAX_TERMS)
        .map(|t| format!("\"{t}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

// ── Context assembly ──────────────────────────────────────────────────────────

/// Build the context block for a new prompt, or None when there is nothing
/// worth injecting. `token_budget` gates the relevant-context lines at
/// `token_budget × 4` characters; selection stops at a line boundary.
pub fn retrieve_context(
    store: &Store,
    prompt: &str,
    current_index: i64,
    token_budget: usize,
) -> Result<Option<String>> {
    let continuity = store
        .summary_for_prompt(current_index - 1)?
        .and_then(|s| s.description)
        .filter(|d| !d.is_empty());

    let mut lines: Vec<String> = Vec::new();
    if let Some(query) = build_match_query(prompt) {
        let char_budget = token_budget * CHARS_PER_TOKEN;
        let mut used = 0usize;
        let mut selected: Vec<i64> = Vec::new();
        let mut seen_groups: Vec<String> = Vec::new();

        let hits = store.search_annotated(&query, current_index, SEARCH_LIMIT)?;
        for entry in &hits {
            let Some(line) = format_line(entry) else { continue };
            if used + line.len() > char_budget {
                break;
            }
            used += line.len();
            selected.push(entry.id);
            if !entry.semantic_group.is_empty() && !seen_groups.contains(&entry.semantic_group) {
                seen_groups.push(entry.semantic_group.clone());
            }
            lines.push(line);
        }

        // Pull in work-stream neighbours the prompt's own tokens missed
        for group in &seen_groups {
            let more =
                store.entries_in_group(group, current_index, &selected, GROUP_EXPANSION_LIMIT)?;
            for entry in &more {
                let Some(line) = format_line(entry) else { continue };
                if used + line.len() > char_budget {
                    break;
                }
                used += line.len();
                selected.push(entry.id);
                lines.push(line);
            }
        }
    }

    let mut sections: Vec<String> = Vec::new();
    if let Some(summary) = continuity {
        sections.push(format!("<last_activity>{summary}</last_activity>"));
    }
    if !lines.is_empty() {
        sections.push(format!(
            "<relevant_context>\n{}\n</relevant_context>",
            lines.join("\n")
        ));
    }
    if sections.is_empty() {
        return Ok(None);
    }
    Ok(Some(format!(
        "<distilled_session_context>\n{}\n</distilled_session_context>",
        sections.join("\n")
    )))
}

/// `[Prompt <N>]: <key> (<group>) — <description>`. Entries without a
/// description carry no retrievable signal and are skipped.
fn format_line(entry: &Entry) -> Option<String> {
    let description = entry.description.as_deref().filter(|d| !d.is_empty())?;
    let key = entry
        .file_path
        .as_deref()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| entry.entry_type.as_str());
    let group = if entry.semantic_group.is_empty() {
        entry.entry_type.as_str()
    } else {
        entry.semantic_group.as_str()
    };
    Some(format!(
        "[Prompt {}]: {key} ({group}) — {description}",
        entry.prompt_index
    ))
}
