/// Per-session SQLite store.
///
/// One database per session, one synchronous connection per process — hook
/// processes live for milliseconds, so there is nothing to pool. WAL plus
/// `synchronous = NORMAL` lets the retriever read while a detached annotator
/// writes.
///
/// The FTS index is a *standalone* fts5 table, not a content-synced one:
/// annotation rewrites an entry's indexed fields, and the safe way to do that
/// is delete-old-row + insert-new-row + rewrite the `fts_map` pairing, all in
/// one transaction. `fts_map` keeps `fts_rowid ↔ entry_id` bijective at every
/// commit point.
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::time::Duration;

use crate::config::Paths;
use crate::entry::{AnnotationStatus, CallSummary, Entry, EntryType, LinkType};

// ── Schema ────────────────────────────────────────────────────────────────────

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    prompt_index      INTEGER NOT NULL,
    file_path         TEXT,
    entry_type        TEXT NOT NULL,
    tool_calls        TEXT NOT NULL DEFAULT '[]',
    description       TEXT,
    tags              TEXT NOT NULL DEFAULT '',
    related_files     TEXT NOT NULL DEFAULT '[]',
    semantic_group    TEXT NOT NULL DEFAULT '',
    confidence        REAL NOT NULL DEFAULT 0.0,
    low_relevance     INTEGER NOT NULL DEFAULT 0,
    annotation_status TEXT NOT NULL DEFAULT 'pending',
    created_at        INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entries_prompt ON entries(prompt_index);
CREATE INDEX IF NOT EXISTS idx_entries_status ON entries(annotation_status);
CREATE INDEX IF NOT EXISTS idx_entries_group  ON entries(semantic_group);

CREATE VIRTUAL TABLE IF NOT EXISTS entries_fts USING fts5(
    file_path, description, tags, semantic_group,
    tokenize = 'porter unicode61'
);

CREATE TABLE IF NOT EXISTS fts_map (
    fts_rowid INTEGER PRIMARY KEY,
    entry_id  INTEGER NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS entry_links (
    source_id INTEGER NOT NULL,
    target_id INTEGER NOT NULL,
    link_type TEXT NOT NULL,
    UNIQUE(source_id, target_id, link_type)
);

CREATE TABLE IF NOT EXISTS session_state (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const ENTRY_COLS: &str = "id, prompt_index, file_path, entry_type, tool_calls, description, \
     tags, related_files, semantic_group, confidence, low_relevance, annotation_status, created_at";

// ── Store ─────────────────────────────────────────────────────────────────────

pub struct Store {
    conn: Connection,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StatusCounts {
    pub pending: i64,
    pub annotating: i64,
    pub annotated: i64,
    pub failed: i64,
    pub links: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.annotating + self.annotated + self.failed
    }
}

impl Store {
    /// Open (or create) the per-session database. Schema creation is
    /// idempotent; reopening an existing session resumes it.
    pub fn open(paths: &Paths, session_id: &str) -> Result<Self> {
        let db_path = paths.session_db(session_id);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)
            .context("Failed to create session schema")?;
        Ok(Self { conn })
    }

    // ── Session state ─────────────────────────────────────────────────────────

    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM session_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_state(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO session_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Current prompt index; 0 before the first prompt.
    pub fn prompt_index(&self) -> Result<i64> {
        Ok(self
            .get_state("prompt_index")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub fn set_prompt_index(&mut self, index: i64) -> Result<()> {
        self.set_state("prompt_index", &index.to_string())
    }

    // ── Entry writes ──────────────────────────────────────────────────────────

    /// Insert one pending entry and its (mostly empty) FTS document. The FTS
    /// row exists from birth so the bijection invariant holds for pending
    /// entries too; only `file_path` is searchable until annotation fills in
    /// the rest.
    pub fn insert_entry(
        &mut self,
        prompt_index: i64,
        file_path: Option<&str>,
        entry_type: EntryType,
        tool_calls: &[CallSummary],
    ) -> Result<i64> {
        let calls_json = serde_json::to_string(tool_calls)?;
        let now = Utc::now().timestamp_millis();

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO entries (prompt_index, file_path, entry_type, tool_calls, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![prompt_index, file_path, entry_type.as_str(), calls_json, now],
        )?;
        let entry_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO entries_fts (file_path, description, tags, semantic_group)
             VALUES (?1, '', '', '')",
            params![file_path.unwrap_or("")],
        )?;
        let fts_rowid = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO fts_map (fts_rowid, entry_id) VALUES (?1, ?2)",
            params![fts_rowid, entry_id],
        )?;
        tx.commit()?;
        Ok(entry_id)
    }

    /// Apply an annotation and reindex. The old FTS row is deleted and a
    /// fresh one inserted with the new mapping inside one transaction; a
    /// crash lands before or after the whole sequence, never between delete
    /// and insert. Reapplying the same annotation yields the same row and
    /// index contents.
    #[allow(clippy::too_many_arguments)]
    pub fn annotate_entry(
        &mut self,
        id: i64,
        description: &str,
        tags: &str,
        semantic_group: &str,
        related_files: &[String],
        confidence: f64,
        low_relevance: bool,
    ) -> Result<()> {
        let related_json = serde_json::to_string(related_files)?;

        let tx = self.conn.transaction()?;
        let updated = tx.execute(
            "UPDATE entries SET description = ?1, tags = ?2, semantic_group = ?3,
                    related_files = ?4, confidence = ?5, low_relevance = ?6,
                    annotation_status = 'annotated'
             WHERE id = ?7",
            params![description, tags, semantic_group, related_json, confidence, low_relevance as i64, id],
        )?;
        if updated == 0 {
            // Unknown id (e.g. hallucinated by the LLM) — nothing to reindex.
            tx.commit()?;
            return Ok(());
        }

        let file_path: Option<String> = tx.query_row(
            "SELECT file_path FROM entries WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let old_rowid: Option<i64> = tx
            .query_row(
                "SELECT fts_rowid FROM fts_map WHERE entry_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(rowid) = old_rowid {
            tx.execute("DELETE FROM entries_fts WHERE rowid = ?1", params![rowid])?;
            tx.execute("DELETE FROM fts_map WHERE entry_id = ?1", params![id])?;
        }
        tx.execute(
            "INSERT INTO entries_fts (file_path, description, tags, semantic_group)
             VALUES (?1, ?2, ?3, ?4)",
            params![file_path.as_deref().unwrap_or(""), description, tags, semantic_group],
        )?;
        let fts_rowid = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO fts_map (fts_rowid, entry_id) VALUES (?1, ?2)",
            params![fts_rowid, id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Insert a turn-overview entry, born `annotated`. Indexes description
    /// and tags only.
    pub fn insert_summary(&mut self, prompt_index: i64, description: &str, tags: &str) -> Result<i64> {
        let now = Utc::now().timestamp_millis();

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO entries (prompt_index, file_path, entry_type, description, tags,
                                  semantic_group, annotation_status, created_at)
             VALUES (?1, NULL, 'summary', ?2, ?3, '', 'annotated', ?4)",
            params![prompt_index, description, tags, now],
        )?;
        let entry_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO entries_fts (file_path, description, tags, semantic_group)
             VALUES ('', ?1, ?2, '')",
            params![description, tags],
        )?;
        let fts_rowid = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO fts_map (fts_rowid, entry_id) VALUES (?1, ?2)",
            params![fts_rowid, entry_id],
        )?;
        tx.commit()?;
        Ok(entry_id)
    }

    pub fn insert_link(&mut self, source_id: i64, target_id: i64, link_type: LinkType) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO entry_links (source_id, target_id, link_type)
             VALUES (?1, ?2, ?3)",
            params![source_id, target_id, link_type.as_str()],
        )?;
        Ok(())
    }

    // ── Status transitions ────────────────────────────────────────────────────

    pub fn mark_annotating(&mut self, ids: &[i64]) -> Result<()> {
        self.set_status_by_ids(ids, AnnotationStatus::Annotating)
    }

    /// Fail everything still in flight for a turn. Used when the LLM call
    /// dies wholesale.
    pub fn mark_failed(&mut self, prompt_index: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE entries SET annotation_status = 'failed'
             WHERE prompt_index = ?1 AND annotation_status IN ('pending', 'annotating')",
            params![prompt_index],
        )?;
        Ok(())
    }

    /// Fail a specific id set (retry entries from earlier turns).
    pub fn mark_failed_ids(&mut self, ids: &[i64]) -> Result<()> {
        self.set_status_by_ids(ids, AnnotationStatus::Failed)
    }

    fn set_status_by_ids(&mut self, ids: &[i64], status: AnnotationStatus) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE entries SET annotation_status = '{}' WHERE id IN ({})",
            status.as_str(),
            placeholders(ids.len())
        );
        self.conn.execute(&sql, params_from_iter(ids.iter()))?;
        Ok(())
    }

    // ── Entry reads ───────────────────────────────────────────────────────────

    /// Entries at a turn still awaiting annotation.
    pub fn get_pending(&self, prompt_index: i64) -> Result<Vec<Entry>> {
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLS} FROM entries
                 WHERE prompt_index = ?1 AND annotation_status IN ('pending', 'annotating')
                 ORDER BY id"
            ),
            params![prompt_index],
        )
    }

    /// Most recent failed entries, newest first. The retry channel.
    pub fn get_failed(&self, limit: usize) -> Result<Vec<Entry>> {
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLS} FROM entries
                 WHERE annotation_status = 'failed'
                 ORDER BY id DESC LIMIT ?1"
            ),
            params![limit as i64],
        )
    }

    /// Most recent annotated entries before a turn, newest first.
    pub fn get_historical(&self, before_prompt: i64, limit: usize) -> Result<Vec<Entry>> {
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLS} FROM entries
                 WHERE prompt_index < ?1 AND annotation_status = 'annotated'
                 ORDER BY id DESC LIMIT ?2"
            ),
            params![before_prompt, limit as i64],
        )
    }

    /// Newest entries regardless of status, for `inspect`.
    pub fn get_recent(&self, limit: usize) -> Result<Vec<Entry>> {
        self.query_entries(
            &format!("SELECT {ENTRY_COLS} FROM entries ORDER BY id DESC LIMIT ?1"),
            params![limit as i64],
        )
    }

    /// The turn-overview entry for a prompt, if one was produced.
    pub fn summary_for_prompt(&self, prompt_index: i64) -> Result<Option<Entry>> {
        let mut rows = self.query_entries(
            &format!(
                "SELECT {ENTRY_COLS} FROM entries
                 WHERE prompt_index = ?1 AND entry_type = 'summary'
                 ORDER BY id DESC LIMIT 1"
            ),
            params![prompt_index],
        )?;
        Ok(rows.pop())
    }

    /// BM25 search over annotated, retrieval-eligible entries strictly before
    /// the current turn. `match_expr` is a ready-made fts5 MATCH expression.
    pub fn search_annotated(
        &self,
        match_expr: &str,
        before_prompt: i64,
        limit: usize,
    ) -> Result<Vec<Entry>> {
        let sql = format!(
            "SELECT {cols} FROM entries_fts
             JOIN fts_map m ON m.fts_rowid = entries_fts.rowid
             JOIN entries e ON e.id = m.entry_id
             WHERE entries_fts MATCH ?1
               AND e.low_relevance = 0
               AND e.annotation_status = 'annotated'
               AND e.prompt_index < ?2
             ORDER BY rank LIMIT ?3",
            cols = prefixed_entry_cols("e")
        );
        self.query_entries(&sql, params![match_expr, before_prompt, limit as i64])
    }

    /// Up to `limit` more annotated entries from one semantic group, newest
    /// turn first, skipping ids already selected.
    pub fn entries_in_group(
        &self,
        semantic_group: &str,
        before_prompt: i64,
        exclude_ids: &[i64],
        limit: usize,
    ) -> Result<Vec<Entry>> {
        let mut sql = format!(
            "SELECT {ENTRY_COLS} FROM entries
             WHERE semantic_group = ?1 AND prompt_index < ?2
               AND annotation_status = 'annotated' AND low_relevance = 0
               AND entry_type != 'summary'"
        );
        if !exclude_ids.is_empty() {
            sql.push_str(&format!(" AND id NOT IN ({})", placeholders(exclude_ids.len())));
        }
        sql.push_str(" ORDER BY prompt_index DESC, id DESC LIMIT ?");

        use rusqlite::types::Value;
        let mut values: Vec<Value> = vec![
            Value::Text(semantic_group.to_string()),
            Value::Integer(before_prompt),
        ];
        values.extend(exclude_ids.iter().map(|&id| Value::Integer(id)));
        values.push(Value::Integer(limit as i64));

        self.query_entries(&sql, params_from_iter(values))
    }

    pub fn get_counts(&self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        let mut stmt = self
            .conn
            .prepare("SELECT annotation_status, COUNT(*) FROM entries GROUP BY annotation_status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            match AnnotationStatus::parse(&status) {
                AnnotationStatus::Pending => counts.pending = n,
                AnnotationStatus::Annotating => counts.annotating = n,
                AnnotationStatus::Annotated => counts.annotated = n,
                AnnotationStatus::Failed => counts.failed = n,
            }
        }
        counts.links = self
            .conn
            .query_row("SELECT COUNT(*) FROM entry_links", [], |row| row.get(0))?;
        Ok(counts)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn query_entries<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Entry>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entry> {
    let entry_type: String = row.get(3)?;
    let tool_calls: String = row.get(4)?;
    let related_files: String = row.get(7)?;
    let status: String = row.get(11)?;
    Ok(Entry {
        id: row.get(0)?,
        prompt_index: row.get(1)?,
        file_path: row.get(2)?,
        entry_type: EntryType::parse(&entry_type),
        tool_calls: serde_json::from_str(&tool_calls).unwrap_or_default(),
        description: row.get(5)?,
        tags: row.get(6)?,
        related_files: serde_json::from_str(&related_files).unwrap_or_default(),
        semantic_group: row.get(8)?,
        confidence: row.get(9)?,
        low_relevance: row.get::<_, i64>(10)? != 0,
        annotation_status: AnnotationStatus::parse(&status),
        created_at: row.get(12)?,
    })
}

fn placeholders(count: usize) -> String {
    let mut s = "?,".repeat(count);
    s.pop();
    s
}

fn prefixed_entry_cols(alias: &str) -> String {
    ENTRY_COLS
        .split(", ")
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
