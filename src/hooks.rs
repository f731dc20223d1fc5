/// Hook handlers — the four entry points the host invokes around each turn.
///
/// Each handler consumes one JSON object (already parsed off stdin) and
/// returns the JSON object to print. Nothing here is allowed to fail
/// outward: any error becomes a stderr line plus `{}`, because a hook that
/// exits non-zero or emits garbage can wedge the host session.
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};

use crate::annotate;
use crate::buffer;
use crate::config::{self, Config, Paths};
use crate::grouper;
use crate::retrieve;
use crate::store::Store;

// ── Handlers ──────────────────────────────────────────────────────────────────

/// SessionStart: open (and thereby create) the session database.
pub fn session_start(paths: &Paths, config: &Config, input: &Value) -> Value {
    swallow(|| {
        if !gate(config, input) {
            return Ok(json!({}));
        }
        let session_id = session_id(input)?;
        Store::open(paths, session_id)?;
        Ok(json!({}))
    })
}

/// UserPromptSubmit: bump the turn counter, persist the raw prompt, and —
/// from the second turn on — inject retrieved context. This is the critical
/// path; everything it touches is local.
pub fn on_prompt(paths: &Paths, config: &Config, input: &Value) -> Value {
    swallow(|| {
        if !gate(config, input) {
            return Ok(json!({}));
        }
        let session_id = session_id(input)?;
        let prompt = input["prompt"].as_str().unwrap_or("");

        let mut store = Store::open(paths, session_id)?;
        let index = store.prompt_index()? + 1;
        store.set_prompt_index(index)?;
        store.set_state(&format!("prompt_{index}"), prompt)?;

        if index <= 1 {
            return Ok(json!({}));
        }
        match retrieve::retrieve_context(&store, prompt, index, config.token_budget)? {
            Some(context) => Ok(json!({
                "hookSpecificOutput": {
                    "hookEventName": "UserPromptSubmit",
                    "additionalContext": context,
                }
            })),
            None => Ok(json!({})),
        }
    })
}

/// PostToolUse: append one line to the buffer. No database access — this
/// fires on every single tool call and must stay cheap.
pub fn on_tool(paths: &Paths, config: &Config, input: &Value) -> Value {
    swallow(|| {
        if !gate(config, input) {
            return Ok(json!({}));
        }
        let session_id = session_id(input)?;
        let tool_name = input["tool_name"]
            .as_str()
            .ok_or_else(|| anyhow!("missing tool_name"))?;
        let tool_input = input.get("tool_input").cloned().unwrap_or_else(|| json!({}));
        buffer::append(paths, session_id, tool_name, &tool_input)?;
        Ok(json!({}))
    })
}

/// Stop: drain the buffer into logical entries and annotate them — inline
/// for the rule engine, via a detached child for the LLM.
pub fn on_stop(paths: &Paths, config: &Config, input: &Value) -> Value {
    swallow(|| {
        if !gate(config, input) {
            return Ok(json!({}));
        }
        let session_id = session_id(input)?;
        let calls = buffer::drain(paths, session_id)?;
        if calls.is_empty() {
            return Ok(json!({}));
        }

        let mut store = Store::open(paths, session_id)?;
        let prompt_index = store.prompt_index()?;
        grouper::flush(&mut store, prompt_index, &calls)?;

        if config.llm_enabled() {
            // The LLM call takes seconds and hooks have millisecond budgets;
            // hand off to a detached child and return immediately.
            spawn_annotator(session_id, prompt_index)?;
        } else {
            let user_prompt = store
                .get_state(&format!("prompt_{prompt_index}"))?
                .unwrap_or_default();
            annotate::annotate_prompt(&mut store, prompt_index, &user_prompt)?;
        }
        Ok(json!({}))
    })
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn swallow(f: impl FnOnce() -> Result<Value>) -> Value {
    match f() {
        Ok(out) => out,
        Err(e) => {
            eprintln!("distill: {e:#}");
            json!({})
        }
    }
}

fn session_id(input: &Value) -> Result<&str> {
    input["session_id"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("missing session_id"))
}

/// Project-local gate. The hook payload's cwd wins; fall back to our own.
fn gate(config: &Config, input: &Value) -> bool {
    let cwd = input["cwd"]
        .as_str()
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    config::enabled_for_project(config, &cwd)
}

/// Spawn `distill annotate <session> <prompt_index>` fully detached: no
/// stdio, not waited on. The child reparents when this hook process exits.
fn spawn_annotator(session_id: &str, prompt_index: i64) -> Result<()> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    std::process::Command::new(exe)
        .arg("annotate")
        .arg(session_id)
        .arg(prompt_index.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn detached annotator")?;
    Ok(())
}
