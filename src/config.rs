/// Configuration — `~/.distill/config.json` plus the per-project enable gate.
///
/// A missing config file means defaults; a *broken* config file also means
/// defaults (the hook path must never die on a typo in user config). The
/// only hard requirement is an API key, and only when LLM annotation is on —
/// and even that failure is confined to the detached annotate process.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

// ── Paths ─────────────────────────────────────────────────────────────────────

/// Root of the on-disk layout. Everything distill writes lives under it:
/// `config.json`, `sessions/<id>.db`, `buffers/<id>.jsonl`.
///
/// Resolved from `$DISTILL_HOME`, then `$HOME/.distill`. Tests construct one
/// directly over a temp dir.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn resolve() -> Self {
        let root = std::env::var("DISTILL_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("."))
                    .join(".distill")
            });
        Self { root }
    }

    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn buffers_dir(&self) -> PathBuf {
        self.root.join("buffers")
    }

    pub fn session_db(&self, session_id: &str) -> PathBuf {
        self.sessions_dir()
            .join(format!("{}.db", sanitize_session_id(session_id)))
    }

    pub fn buffer_file(&self, session_id: &str) -> PathBuf {
        self.buffers_dir()
            .join(format!("{}.jsonl", sanitize_session_id(session_id)))
    }
}

/// Session ids come from the host verbatim and become filenames — replace
/// anything outside `[A-Za-z0-9]` with `_`.
pub fn sanitize_session_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Annotator {
    /// Rule-based annotation. Instant, no network.
    #[serde(rename = "self")]
    SelfRules,
    /// LLM-backed annotation via a small fast model, run detached.
    Haiku,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    Openai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub annotator: Annotator,
    pub provider: ProviderKind,
    /// Provider endpoint base. Defaults per provider when absent.
    pub api_base_url: Option<String>,
    /// API key. `DISTILL_API_KEY` / `ANTHROPIC_API_KEY` are consulted as
    /// fallbacks at use time, not load time.
    pub api_key: Option<String>,
    pub model: Option<String>,
    /// Retrieval context budget in tokens (1 token ≈ 4 chars).
    pub token_budget: usize,
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            annotator: Annotator::SelfRules,
            provider: ProviderKind::Anthropic,
            api_base_url: None,
            api_key: None,
            model: None,
            token_budget: default_token_budget(),
            enabled: true,
        }
    }
}

fn default_token_budget() -> usize {
    4000
}

impl Config {
    /// Load from disk. Missing file → defaults. Unparseable file → defaults
    /// with one stderr line, so a config typo never takes the hooks down.
    pub fn load(paths: &Paths) -> Self {
        let path = paths.config_file();
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("distill: bad config at {} ({e}), using defaults", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("distill: cannot read {} ({e}), using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write a starter config file to disk (only if it doesn't exist).
    pub fn write_default_if_missing(paths: &Paths) -> Result<PathBuf> {
        let path = paths.config_file();
        if path.exists() {
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&path, DEFAULT_CONFIG_JSON)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// API key, falling back to the environment when not in the file.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("DISTILL_API_KEY").ok().filter(|k| !k.is_empty()))
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.is_empty()))
    }

    pub fn llm_enabled(&self) -> bool {
        self.annotator == Annotator::Haiku
    }
}

// ── Per-project enable gate ───────────────────────────────────────────────────

/// A `.nodistill` file in the project root disables distill regardless of the
/// global config; a `.distill` file enables it. Neither present → config.
pub fn enabled_for_project(config: &Config, cwd: &Path) -> bool {
    if cwd.join(".nodistill").exists() {
        return false;
    }
    if cwd.join(".distill").exists() {
        return true;
    }
    config.enabled
}

// ── Default config template written by `distill init` ─────────────────────────

const DEFAULT_CONFIG_JSON: &str = r#"{
  "annotator": "self",
  "provider": "anthropic",
  "apiBaseUrl": null,
  "apiKey": null,
  "model": null,
  "tokenBudget": 4000,
  "enabled": true
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_session_id() {
        assert_eq!(sanitize_session_id("abc-123"), "abc_123");
        assert_eq!(sanitize_session_id("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_session_id("Plain42"), "Plain42");
    }

    #[test]
    fn test_paths_layout() {
        let paths = Paths::at(PathBuf::from("/tmp/d"));
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/d/config.json"));
        assert_eq!(
            paths.session_db("sess-1"),
            PathBuf::from("/tmp/d/sessions/sess_1.db")
        );
        assert_eq!(
            paths.buffer_file("sess-1"),
            PathBuf::from("/tmp/d/buffers/sess_1.jsonl")
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.annotator, Annotator::SelfRules);
        assert_eq!(config.provider, ProviderKind::Anthropic);
        assert_eq!(config.token_budget, 4000);
        assert!(config.enabled);
        assert!(!config.llm_enabled());
    }

    #[test]
    fn test_config_parse() {
        let raw = r#"{"annotator":"haiku","provider":"openai","tokenBudget":1000}"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.annotator, Annotator::Haiku);
        assert_eq!(config.provider, ProviderKind::Openai);
        assert_eq!(config.token_budget, 1000);
        assert!(config.enabled);
        assert!(config.llm_enabled());
    }

    #[test]
    fn test_config_load_bad_json_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(dir.path().to_path_buf());
        std::fs::write(paths.config_file(), "{not json").unwrap();
        let config = Config::load(&paths);
        assert_eq!(config.annotator, Annotator::SelfRules);
        assert_eq!(config.token_budget, 4000);
    }

    #[test]
    fn test_default_template_parses() {
        let config: Config = serde_json::from_str(DEFAULT_CONFIG_JSON).unwrap();
        assert_eq!(config.annotator, Annotator::SelfRules);
        assert_eq!(config.token_budget, 4000);
    }

    #[test]
    fn test_project_gate() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();

        assert!(enabled_for_project(&config, dir.path()));

        config.enabled = false;
        assert!(!enabled_for_project(&config, dir.path()));

        std::fs::write(dir.path().join(".distill"), "").unwrap();
        assert!(enabled_for_project(&config, dir.path()));

        std::fs::write(dir.path().join(".nodistill"), "").unwrap();
        assert!(!enabled_for_project(&config, dir.path()));
    }
}
