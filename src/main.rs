mod annotate;
mod buffer;
mod client;
mod config;
mod entry;
mod grouper;
mod hooks;
mod llm;
mod retrieve;
mod store;

use std::io::Read;

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser, Subcommand};
use serde_json::{json, Value};

use config::{Config, Paths};
use store::Store;

#[derive(Parser, Debug)]
#[command(
    name = "distill",
    about = "Session-scoped context distiller for interactive coding assistants",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hook entry points — invoked by the host with one JSON object on stdin
    #[command(subcommand)]
    Hook(HookEvent),
    /// List known sessions
    Sessions,
    /// Show entry/link counts and the current prompt index for a session
    Status { session_id: String },
    /// Dump the most recent entries of a session
    Inspect {
        session_id: String,
        /// How many entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Search a session's index the way retrieval does
    Search {
        session_id: String,
        /// Query terms (tokenized like a user prompt)
        query: Vec<String>,
    },
    /// Run LLM annotation for one turn (spawned detached by the stop hook)
    Annotate { session_id: String, prompt_index: i64 },
    /// Write a default config.json if none exists
    Init,
    /// Mark the current project opted-in (writes a .distill file)
    Enable,
    /// Mark the current project opted-out (writes a .nodistill file)
    Disable,
    /// Generate shell completions and print to stdout (bash, elvish, fish, powershell, zsh)
    Completions { shell: String },
}

#[derive(Subcommand, Debug)]
enum HookEvent {
    /// SessionStart
    SessionStart,
    /// UserPromptSubmit
    UserPrompt,
    /// PostToolUse
    PostTool,
    /// Stop
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                e.exit();
            }
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let paths = Paths::resolve();
    let config = Config::load(&paths);

    match cli.command {
        Command::Hook(event) => run_hook(event, &paths, &config),
        Command::Sessions => list_sessions(&paths),
        Command::Status { session_id } => show_status(&paths, &session_id),
        Command::Inspect { session_id, limit } => inspect_session(&paths, &session_id, limit),
        Command::Search { session_id, query } => search_session(&paths, &session_id, &query),
        Command::Annotate { session_id, prompt_index } => {
            llm::annotate_session(&paths, &config, &session_id, prompt_index).await;
            Ok(())
        }
        Command::Init => {
            let path = Config::write_default_if_missing(&paths)?;
            println!("Config written to: {}", path.display());
            Ok(())
        }
        Command::Enable => write_marker(".distill"),
        Command::Disable => write_marker(".nodistill"),
        Command::Completions { shell } => generate_completions(&shell),
    }
}

// ── Hook dispatch ─────────────────────────────────────────────────────────────

/// Read one JSON object from stdin, run the handler, print one JSON object.
/// Never fails: unreadable or unparseable input degrades to `{}`.
fn run_hook(event: HookEvent, paths: &Paths, config: &Config) -> Result<()> {
    let mut raw = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut raw) {
        eprintln!("distill: failed to read hook input: {e}");
    }
    let input: Value = serde_json::from_str(&raw).unwrap_or_else(|_| json!({}));

    let output = match event {
        HookEvent::SessionStart => hooks::session_start(paths, config, &input),
        HookEvent::UserPrompt => hooks::on_prompt(paths, config, &input),
        HookEvent::PostTool => hooks::on_tool(paths, config, &input),
        HookEvent::Stop => hooks::on_stop(paths, config, &input),
    };
    println!("{output}");
    Ok(())
}

// ── Operator commands ─────────────────────────────────────────────────────────

fn list_sessions(paths: &Paths) -> Result<()> {
    let dir = paths.sessions_dir();
    if !dir.exists() {
        println!("No sessions yet.");
        return Ok(());
    }
    let mut names: Vec<String> = std::fs::read_dir(&dir)?
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.strip_suffix(".db").map(str::to_string)
        })
        .collect();
    names.sort();

    if names.is_empty() {
        println!("No sessions yet.");
        return Ok(());
    }
    println!();
    println!("  Sessions");
    for name in &names {
        let store = Store::open(paths, name)?;
        let counts = store.get_counts()?;
        println!(
            "  {name}  prompts {}  entries {}  failed {}",
            store.prompt_index()?,
            counts.total(),
            counts.failed,
        );
    }
    Ok(())
}

fn open_existing(paths: &Paths, session_id: &str) -> Result<Store> {
    if !paths.session_db(session_id).exists() {
        bail!("no session named '{session_id}' (see `distill sessions`)");
    }
    Store::open(paths, session_id)
}

fn show_status(paths: &Paths, session_id: &str) -> Result<()> {
    let store = open_existing(paths, session_id)?;
    let counts = store.get_counts()?;
    println!();
    println!("  Session {session_id}");
    println!("    prompt index  {}", store.prompt_index()?);
    println!("    entries       {}", counts.total());
    println!("      pending     {}", counts.pending);
    println!("      annotating  {}", counts.annotating);
    println!("      annotated   {}", counts.annotated);
    println!("      failed      {}", counts.failed);
    println!("    links         {}", counts.links);
    Ok(())
}

fn inspect_session(paths: &Paths, session_id: &str, limit: usize) -> Result<()> {
    let store = open_existing(paths, session_id)?;
    let entries = store.get_recent(limit)?;
    if entries.is_empty() {
        println!("Session '{session_id}' has no entries.");
        return Ok(());
    }
    println!();
    for e in &entries {
        println!(
            "  #{:<4} p{:<3} {:<11} {:<10} {}",
            e.id,
            e.prompt_index,
            e.entry_type.as_str(),
            e.annotation_status.as_str(),
            e.file_path.as_deref().unwrap_or("-"),
        );
        if let Some(desc) = e.description.as_deref() {
            println!("        {desc}");
        }
        if !e.semantic_group.is_empty() {
            println!("        group {}  confidence {:.1}", e.semantic_group, e.confidence);
        }
    }
    Ok(())
}

fn search_session(paths: &Paths, session_id: &str, query: &[String]) -> Result<()> {
    let store = open_existing(paths, session_id)?;
    let prompt = query.join(" ");
    let Some(match_expr) = retrieve::build_match_query(&prompt) else {
        bail!("query contains no searchable terms");
    };
    let hits = store.search_annotated(&match_expr, i64::MAX, 20)?;
    if hits.is_empty() {
        println!("No matches.");
        return Ok(());
    }
    println!();
    for e in &hits {
        println!(
            "  #{:<4} p{:<3} {}  {}",
            e.id,
            e.prompt_index,
            e.file_path.as_deref().unwrap_or(e.entry_type.as_str()),
            e.description.as_deref().unwrap_or(""),
        );
    }
    Ok(())
}

fn write_marker(name: &str) -> Result<()> {
    std::fs::write(name, "")?;
    println!("Wrote ./{name}");
    Ok(())
}

// ── Shell completions ─────────────────────────────────────────────────────────

fn generate_completions(shell_name: &str) -> Result<()> {
    use clap_complete::{generate, Shell};

    let shell: Shell = shell_name
        .to_lowercase()
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown shell '{shell_name}' (supported: bash, elvish, fish, powershell, zsh)"))?;

    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "distill", &mut std::io::stdout());
    Ok(())
}
