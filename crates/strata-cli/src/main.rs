//! Strata - layered settings store
//!
//! Usage:
//!   strata get permissions.allow          # Effective value with provenance
//!   strata set local model '"opus"'       # Write one key into a scope
//!   strata add user permissions.allow Read
//!   strata watch model theme              # Print changes until interrupted

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strata_core::prelude::*;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Layered settings store", long_about = None)]
struct Cli {
    /// Project root (defaults to the current directory if it has a .claude folder)
    #[arg(long, short, global = true)]
    project: Option<PathBuf>,

    /// Store options file (defaults to ~/.config/strata/strata.toml)
    #[arg(long, global = true)]
    options: Option<PathBuf>,

    /// Command-line scope value, KEY=VALUE (repeatable)
    #[arg(long = "setting", short = 's', global = true, value_name = "KEY=VALUE")]
    settings: Vec<String>,

    /// Output format
    #[arg(short, long, default_value = "table", global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective value of a key
    Get {
        key: String,
        /// Also show which scope supplied each part
        #[arg(long)]
        split: bool,
    },

    /// Replace the value of a key in one scope
    ///
    /// VALUE is parsed as JSON and falls back to a plain string.
    Set {
        /// Target scope (user, shared, local)
        scope: String,
        key: String,
        value: String,
    },

    /// Remove a key from one scope
    #[command(alias = "rm")]
    Unset { scope: String, key: String },

    /// Append an item to a list unless already present
    Add {
        scope: String,
        key: String,
        item: String,
    },

    /// Show the backing file of every scope
    Paths,

    /// Print every backing file as currently observed
    Snapshot,

    /// Print changes to the given keys until interrupted
    Watch {
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    /// Human-readable table
    #[default]
    Table,
    /// Machine-readable JSON
    Json,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strata=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let watching = matches!(cli.command, Commands::Watch { .. });
    let context = open_context(&cli, watching)?;

    run(cli.command, cli.format, &context)
}

fn open_context(cli: &Cli, watch: bool) -> Result<ProjectContext> {
    let mut options = match &cli.options {
        Some(path) => StoreOptions::load(path)?,
        None => StoreOptions::load_default()?,
    };
    options.watch = watch;

    let command_line = CommandLineLayer::from_env()?
        .with_args(&cli.settings)
        .context("Invalid --setting value")?;
    let locator = options.locator()?;
    let store = ConfigStore::open(locator, options, command_line)?;
    let context = ProjectContext::new(store);

    match project_root(cli.project.as_deref())? {
        Some(root) => {
            context
                .switch_project(&root)
                .with_context(|| format!("Failed to open project {}", root.display()))?;
        }
        None => tracing::debug!("No project selected"),
    }
    Ok(context)
}

fn project_root(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        return Ok(Some(path.to_path_buf()));
    }
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Ok(ProjectPaths::new(&cwd)
        .claude_folder()
        .is_dir()
        .then_some(cwd))
}

fn run(command: Commands, format: OutputFormat, context: &ProjectContext) -> Result<()> {
    let store = context.store();
    match command {
        Commands::Get { key, split } => {
            let key = parse_key(&key)?;
            let value = store.get(&key)?;
            let parts = if split {
                Some(store.provenance_split(&key)?)
            } else {
                None
            };
            match format {
                OutputFormat::Table => print_value_table(&value, parts.as_ref()),
                OutputFormat::Json => print_json(&serde_json::json!({
                    "schema_version": 1,
                    "effective": value,
                    "split": parts,
                }))?,
            }
        }
        Commands::Set { scope, key, value } => {
            let (scope, key) = (parse_scope(&scope)?, parse_key(&key)?);
            checked_write(store.set(scope, &key, parse_value(&value)), || {
                format!("Failed to set {key} in {scope} scope")
            })?;
            println!("Set {key} in {scope} scope");
        }
        Commands::Unset { scope, key } => {
            let (scope, key) = (parse_scope(&scope)?, parse_key(&key)?);
            checked_write(store.unset(scope, &key), || {
                format!("Failed to unset {key} in {scope} scope")
            })?;
            println!("Removed {key} from {scope} scope");
        }
        Commands::Add { scope, key, item } => {
            let (scope, key) = (parse_scope(&scope)?, parse_key(&key)?);
            checked_write(store.add_to_list(scope, &key, parse_value(&item)), || {
                format!("Failed to add to {key} in {scope} scope")
            })?;
            println!("Added {item} to {key} in {scope} scope");
        }
        Commands::Paths => {
            let paths = store.paths();
            match format {
                OutputFormat::Table => print_paths_table(&paths),
                OutputFormat::Json => print_json(&serde_json::json!({
                    "schema_version": 1,
                    "project_root": store.project_root(),
                    "paths": paths,
                }))?,
            }
        }
        Commands::Snapshot => {
            let snapshot = store.snapshot_all()?;
            match format {
                OutputFormat::Table => print_snapshot_table(&snapshot),
                OutputFormat::Json => print_json(&snapshot)?,
            }
        }
        Commands::Watch { keys } => run_watch(store, &keys, format)?,
    }
    Ok(())
}

fn run_watch(store: &Arc<ConfigStore>, keys: &[String], format: OutputFormat) -> Result<()> {
    let mut subscriptions = Vec::with_capacity(keys.len());
    for raw in keys {
        let key = parse_key(raw)?;
        print_change(&store.get(&key)?, format);
        subscriptions.push(store.subscribe(&key, move |value| print_change(value, format))?);
    }

    eprintln!("Watching {} key(s); press Ctrl-C to stop", subscriptions.len());
    loop {
        std::thread::park();
    }
}

/// Attach `action` to a failed write, with a retry hint when the file was contended.
fn checked_write(result: StoreResult<()>, action: impl FnOnce() -> String) -> Result<()> {
    result.map_err(|e| {
        let message = if e.is_retryable() {
            format!("{}; another program kept changing the file, retry the save", action())
        } else {
            action()
        };
        anyhow::Error::new(e).context(message)
    })
}

fn parse_key(raw: &str) -> Result<ConfigKey> {
    ConfigKey::parse(raw).map_err(Into::into)
}

fn parse_scope(raw: &str) -> Result<Scope> {
    raw.parse::<Scope>().map_err(|e| anyhow::anyhow!(e))
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_change(value: &EffectiveValue, format: OutputFormat) {
    match format {
        OutputFormat::Table => println!(
            "{} = {} ({})",
            value.key,
            value.value_or_null(),
            provenance_label(value)
        ),
        OutputFormat::Json => match serde_json::to_string(value) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!("Failed to encode change: {}", e),
        },
    }
}

fn provenance_label(value: &EffectiveValue) -> String {
    if value.provenance.is_empty() {
        return "default".to_string();
    }
    value
        .provenance
        .iter()
        .map(Scope::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_value_table(value: &EffectiveValue, parts: Option<&BTreeMap<Scope, Value>>) {
    println!("{:<16} {}", "Key", value.key);
    match &value.value {
        Some(v) => println!("{:<16} {}", "Value", v),
        None => println!("{:<16} (unset)", "Value"),
    }
    println!("{:<16} {}", "From", provenance_label(value));

    if let Some(parts) = parts {
        println!();
        println!("{:<16} Contribution", "Scope");
        println!("{}", "-".repeat(60));
        for (scope, part) in parts.iter().rev() {
            println!("{:<16} {}", scope.as_str(), part);
        }
    }

    for warning in &value.warnings {
        eprintln!(
            "Warning: skipped {} scope ({}): {}",
            warning.scope,
            warning.path.display(),
            warning.message
        );
    }
}

fn print_paths_table(paths: &BTreeMap<Scope, PathBuf>) {
    println!("{:<16} {:<8} Path", "Scope", "Exists");
    println!("{}", "-".repeat(70));
    for scope in Scope::PRECEDENCE {
        match paths.get(&scope) {
            Some(path) => println!(
                "{:<16} {:<8} {}",
                scope.as_str(),
                if path.exists() { "yes" } else { "no" },
                path.display()
            ),
            None if scope == Scope::CommandLine => {
                println!("{:<16} {:<8} (not persisted)", scope.as_str(), "-")
            }
            None => println!("{:<16} {:<8} (no project)", scope.as_str(), "-"),
        }
    }
}

fn print_snapshot_table(snapshot: &Snapshot) {
    println!("Snapshot taken {}", snapshot.taken_at.to_rfc3339());
    if let Some(root) = &snapshot.project_root {
        println!("Project: {}", root.display());
    }
    println!();
    println!("{:<8} {:<6} Path", "Version", "Keys");
    println!("{}", "-".repeat(70));
    for (path, document) in &snapshot.documents {
        println!(
            "{:<8} {:<6} {}",
            document.version(),
            document.root().len(),
            path.display()
        );
    }
    for warning in &snapshot.warnings {
        eprintln!(
            "Warning: {} scope unreadable ({}): {}",
            warning.scope,
            warning.path.display(),
            warning.message
        );
    }
}
