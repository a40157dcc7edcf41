//! # panic-triage CLI (`triage`)
//!
//! The `triage` binary is the operational interface for panic-triage. It
//! runs the full analysis pipeline on a crash artifact, offers direct
//! Knowledge Base lookups, and manages the known-code snapshot and the
//! analysis history.
//!
//! ## Usage
//!
//! ```bash
//! triage --config ./config/triage.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `triage init` | Create the SQLite database and run schema migrations |
//! | `triage analyze <file>` | Run the full pipeline on an artifact |
//! | `triage lookup <code>` | Direct Knowledge Base lookup for a code |
//! | `triage codes list` | Print the known-code snapshot |
//! | `triage codes reload` | Re-read the workbook and swap the snapshot |
//! | `triage model <product>` | Resolve a product identifier to a display name |
//! | `triage history` | Recent analyses for a user |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use panic_triage::config;
use panic_triage::kb::KnowledgeBase;
use panic_triage::migrate;
use panic_triage::models::{AnalysisRequest, ArtifactKind, Solution};
use panic_triage::pipeline::{AnalysisReply, Analyzer};
use panic_triage::solution::resolve_solution;

/// panic-triage CLI — crash-artifact triage against a curated repair
/// Knowledge Base.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/triage.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "triage",
    about = "panic-triage — crash-artifact triage: device detection, panic-code resolution, repair guidance",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/triage.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Run the full analysis pipeline on a crash artifact.
    Analyze {
        /// Path to the artifact file.
        file: PathBuf,

        /// Artifact kind: `auto`, `log` (structured log), `text`, or `image`.
        /// `auto` infers from the extension (.ips / .txt / .png / .jpg / .jpeg).
        #[arg(long, default_value = "auto")]
        kind: String,

        /// Knowledge Base language sheet; defaults to the configured one.
        #[arg(long)]
        lang: Option<String>,

        /// Identity the attempt limiter keys on.
        #[arg(long, default_value_t = 0)]
        user: i64,

        /// Device/product identifier hint when the artifact carries none.
        #[arg(long)]
        product: Option<String>,
    },

    /// Look up repair guidance for an error code directly.
    Lookup {
        /// The error code, escaped or unescaped spelling.
        code: String,

        /// Product identifier selecting the Knowledge Base column.
        #[arg(long)]
        product: Option<String>,

        /// Knowledge Base language sheet; defaults to the configured one.
        #[arg(long)]
        lang: Option<String>,
    },

    /// Manage the known-code snapshot.
    Codes {
        #[command(subcommand)]
        action: CodesAction,
    },

    /// Resolve a product identifier to its display name.
    Model {
        /// Product identifier (e.g. `iPhone10,1`).
        product: String,

        /// Knowledge Base language sheet; defaults to the configured one.
        #[arg(long)]
        lang: Option<String>,
    },

    /// Show recent analyses for a user.
    History {
        #[arg(long, default_value_t = 0)]
        user: i64,

        /// Maximum number of records to print.
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

/// Known-code snapshot subcommands.
#[derive(Subcommand)]
enum CodesAction {
    /// Print the current snapshot.
    List,
    /// Re-read the workbook and atomically swap the snapshot.
    ///
    /// Run this after replacing the workbook file.
    Reload,
}

fn infer_kind(kind: &str, file: &std::path::Path) -> Result<ArtifactKind> {
    let by_extension = || {
        let ext = file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "ips" => Ok(ArtifactKind::StructuredLog),
            "txt" => Ok(ArtifactKind::TextDump),
            "png" | "jpg" | "jpeg" => Ok(ArtifactKind::Image),
            other => anyhow::bail!(
                "cannot read '.{}' files; readable kinds: .ips, .txt, .png, .jpg, .jpeg",
                other
            ),
        }
    };
    match kind {
        "auto" => by_extension(),
        "log" => Ok(ArtifactKind::StructuredLog),
        "text" => Ok(ArtifactKind::TextDump),
        "image" => Ok(ArtifactKind::Image),
        other => anyhow::bail!("unknown kind '{}'; use auto, log, text, or image", other),
    }
}

fn print_solution(solution: &Solution) {
    match &solution.error_code {
        Some(code) => println!("  error code: {}", code),
        None => println!("  error code: not found"),
    }
    if !solution.has_content() {
        println!("  solution: none");
        return;
    }
    let tier = if solution.is_mini_shown { "mini" } else { "full" };
    println!("  solution ({}):", tier);
    for line in &solution.descriptions {
        println!("    - {}", line);
    }
    for link in &solution.links {
        println!("    - {}", link);
    }
    if solution.has_full_available {
        let full_count = solution.full_descriptions.as_ref().map_or(0, Vec::len)
            + solution.full_links.as_ref().map_or(0, Vec::len);
        println!("  full solution available ({} items)", full_count);
    }
    if solution.image.is_some() {
        println!("  attached image: yes");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Read-only Knowledge Base commands work without a config file.
    let cfg = match &cli.command {
        Commands::Lookup { .. } | Commands::Model { .. } => {
            config::load_config(&cli.config).unwrap_or_else(|_| config::Config::minimal())
        }
        _ => config::load_config(&cli.config)?,
    };

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Analyze {
            file,
            kind,
            lang,
            user,
            product,
        } => {
            let artifact_kind = infer_kind(&kind, &file)?;
            let bytes = std::fs::read(&file)?;
            let analyzer = Analyzer::new(cfg).await?;
            let reply = analyzer
                .analyze(AnalysisRequest {
                    bytes,
                    kind: artifact_kind,
                    language: lang,
                    user_id: user,
                    product_hint: product,
                })
                .await?;

            println!("analyze {} ({})", file.display(), artifact_kind);
            match reply {
                AnalysisReply::Rejected { message } => {
                    println!("  rejected: {}", message);
                }
                AnalysisReply::Completed(analysis) => {
                    match &analysis.device.model {
                        Some(model) => println!("  device: {}", model),
                        None => println!("  device: unknown"),
                    }
                    if let Some(os) = &analysis.device.os_version {
                        println!("  os version: {}", os);
                    }
                    if let Some(key) = &analysis.device.crash_reporter_key {
                        println!("  crash reporter key: {}", key);
                    }
                    print_solution(&analysis.solution);
                    println!(
                        "  solution found: {}",
                        if analysis.solution_found { "yes" } else { "no" }
                    );
                }
            }
            println!("ok");
        }
        Commands::Lookup {
            code,
            product,
            lang,
        } => {
            let kb = KnowledgeBase::load(&cfg.kb.workbook, lang.as_deref().unwrap_or(&cfg.kb.language));
            if !kb.is_loaded() {
                println!("No Knowledge Base available.");
                return Ok(());
            }
            let solution = resolve_solution(&kb, &code, product.as_deref());
            println!("lookup {}", code);
            print_solution(&solution);
            println!("ok");
        }
        Commands::Codes { action } => {
            let analyzer = Analyzer::new(cfg).await?;
            match action {
                CodesAction::List => {
                    let snapshot = analyzer.known_codes().snapshot();
                    for code in snapshot.iter() {
                        println!("{}", code);
                    }
                    println!("{} known codes", snapshot.len());
                }
                CodesAction::Reload => {
                    let count = analyzer.reload_known_codes();
                    println!("Known codes reloaded: {} codes.", count);
                }
            }
        }
        Commands::Model { product, lang } => {
            let kb = KnowledgeBase::load(&cfg.kb.workbook, lang.as_deref().unwrap_or(&cfg.kb.language));
            let device = kb.device_model(Some(&product), None, None);
            println!(
                "{} -> {}",
                product,
                device.model.as_deref().unwrap_or("unknown")
            );
        }
        Commands::History { user, limit } => {
            let analyzer = Analyzer::new(cfg).await?;
            let records = analyzer.history().recent(user, limit).await?;
            if records.is_empty() {
                println!("No analyses recorded.");
                return Ok(());
            }
            for record in &records {
                println!(
                    "{}  {}  {}  {}  {}",
                    record.created_at,
                    record.kind,
                    record.device_model.as_deref().unwrap_or("-"),
                    record.error_code.as_deref().unwrap_or("-"),
                    if record.solution_found { "solved" } else { "unsolved" }
                );
            }
            println!("{} records", records.len());
            let stats = analyzer.history().stats(user).await?;
            println!(
                "total: {}  solved: {}  unsolved: {}",
                stats.total, stats.successful, stats.failed
            );
        }
    }

    Ok(())
}
