mod config;
mod db;
mod error;
mod fetch;
mod parser;
mod pipeline;
mod source;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use config::Settings;
use fetch::HttpFetcher;
use pipeline::LoadContext;

#[derive(Parser)]
#[command(name = "sdamgia_scraper", about = "Exam problem loader for sdamgia.ru")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CommonArgs {
    /// SQLite database path (overrides SDAM_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Image storage root (overrides SDAM_IMAGES_DIR)
    #[arg(long, global = true)]
    images_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Fetch, extract and store problems by id
    Load {
        /// Subject code (mathb, math, bio, phys, ...)
        #[arg(short, long)]
        subject: String,
        /// Comma separated problem ids, e.g. "506304,4612"
        #[arg(short, long)]
        ids: String,
        /// Exam tier: ege or oge
        #[arg(short, long)]
        exam: Option<String>,
        /// Problems processed at once
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },
    /// Show database statistics
    Stats,
    /// Delete stored problems and their images
    Clean {
        /// Only this subject
        #[arg(short, long, conflicts_with = "all", required_unless_present = "all")]
        subject: Option<String>,
        /// Everything
        #[arg(long)]
        all: bool,
        /// Required: nothing is deleted without it
        #[arg(long, required = true)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let mut settings = Settings::load().context("Failed to load settings")?;
    if let Some(db) = cli.common.db {
        settings.db_path = db;
    }
    if let Some(dir) = cli.common.images_dir {
        settings.images_dir = dir;
    }

    let result = match cli.command {
        Commands::Init => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            println!("Schema ready at {}", settings.db_path.display());
            Ok(())
        }
        Commands::Load {
            subject,
            ids,
            exam,
            concurrency,
        } => {
            if let Some(exam) = exam {
                settings.exam_type = exam;
            }
            if let Some(n) = concurrency {
                settings.concurrency = n;
            }
            settings.validate()?;

            let ids = source::parse_ids(&ids);
            if ids.is_empty() {
                println!("No problem ids given.");
                return Ok(());
            }

            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            info!(?settings, "Starting load");

            println!(
                "Loading {} {} problems ({})...",
                ids.len(),
                subject,
                settings.exam_type.to_uppercase()
            );
            let fetcher = HttpFetcher::new(&settings)?;
            let ctx = Arc::new(LoadContext::new(&settings, &subject, fetcher));
            let stats = pipeline::load_problems(&conn, ctx, ids, settings.concurrency).await?;
            println!(
                "Done: {} problems ({} ok, {} skipped), {} images ({} failed).",
                stats.total, stats.ok, stats.skipped, stats.images, stats.image_failures
            );
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Subjects:      {}", s.subjects);
            println!("Problems:      {}", s.problems);
            println!("With solution: {}", s.with_solution);
            println!("Images:        {}", s.images);
            Ok(())
        }
        Commands::Clean { subject, all, .. } => {
            let conn = db::connect(&settings.db_path)?;
            db::init_schema(&conn)?;
            match subject {
                Some(code) if !all => {
                    if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
                        anyhow::bail!("Invalid subject code '{}'", code);
                    }
                    let removed = db::clean_subject(&conn, &code)?;
                    remove_dir_if_exists(&settings.images_dir.join(&code))?;
                    println!("Removed {} problems for {}.", removed, code);
                }
                _ => {
                    let removed = db::clean_all(&conn)?;
                    clear_image_dirs(&settings.images_dir)?;
                    println!("Removed {} problems.", removed);
                }
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn remove_dir_if_exists(dir: &std::path::Path) -> anyhow::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
    }
}

/// Remove every subdirectory of the image root. The root itself and any
/// loose files in it are left alone.
fn clear_image_dirs(root: &std::path::Path) -> anyhow::Result<()> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", root.display())),
    };
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            remove_dir_if_exists(&path)?;
        }
    }
    Ok(())
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
