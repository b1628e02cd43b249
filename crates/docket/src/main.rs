//! docket - document intake CLI
//!
//! Runs the intake pipeline over a batch of OCR'd uploads and writes the
//! resulting canonical entities as JSON.
//!
//! Usage:
//!   docket process <batch-dir>    Process a batch directory
//!   docket classify <page.txt>    Classify a single page of OCR text

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use docket_core::{load_config, IntakeConfig, IntakeRouter, PageClassifier};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod batch;

#[derive(Parser)]
#[command(name = "docket", about = "Document intake & canonicalization pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process a batch directory through the full pipeline
    Process {
        /// Batch directory: one subdirectory per uploaded file
        batch_dir: PathBuf,
        /// TOML file with threshold overrides
        #[arg(long)]
        config: Option<PathBuf>,
        /// Write the JSON result here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
        /// Pretty-print the JSON result
        #[arg(long)]
        pretty: bool,
    },
    /// Classify a single page of OCR text (debugging aid)
    Classify {
        /// Path to a page's OCR text
        page: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Process {
            batch_dir,
            config,
            output,
            pretty,
        } => process(&batch_dir, config.as_deref(), output.as_deref(), pretty),
        Command::Classify { page } => classify(&page),
    }
}

fn process(
    batch_dir: &std::path::Path,
    config_path: Option<&std::path::Path>,
    output: Option<&std::path::Path>,
    pretty: bool,
) -> Result<()> {
    let config = match config_path {
        Some(path) => load_config(path)?,
        None => IntakeConfig::default(),
    };

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}").expect("static template is valid"),
    );
    spinner.set_message(format!("reading {}", batch_dir.display()));
    let files = batch::load_batch(batch_dir)?;
    let page_count: usize = files.iter().map(|f| f.pages.len()).sum();
    spinner.finish_with_message(format!("{} files, {page_count} pages", files.len()));

    let router = IntakeRouter::new(config);
    let result = router.process_upload(&files);

    print_summary(&result);

    let json = if pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };
    match output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("Failed to write result: {}", path.display()))?,
        None => println!("{json}"),
    }

    if result.errors.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("batch finished with {} error(s)", result.errors.len())
    }
}

fn print_summary(result: &docket_core::BatchResult) {
    eprintln!(
        "{} {} invoices, {} documents, {} duplicate groups, {} stitch groups ({} ms)",
        "done:".green().bold(),
        result.canonical_invoices.len(),
        result.canonical_documents.len(),
        result.duplicate_groups.len(),
        result.stitch_groups.len(),
        result.processing_time_ms,
    );
    let review_count = result
        .canonical_invoices
        .iter()
        .filter(|i| i.needs_review)
        .count()
        + result
            .canonical_documents
            .iter()
            .filter(|d| d.needs_review)
            .count();
    if review_count > 0 {
        eprintln!(
            "{} {review_count} entities need manual review",
            "note:".yellow().bold()
        );
    }
    for warning in &result.warnings {
        eprintln!("{} {}", "warning:".yellow().bold(), warning.message);
    }
    for error in &result.errors {
        eprintln!("{} {}", "error:".red().bold(), error.message);
    }
}

fn classify(page: &std::path::Path) -> Result<()> {
    let text = std::fs::read_to_string(page)
        .with_context(|| format!("Failed to read page text: {}", page.display()))?;
    let classification =
        PageClassifier::new(IntakeConfig::default().classifier_min_margin).classify(&text);
    println!(
        "{} (confidence {:.2}, margin {:.2}){}",
        classification.doc_type.to_string().bold(),
        classification.confidence,
        classification.margin,
        if classification.low_confidence {
            " [low confidence]".yellow().to_string()
        } else {
            String::new()
        }
    );
    Ok(())
}
