mod compliance;
mod db;
mod event;
mod extract;
mod index;
mod normalize;
mod output;
mod pipeline;
mod report;
mod settings;
mod template;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use tracing::{debug, warn};

use compliance::dot1x;
use event::{EventTransformer, IndexedEvent};
use extract::Extractor;
use index::elastic::ElasticBackend;
use normalize::NormalizeSpec;
use pipeline::Pipeline;
use report::TracingReporter;
use settings::Settings;
use template::Template;

#[derive(Parser)]
#[command(name = "netaudit", about = "802.1X access-port compliance audit for device configs")]
struct Cli {
    /// KEY=VALUE secrets file (ES_HOST, ES_USER, ES_PASS, ...)
    #[arg(long, global = true, default_value = settings::DEFAULT_SECRETS)]
    secrets: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a template over one config and print the extraction result as JSON
    Parse {
        /// Template file (default: bundled 802.1X template)
        #[arg(short, long)]
        template: Option<PathBuf>,
        /// Device configuration file
        config: PathBuf,
    },
    /// Audit every *.cfg in a directory, write NDJSON and ship events
    Check {
        #[arg(short, long)]
        config_dir: Option<PathBuf>,
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        #[arg(short, long)]
        template: Option<PathBuf>,
        /// Only write NDJSON files
        #[arg(long)]
        no_ingest: bool,
    },
    /// Ship events from NDJSON files written by a previous check
    Ingest {
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Resubmit events from the spill queue
    Resubmit {
        /// Max events to resubmit (default: all)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Show the last run and the spill queue size
    Stats,
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
    let settings = Settings::load(&cli.secrets)?;

    let result = match cli.command {
        Commands::Parse { template, config } => {
            let template = load_template(template.as_deref())?;
            let bytes = std::fs::read(&config).with_context(|| format!("Failed to read {:?}", config))?;
            let result = Extractor::new(&template, settings.max_depth).extract(&bytes)?;
            if result.is_empty() {
                warn!("No template group matched anything in {:?}", config);
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Check {
            config_dir,
            output_dir,
            template,
            no_ingest,
        } => {
            let config_dir = config_dir.unwrap_or_else(|| settings.config_dir.clone());
            let output_dir = output_dir.unwrap_or_else(|| settings.output_dir.clone());
            let template = load_template(template.as_deref())?;
            let rule = dot1x::rule(&settings.exemption_phrases);
            if template.depth() > settings.max_depth {
                warn!(
                    "Template nests {} groups deep but max_depth is {}; deeper matches will skip documents",
                    template.depth(),
                    settings.max_depth
                );
            }

            let paths = pipeline::discover(&config_dir, "cfg")?;
            if paths.is_empty() {
                bail!("No .cfg files found in {:?}", config_dir);
            }

            let t_process = Instant::now();
            println!("Processing {} configs with {} workers...", paths.len(), settings.workers);
            let pipeline = Pipeline::new(&template, settings.max_depth, NormalizeSpec::default(), &rule);
            let outcomes = pipeline.process_paths(&paths, settings.workers, &TracingReporter)?;
            println!("Processed in {:.1}s", t_process.elapsed().as_secs_f64());

            let transformer = EventTransformer::new(chrono::Utc::now(), rule.reference());
            debug!("Event batch timestamp {}", transformer.timestamp());
            let mut by_host: BTreeMap<String, Vec<IndexedEvent>> = BTreeMap::new();
            for o in &outcomes {
                if let Some(host) = o.hostname() {
                    by_host
                        .entry(host.to_string())
                        .or_default()
                        .extend(transformer.transform_all(&o.verdicts));
                }
            }
            for (host, events) in &by_host {
                let written = output::write_host_events(&output_dir, host, events)?;
                println!(
                    "{}: {} compliant, {} non-compliant -> {}",
                    host,
                    written.compliant,
                    written.non_compliant,
                    output_dir.display()
                );
            }

            let conn = open_store(&settings)?;
            db::save_document_runs(&conn, &pipeline::new_run_id(), &outcomes)?;

            println!();
            pipeline::print_summary(&outcomes);

            if no_ingest {
                println!("\nSkipping ingest (--no-ingest).");
            } else {
                let events: Vec<IndexedEvent> = by_host.into_values().flatten().collect();
                ship(&settings, &conn, &settings.index, events).await?;
            }
            Ok(())
        }
        Commands::Ingest { dir } => {
            let dir = dir.unwrap_or_else(|| settings.output_dir.clone());
            let events = output::read_events(&dir)?;
            if events.is_empty() {
                println!("No events found in {:?}.", dir);
                return Ok(());
            }
            println!("Ingesting {} events from {:?}...", events.len(), dir);
            let conn = open_store(&settings)?;
            ship(&settings, &conn, &settings.index, events).await
        }
        Commands::Resubmit { limit } => {
            let conn = open_store(&settings)?;
            let spilled = db::fetch_spilled(&conn, limit)?;
            if spilled.is_empty() {
                println!("Spill queue is empty.");
                return Ok(());
            }
            println!("Resubmitting {} spilled events...", spilled.len());

            let mut by_index: BTreeMap<String, Vec<IndexedEvent>> = BTreeMap::new();
            for s in spilled {
                by_index.entry(s.index).or_default().push(s.event);
            }
            for (index, events) in by_index {
                ship(&settings, &conn, &index, events).await?;
            }
            println!("{} events remain queued.", db::spill_count(&conn)?);
            Ok(())
        }
        Commands::Stats => {
            let conn = open_store(&settings)?;
            let rows = db::fetch_last_run(&conn)?;
            if rows.is_empty() {
                println!("No runs recorded. Run 'check' first.");
            } else {
                println!("Last run: {}", rows[0].run_id);
                println!("{:<40} | {:<20} | {:<9} | {:>8} | {:>13}", "Source", "Host", "Status", "Verdicts", "Non-compliant");
                println!("{}", "-".repeat(102));
                for r in &rows {
                    println!(
                        "{:<40} | {:<20} | {:<9} | {:>8} | {:>13}",
                        truncate(&r.source, 40),
                        truncate(r.hostname.as_deref().unwrap_or("-"), 20),
                        r.status,
                        r.verdicts,
                        r.non_compliant
                    );
                    if let Some(reason) = &r.reason {
                        println!("    {}", reason);
                    }
                }
            }
            println!("\nSpill queue: {}", db::spill_count(&conn)?);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn load_template(path: Option<&Path>) -> anyhow::Result<Template> {
    let text = match path {
        Some(p) => std::fs::read_to_string(p).with_context(|| format!("Failed to read template {:?}", p))?,
        None => dot1x::TEMPLATE.to_string(),
    };
    let template = Template::compile(&text).context("Template does not compile")?;
    for group in template.groups() {
        debug!("group '{}' (line {}): {}", group.name, group.line, group.start.source);
    }
    Ok(template)
}

fn open_store(settings: &Settings) -> anyhow::Result<Connection> {
    let conn = db::connect(&settings.db_path)?;
    db::init_schema(&conn)?;
    Ok(conn)
}

async fn ship(
    settings: &Settings,
    conn: &Connection,
    index: &str,
    events: Vec<IndexedEvent>,
) -> anyhow::Result<()> {
    if events.is_empty() {
        println!("Nothing to index into {}.", index);
        return Ok(());
    }
    let connect = || -> anyhow::Result<ElasticBackend> {
        Ok(ElasticBackend::new(settings.es_host()?, settings.credentials(), settings.timeout)?)
    };
    let report = index::ship(connect, settings.retry_policy(), conn, index, events).await?;

    println!(
        "Indexed into {}: {} submitted, {} accepted, {} spilled.",
        index,
        report.submitted,
        report.accepted.len(),
        report.spilled
    );
    for e in report.errors.iter().take(5) {
        println!("  error: {}", e);
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
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
