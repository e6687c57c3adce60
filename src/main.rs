// ABOUTME: CLI entry point for watermark-sync
// ABOUTME: Parses commands and routes to run, check, or resolve

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use watermark_sync::config::{OutputKind, SyncConfig, ValidatedConfig};
use watermark_sync::destination::ElasticsearchClient;
use watermark_sync::emit::{ElasticsearchSink, EventEmitter, EventSink, JsonLinesSink};
use watermark_sync::source::PostgresSource;
use watermark_sync::sync::{CycleScheduler, SyncCycle, Trigger};
use watermark_sync::utils::sanitize_url;
use watermark_sync::watermark::{ResolvedWatermark, WatermarkResolver};

#[derive(Parser)]
#[command(name = "watermark-sync")]
#[command(
    about = "Incremental PostgreSQL to Elasticsearch sync driven by a destination watermark",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler and sync until stopped (Ctrl+C stops after the current cycle)
    Run {
        /// Path to the TOML configuration file
        #[arg(long)]
        config: PathBuf,
        /// Run a single cycle regardless of the configured schedule
        #[arg(long)]
        once: bool,
    },
    /// Validate the configuration and print what would run
    Check {
        #[arg(long)]
        config: PathBuf,
    },
    /// Resolve the current watermark from the destination and print it
    Resolve {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Run { config, once } => {
            let mut validated = load_config(&config)?;
            if once {
                validated.trigger = Trigger::Once;
            }
            run(validated).await
        }
        Commands::Check { config } => {
            let validated = load_config(&config)?;
            print_summary(&validated);
            Ok(())
        }
        Commands::Resolve { config } => {
            let validated = load_config(&config)?;
            resolve(validated).await
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<ValidatedConfig> {
    let config = SyncConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    let validated = config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(validated)
}

fn build_resolver(
    config: &ValidatedConfig,
) -> anyhow::Result<(ElasticsearchClient, WatermarkResolver<ElasticsearchClient>)> {
    let client = ElasticsearchClient::new(config.client.clone())?;
    let resolver =
        WatermarkResolver::new(client.clone(), config.watermark.clone(), config.min_health);
    Ok((client, resolver))
}

async fn run(config: ValidatedConfig) -> anyhow::Result<()> {
    let (client, resolver) = build_resolver(&config)?;

    tracing::info!("Connecting to source {}", sanitize_url(&config.source_url));
    let source = PostgresSource::connect(&config.source_url, config.source_options.clone())
        .await
        .context("Failed to connect to source database")?;

    let sink: Box<dyn EventSink> = match config.output {
        OutputKind::Elasticsearch => Box::new(ElasticsearchSink::new(
            client,
            config.watermark.index.clone(),
            config.watermark.category.clone(),
            config.document_id_field.clone(),
        )),
        OutputKind::Stdout => Box::new(JsonLinesSink::stdout()),
    };

    tracing::info!(
        "Syncing into {} index {} by field {}",
        sanitize_url(config.watermark.endpoint.as_str()),
        config.watermark.index,
        config.watermark.field
    );

    let cycle = SyncCycle::new(resolver, config.binder, source, EventEmitter::new(sink));
    let handle = CycleScheduler::new(config.trigger, config.overlap)
        .with_max_consecutive_aborts(config.max_consecutive_aborts)
        .start(cycle);

    // Set up Ctrl+C handler
    let stop = handle.stop_signal();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal, finishing current cycle");
                stop.stop();
            }
            Err(e) => tracing::warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    let report = handle.wait().await?;
    if report.cycles_failed > 0 || report.cycles_aborted > 0 {
        tracing::warn!(
            "{} of {} cycles did not complete",
            report.cycles_failed + report.cycles_aborted,
            report.cycles_run
        );
    }
    Ok(())
}

async fn resolve(config: ValidatedConfig) -> anyhow::Result<()> {
    let (_, resolver) = build_resolver(&config)?;
    match resolver.resolve().await {
        ResolvedWatermark::Fresh => println!(
            "fresh (no prior data; initial watermark would be used)"
        ),
        ResolvedWatermark::Value(v) => println!("{}", v),
        ResolvedWatermark::Abort(reason) => {
            anyhow::bail!("Resolution aborted during {}: {}", reason.phase(), reason)
        }
    }
    Ok(())
}

fn print_summary(config: &ValidatedConfig) {
    let template = config.binder.template();
    println!("Configuration OK");
    println!("  source:       {}", sanitize_url(&config.source_url));
    println!(
        "  statement:    {} parameter slot(s), watermark {}",
        template.slots().len(),
        if template.references_watermark() {
            "referenced"
        } else {
            "NOT referenced"
        }
    );
    println!("  fetch size:   {}", config.source_options.fetch_size);
    println!(
        "  destination:  {}",
        sanitize_url(config.watermark.endpoint.as_str())
    );
    println!("  index:        {}", config.watermark.index);
    println!("  watermark:    {}", config.watermark.field);
    if let Some(category) = &config.watermark.category {
        println!("  category:     {} = {}", category.field, category.value);
    }
    println!("  min health:   {}", config.min_health);
    println!("  trigger:      {}", config.trigger);
    println!("  overlap:      {:?}", config.overlap);
    match config.max_consecutive_aborts {
        Some(n) => println!("  abort limit:  {} consecutive", n),
        None => println!("  abort limit:  none"),
    }
    println!("  output:       {:?}", config.output);
}
