use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use logwarden::api::state::AppState;
use logwarden::config::{parse_duration, EngineConfig, CONFIG_ENV};
use logwarden::event::{EventInput, TimeRange};
use logwarden::query::{Pipeline, QueryOptions};
use logwarden::scheduler::DetectionRunner;

#[derive(Parser)]
#[command(
    name = "logwarden",
    about = "Self-hosted log analytics and anomaly detection",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $LOGWARDEN_CONFIG, then /etc/logwarden/logwarden.toml)
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct RangeArgs {
    /// Range start (RFC 3339)
    #[arg(long)]
    from: Option<DateTime<Utc>>,

    /// Range end (RFC 3339), defaults to now
    #[arg(long)]
    to: Option<DateTime<Utc>>,

    /// Lookback from the range end when --from is omitted
    #[arg(long, default_value = "1h")]
    last: String,
}

impl RangeArgs {
    fn range(&self) -> Result<TimeRange> {
        let end = self.to.unwrap_or_else(Utc::now);
        let start = match self.from {
            Some(start) => start,
            None => {
                let lookback = parse_duration(&self.last).map_err(anyhow::Error::msg)?;
                end - chrono::Duration::from_std(lookback)?
            }
        };
        Ok(TimeRange::new(start, end)?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler + retention sweep)
    Serve {
        /// Bind address, overriding [api] bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Ingest events from a JSON-lines file ("-" for stdin)
    Ingest {
        file: String,
    },

    /// Run a pipeline and print the result as JSON
    Query {
        /// Pipeline descriptor: inline JSON or a .json/.toml file
        #[arg(long)]
        pipeline: String,

        #[command(flatten)]
        range: RangeArgs,
    },

    /// Summarize, score a metric and print anomaly records
    Detect {
        #[arg(long)]
        pipeline: String,

        /// Metric column to score
        #[arg(long, default_value = "count")]
        metric: String,

        /// Baseline family to score against (e.g. a detection job name)
        #[arg(long)]
        source: Option<String>,

        #[command(flatten)]
        range: RangeArgs,
    },

    /// Validate the configuration and print a summary
    CheckConfig,

    /// Inspect scheduled detection jobs
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List configured detection jobs
    List,

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(p) => EngineConfig::load(p),
        None => Ok(EngineConfig::load_or_default()),
    }
}

fn load_pipeline(arg: &str) -> Result<Pipeline> {
    let trimmed = arg.trim_start();
    if trimmed.starts_with('{') {
        return serde_json::from_str(trimmed).context("invalid inline pipeline JSON");
    }
    let content = std::fs::read_to_string(arg)
        .with_context(|| format!("failed to read pipeline file: {arg}"))?;
    if arg.ends_with(".toml") {
        toml::from_str(&content).with_context(|| format!("invalid pipeline TOML in {arg}"))
    } else {
        serde_json::from_str(&content).with_context(|| format!("invalid pipeline JSON in {arg}"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    // Initialize tracing
    logwarden::init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting Logwarden daemon");
            logwarden::serve(config).await?;
        }
        Commands::Ingest { file } => {
            let state = AppState::from_config(config)?;
            let reader: Box<dyn BufRead> = if file == "-" {
                Box::new(std::io::stdin().lock())
            } else {
                let f = std::fs::File::open(&file)
                    .with_context(|| format!("failed to open {file}"))?;
                Box::new(std::io::BufReader::new(f))
            };

            let timeout = state.config.engine.ingest_timeout;
            let (mut accepted, mut rejected) = (0usize, 0usize);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let result = match serde_json::from_str::<EventInput>(&line) {
                    Ok(input) => state.ingestor.submit(input, timeout).await,
                    Err(e) => Err(e.into()),
                };
                match result {
                    Ok(_) => accepted += 1,
                    Err(e) => {
                        rejected += 1;
                        eprintln!("line {}: {}", lineno + 1, e);
                    }
                }
            }
            println!("Ingested {accepted} events ({rejected} rejected).");
        }
        Commands::Query { pipeline, range } => {
            let pipeline = load_pipeline(&pipeline)?;
            let range = range.range()?;
            let state = AppState::from_config(config)?;
            let output = state
                .engine()
                .run(
                    pipeline,
                    range,
                    QueryOptions::with_timeout(state.config.engine.query_timeout),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Detect {
            pipeline,
            metric,
            source,
            range,
        } => {
            let pipeline = load_pipeline(&pipeline)?;
            let range = range.range()?;
            let source = source.unwrap_or_else(|| DetectionRunner::adhoc_source(&pipeline));
            let state = AppState::from_config(config)?;
            let outcome = state
                .runner
                .run(pipeline, range, &source, &metric, Utc::now())
                .await?;

            println!("{:<24} | {:<20} | {:>10} | {:>8} | Decision", "Window", "Entity", "Observed", "Score");
            println!("{:-<24}-|-{:-<20}-|-{:-<10}-|-{:-<8}-|-{:-<20}", "", "", "", "", "");
            for r in &outcome.records {
                println!(
                    "{:<24} | {:<20} | {:>10.2} | {:>8} | {:?}",
                    r.window_start.to_rfc3339(),
                    r.series.entity,
                    r.observed,
                    r.score.map_or_else(|| "-".to_string(), |s| format!("{s:.2}")),
                    r.decision
                );
            }
            println!(
                "\n{} anomalies, {} alerts fired.",
                outcome.anomalies(),
                outcome.alerts.len()
            );
        }
        Commands::CheckConfig => {
            config.validate()?;
            println!("Configuration OK");
            println!("  journal:     {}", config
                .storage
                .journal_path
                .as_ref()
                .map_or_else(|| "(in memory)".to_string(), |p| p.display().to_string()));
            println!("  retention:   {} days", config.storage.retention_days);
            println!(
                "  bucket size: {}",
                logwarden::config::format_duration(&config.engine.bucket_size)
            );
            println!("  threshold:   {}", config.engine.anomaly_threshold);
            println!("  rules:       {}", config.rules.len());
            println!("  channels:    {}", config.channels.len());
            println!("  detections:  {}", config.detections.len());
            for rule in &config.rules {
                if !config.channels.iter().any(|c| c.name == rule.channel) {
                    bail!("rule '{}' targets unknown channel '{}'", rule.id, rule.channel);
                }
            }
        }
        Commands::Schedule { action } => {
            let scheduler = logwarden::scheduler::Scheduler::new(config.detections.clone(), Utc::now())?;
            match action {
                ScheduleAction::List => {
                    let jobs = scheduler.jobs();
                    if jobs.is_empty() {
                        println!("No detection jobs configured.");
                    } else {
                        println!("{:<20} | {:<18} | {:<10} | Lookback", "Name", "Cron", "Metric");
                        println!("{:-<20}-|-{:-<18}-|-{:-<10}-|-{:-<8}", "", "", "", "");
                        for job in jobs {
                            println!(
                                "{:<20} | {:<18} | {:<10} | {}",
                                job.name,
                                job.cron,
                                job.metric,
                                logwarden::config::format_duration(&job.lookback)
                            );
                        }
                    }
                }
                ScheduleAction::DryRun { hours } => {
                    let preview = scheduler.preview_next_runs(Utc::now(), hours);
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for (time, name) in preview {
                            println!("{} : {}", time.to_rfc3339(), name);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
