//! gguf-tracker - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gguf_tracker::error::TrackerError;
use gguf_tracker::ledger::Ledger;
use gguf_tracker::models::cache::validate_model_name;
use gguf_tracker::models::hub::{HubPull, pull_gguf};
use gguf_tracker::{
    ModelStatus, TrackedModel, Tracker, TrackerConfig, UpdateOutcome, metrics,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal;
use tokio::time::{Instant, Interval};

/// How often `serve` restarts servers that exited on their own
const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "gguf-tracker")]
#[command(about = "Registry-aware GGUF model synchronizer and llama-server manager", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default configuration file and create an empty ledger
    Init {
        #[arg(long, default_value = "gguf-tracker.toml")]
        output: PathBuf,

        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Track a model and download its aliased version
    AddModel {
        name: String,

        #[arg(long, default_value = "champion")]
        alias: String,

        /// Artifact sub-path inside the run
        #[arg(long, default_value = "model_path")]
        artifact_path: String,

        #[arg(long)]
        local_dir: Option<PathBuf>,

        /// Download even if the local copy is current
        #[arg(long)]
        force: bool,
    },

    /// Compare local copies with the registry
    Status {
        /// Single model; all tracked models when omitted
        name: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Bring every tracked model up to its aliased version
    Update {
        #[arg(long)]
        json: bool,
    },

    /// Forget a model and remove its files
    Delete { name: String },

    /// Synchronize and serve models until interrupted
    Serve {
        /// Models to serve; all tracked models when omitted
        models: Vec<String>,

        /// Alias to serve instead of the tracked one
        #[arg(long)]
        alias: Option<String>,

        /// Port override, only with a single model
        #[arg(long)]
        port: Option<u16>,

        /// Serve the local copy even when it is stale
        #[arg(long)]
        no_download: bool,

        /// Re-check the registry and hot-swap updated models at this interval
        #[arg(long)]
        watch_secs: Option<u64>,

        /// Expose Prometheus metrics on this address
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,
    },

    /// Stop a server started by another `serve` process
    Stop {
        name: String,

        /// Seconds to wait before SIGKILL; configured value when omitted
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Download a GGUF file from the Hugging Face Hub into the serving layout
    PullHf {
        repo_id: String,

        /// Exact file in the repository
        #[arg(long)]
        file: Option<String>,

        #[arg(long)]
        revision: Option<String>,

        /// Target directory; `<models_root>/<repo>` when omitted
        #[arg(long)]
        dest: Option<PathBuf>,

        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging; stdout is reserved for command output
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// Exit code of the first `TrackerError` in the chain, 1 otherwise
fn exit_code_for(error: &anyhow::Error) -> u8 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<TrackerError>())
        .and_then(|e| u8::try_from(e.exit_code()).ok())
        .unwrap_or(1)
}

fn load_config(path: Option<PathBuf>) -> Result<TrackerConfig> {
    let config = TrackerConfig::load(path)?;
    config.validate()?;

    tracing::debug!(
        ledger = ?config.ledger_path,
        models_root = ?config.models_root,
        registry = %config.registry.effective_registry_uri(),
        backend = ?config.storage.backend,
        "Configuration loaded"
    );

    Ok(config)
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Init { output, force } => init(cli.config, output, force).await,
        Command::AddModel {
            name,
            alias,
            artifact_path,
            local_dir,
            force,
        } => {
            let tracker = Tracker::from_config(load_config(cli.config)?)?;
            let model = TrackedModel {
                alias,
                artifact_path,
                local_dir,
                ..TrackedModel::new(name)
            };
            let outcome = tracker.add_model(&model, force).await?;
            if outcome.fetched {
                println!(
                    "{}: synchronized version {} ({} files, {} bytes) into {}",
                    model.name,
                    outcome.version_id,
                    outcome.files,
                    outcome.bytes,
                    outcome.local_dir.display()
                );
            } else {
                println!(
                    "{}: version {} already present in {}",
                    model.name,
                    outcome.version_id,
                    outcome.local_dir.display()
                );
            }
            for failed in &outcome.failed {
                eprintln!("  failed: {} ({})", failed.object, failed.reason);
            }
            Ok(())
        }
        Command::Status { name, json } => {
            let tracker = Tracker::from_config(load_config(cli.config)?)?;
            let statuses = match name {
                Some(name) => vec![tracker.model_status(&name).await?],
                None => tracker.status().await?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                print_status_table(&statuses);
            }
            Ok(())
        }
        Command::Update { json } => {
            let tracker = Tracker::from_config(load_config(cli.config)?)?;
            let results = tracker.update_all().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                for (name, outcome) in &results {
                    match outcome {
                        UpdateOutcome::Updated { version_id } => {
                            println!("{}: updated to {}", name, version_id)
                        }
                        UpdateOutcome::AlreadyCurrent => println!("{}: already current", name),
                        UpdateOutcome::Failed { reason } => println!("{}: FAILED {}", name, reason),
                    }
                }
            }

            let failed = results
                .values()
                .filter(|o| matches!(o, UpdateOutcome::Failed { .. }))
                .count();
            if failed > 0 {
                anyhow::bail!("{} of {} models failed to update", failed, results.len());
            }
            Ok(())
        }
        Command::Delete { name } => {
            let tracker = Tracker::from_config(load_config(cli.config)?)?;
            tracker.delete_model(&name).await?;
            println!("{}: deleted", name);
            Ok(())
        }
        Command::Serve {
            models,
            alias,
            port,
            no_download,
            watch_secs,
            metrics_addr,
        } => {
            let mut config = load_config(cli.config)?;
            if let Some(port) = port {
                let [name] = models.as_slice() else {
                    anyhow::bail!("--port requires exactly one model");
                };
                match config.models.iter_mut().find(|m| &m.name == name) {
                    Some(model) => model.port = Some(port),
                    None => config.models.push(TrackedModel {
                        port: Some(port),
                        ..TrackedModel::new(name.clone())
                    }),
                }
            }

            if metrics_addr.is_some() {
                metrics::setup_metrics(metrics_addr)?;
            }

            let tracker = Tracker::from_config(config)?;
            serve(
                &tracker,
                models,
                alias,
                !no_download,
                watch_secs.map(Duration::from_secs),
            )
            .await
        }
        Command::Stop { name, timeout_secs } => {
            let config = load_config(cli.config)?;
            let timeout = Duration::from_secs(
                timeout_secs.unwrap_or(config.server.graceful_shutdown_timeout_secs),
            );
            stop(&config, &name, timeout).await
        }
        Command::PullHf {
            repo_id,
            file,
            revision,
            dest,
            cache_dir,
        } => {
            let config = load_config(cli.config)?;
            let dest = match dest {
                Some(dest) => dest,
                None => {
                    let name = repo_id.replace('/', "--");
                    validate_model_name(&name)?;
                    config.models_root.join(name)
                }
            };
            let request = HubPull {
                repo_id,
                file,
                revision,
                dest,
                cache_dir,
                token: std::env::var("HF_TOKEN").ok(),
            };
            let path = pull_gguf(&request).await?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

async fn init(config_path: Option<PathBuf>, output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{:?} already exists, use --force to overwrite", output);
    }

    // Start from the given file (or defaults plus environment) so init can
    // also normalize an existing configuration
    let config = TrackerConfig::load(config_path)?;
    let content = toml::to_string_pretty(&config).context("Failed to serialize config")?;
    tokio::fs::write(&output, content)
        .await
        .with_context(|| format!("Failed to write config file: {:?}", output))?;

    let ledger = Ledger::new(config.ledger_path.clone());
    let tracked = ledger.list().await?;

    println!("Wrote {}", output.display());
    println!(
        "Ledger {} ({} models tracked)",
        ledger.path().display(),
        tracked.len()
    );
    Ok(())
}

fn print_status_table(statuses: &[ModelStatus]) {
    println!(
        "{:<24} {:<12} {:<34} {:<34} {:<8} {:<7} SERVING",
        "MODEL", "ALIAS", "LOCAL", "REGISTRY", "UPDATE", "FILES"
    );
    for status in statuses {
        let update = match status.needs_update {
            Some(true) => "yes",
            Some(false) => "no",
            None => "error",
        };
        let serving = match &status.serving {
            Some(s) if s.running => format!("port {}", s.port),
            Some(_) => "stopped".to_string(),
            None => "-".to_string(),
        };
        println!(
            "{:<24} {:<12} {:<34} {:<34} {:<8} {:<7} {}",
            status.model_name,
            status.alias,
            status.local_version.as_deref().unwrap_or("-"),
            status.registry_version.as_deref().unwrap_or("-"),
            update,
            if status.local_available { "yes" } else { "no" },
            serving
        );
        if let Some(error) = &status.check_error {
            println!("  check failed: {}", error);
        }
    }
}

/// Foreground supervisor for `serve`
async fn serve(
    tracker: &Tracker,
    models: Vec<String>,
    alias: Option<String>,
    download: bool,
    watch: Option<Duration>,
) -> Result<()> {
    let models = if models.is_empty() {
        tracker.list_models().await?
    } else {
        models
    };
    if models.is_empty() {
        anyhow::bail!("No models tracked; add one with `add-model` or list them in the config");
    }

    let mut aliases = Vec::with_capacity(models.len());
    for name in &models {
        let alias = match &alias {
            Some(alias) => alias.clone(),
            None => tracker.alias_for(name).await?,
        };
        aliases.push((name.clone(), alias));
    }

    let mut started = 0;
    for (name, alias) in &aliases {
        match tracker.ensure_model(name, alias, download).await {
            Ok(outcome) => {
                started += 1;
                println!(
                    "{}: serving {} on port {}",
                    name,
                    outcome.version_id.as_deref().unwrap_or("local copy"),
                    outcome.serving.port
                );
            }
            Err(e) => tracing::error!(model = %name, error = %e, "Failed to serve model"),
        }
    }
    if started == 0 {
        anyhow::bail!("None of the requested models could be served");
    }

    let mut watch_timer = watch.map(|period| tokio::time::interval_at(Instant::now() + period, period));
    let mut liveness = tokio::time::interval_at(Instant::now() + LIVENESS_INTERVAL, LIVENESS_INTERVAL);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = next_tick(&mut watch_timer) => {
                for (name, alias) in &aliases {
                    match tracker.ensure_model(name, alias, true).await {
                        Ok(outcome) if outcome.synced => tracing::info!(
                            model = %name,
                            version = ?outcome.version_id,
                            "Model updated and server replaced"
                        ),
                        Ok(_) => {}
                        Err(e) => tracing::error!(model = %name, error = %e, "Watch update failed"),
                    }
                }
            }
            _ = liveness.tick() => {
                let restarted = tracker.serve_manager().restart_crashed().await;
                if !restarted.is_empty() {
                    tracing::info!(models = ?restarted, "Restarted crashed servers");
                }
            }
        }
    }

    tracing::info!("Shutting down...");
    let stopped = tracker.shutdown().await;
    tracing::info!(stopped, "Shutdown complete");

    Ok(())
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(unix)]
async fn stop(config: &TrackerConfig, name: &str, timeout: Duration) -> Result<()> {
    if !gguf_tracker::instance::stop_by_pid_file(&config.server.run_dir, name, timeout).await? {
        return Err(TrackerError::ModelNotFound(name.to_string()))
            .context("No running server recorded for this model");
    }
    println!("{}: stopped", name);
    Ok(())
}

#[cfg(not(unix))]
async fn stop(_config: &TrackerConfig, _name: &str, _timeout: Duration) -> Result<()> {
    anyhow::bail!("stop is only supported on Unix")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
