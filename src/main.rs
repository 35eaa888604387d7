use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use redis_record::capture::{self, CaptureService, CaptureState, Capturer};
use redis_record::container::LogContainer;
use redis_record::event::COMMAND_CHANNEL_PREFIX;
use redis_record::replay::Replayer;
use redis_record::store::{Connector, MemoryStore, RedisConnector};
use redis_record::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "redis-record")]
#[command(about = "Record Redis streams and commands, replay them with their original timing", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, global = true, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record until interrupted
    Record {
        name: String,
        /// Stream names or patterns; replaces the configured list
        #[arg(long, value_delimiter = ',')]
        streams: Vec<String>,
        /// Also capture executed commands
        #[arg(long)]
        firehose: bool,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Record whatever the control key asks for
    Serve {
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Ask a running `serve` to start recording
    Start { name: String },
    /// Ask a running `serve` to stop recording
    Stop,
    /// Replay a recording into the configured store
    Replay {
        name: String,
        #[arg(long)]
        speed: Option<f64>,
        /// Ignore recorded gaps
        #[arg(long)]
        fast: bool,
        /// Re-use recorded stream entry ids
        #[arg(long)]
        preserve_ids: bool,
        /// Replay into an in-memory store and print the commands
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// List recordings
    List {
        #[arg(long)]
        json: bool,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Show a recording's channels and counts
    Info {
        name: String,
        #[arg(long)]
        json: bool,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    let mut config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    info!(
        store = %config.store.address(),
        db = config.store.db,
        out_dir = ?config.recording.out_dir,
        "Configuration loaded"
    );

    match args.command {
        Command::Record {
            name,
            streams,
            firehose,
            out_dir,
        } => {
            if !streams.is_empty() {
                config.recording.streams = streams;
            }
            config.recording.firehose |= firehose;
            if let Some(dir) = out_dir {
                config.recording.out_dir = dir;
            }
            record(config, &name).await
        }
        Command::Serve { out_dir } => {
            if let Some(dir) = out_dir {
                config.recording.out_dir = dir;
            }
            serve(config).await
        }
        Command::Start { name } => {
            let mut conn = RedisConnector::new(config.store.clone()).connect().await?;
            let id = capture::request_start(conn.as_mut(), &config.recording.record_key, &name).await?;
            println!("requested start of '{}' ({})", name, id);
            Ok(())
        }
        Command::Stop => {
            let mut conn = RedisConnector::new(config.store.clone()).connect().await?;
            let id = capture::request_stop(conn.as_mut(), &config.recording.record_key).await?;
            println!("requested stop ({})", id);
            Ok(())
        }
        Command::Replay {
            name,
            speed,
            fast,
            preserve_ids,
            dry_run,
            out_dir,
        } => {
            if let Some(speed) = speed {
                config.replay.speed = speed;
            }
            config.replay.fast |= fast;
            config.replay.preserve_ids |= preserve_ids;
            if let Some(dir) = out_dir {
                config.recording.out_dir = dir;
            }
            replay(config, &name, dry_run).await
        }
        Command::List { json, out_dir } => {
            let container = container(&config, out_dir);
            let recordings = container.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&recordings)?);
            } else {
                for r in recordings {
                    println!(
                        "{:<32} {:>8} events {:>4} channels {:>10.3}s{}",
                        r.name,
                        r.event_count,
                        r.channel_count,
                        r.duration.as_secs_f64(),
                        if r.truncated { "  (truncated)" } else { "" }
                    );
                }
            }
            Ok(())
        }
        Command::Info { name, json, out_dir } => {
            let container = container(&config, out_dir);
            let info = container.info(&name).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("name:       {}", info.name);
                println!("source:     {}", info.source);
                println!("started:    {}", info.start_time);
                println!("duration:   {:.3}s", info.duration.as_secs_f64());
                println!("events:     {}", info.event_count);
                println!("size:       {} bytes", info.size_bytes);
                if let Some(reason) = &info.truncation_reason {
                    println!("truncated:  {}", reason);
                }
                for channel in &info.channels {
                    println!("  {:<32} {:<16} {:>8}", channel.name, channel.schema, channel.event_count);
                }
            }
            Ok(())
        }
    }
}

fn container(config: &Config, out_dir: Option<PathBuf>) -> LogContainer {
    let dir = out_dir.unwrap_or_else(|| config.recording.out_dir.clone());
    LogContainer::new(dir, config.recording.writer_options())
}

async fn record(config: Config, name: &str) -> anyhow::Result<()> {
    let connector: Arc<dyn Connector> = Arc::new(RedisConnector::new(config.store.clone()));
    let container = Arc::new(container(&config, None));
    let mut capturer = Capturer::new(
        container,
        config.recording.capture_options(connector.describe()),
    );

    let start = chrono::Utc::now();
    let sources = capture::build_sources(connector, &config.recording, start)?;
    if let Err(e) = capturer.start_at(name, start, sources).await {
        if e.is_conflict() {
            bail!("'{}' is being recorded by another writer: {}", name, e);
        }
        return Err(e.into());
    }
    info!(recording = %name, "Recording, press Ctrl+C to stop");

    let mut states = capturer.subscribe();
    let failed = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        failed = states.wait_for(|s| matches!(s, CaptureState::Failed { .. })) => {
            failed.ok().map(|s| s.clone())
        }
    };

    let summary = capturer.stop().await?;
    println!(
        "recorded '{}': {} events on {} channels over {:.3}s",
        summary.name,
        summary.events,
        summary.channels,
        summary.duration.as_secs_f64()
    );
    if let Some(CaptureState::Failed { reason, .. }) = failed {
        bail!("recording failed: {}", reason);
    }
    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let connector: Arc<dyn Connector> = Arc::new(RedisConnector::new(config.store.clone()));
    let service = CaptureService::new(connector, config.recording.clone());

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal");
            shutdown.cancel();
        }
    });

    service.serve(cancel).await?;
    info!("Capture service stopped");
    Ok(())
}

async fn replay(config: Config, name: &str, dry_run: bool) -> anyhow::Result<()> {
    let container = Arc::new(container(&config, None));
    let memory = MemoryStore::new();
    let target: Arc<dyn Connector> = if dry_run {
        Arc::new(memory.clone())
    } else {
        Arc::new(RedisConnector::new(config.store.clone()))
    };

    let session = Replayer::new(container)
        .start(name, target, config.replay.options())
        .await?;

    let mut states = session.subscribe();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!(recording = %name, "Interrupted, stopping replay");
            session.stop();
        }
        _ = states.wait_for(|s| s.is_terminal()) => {}
    }
    let report = session.wait().await?;

    if dry_run {
        for invoked in memory.commands().iter().skip(1) {
            println!("{}", invoked.command);
        }
    }
    for failure in &report.failures {
        error!(
            index = failure.index,
            channel = %failure.channel,
            error = %failure.error,
            "Event not applied"
        );
    }
    println!(
        "replayed '{}': {}/{} events emitted, {} failed, {:?} in {:.3}s{}",
        report.name,
        report.emitted,
        report.total,
        report.failures.len(),
        report.state,
        report.elapsed.as_secs_f64(),
        if report.truncated { " (recording truncated)" } else { "" }
    );
    if report.failures.iter().any(|f| f.channel.starts_with(COMMAND_CHANNEL_PREFIX)) {
        info!("Failed commands are re-issued verbatim; check the target's state");
    }
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("redis_record=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("redis_record=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
