use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use liblsmux::{Config, Session};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(version, author, about)]
struct Opts {
    /// Config files. Later files override scalar options and extend the
    /// connection list.
    #[arg(short = 'c', long = "config", required = true, env = "LSMUX_CONFIG")]
    config: Vec<PathBuf>,

    /// The console loglevel.
    #[arg(value_enum, short = 'v', long = "log-level", env = "LSMUX_LOG_LEVEL")]
    log_level: Option<LogLevel>,

    /// A log file to also write to (json lines) in addition to the console.
    #[arg(long = "log-file", env = "LSMUX_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Set this flag if you want to use tokio's single threaded runtime.
    /// It MAY perform better, but the main purpose is easier debugging, as
    /// time profilers work better with this one.
    #[arg(short, long, env = "LSMUX_SINGLE_THREAD_RUNTIME")]
    single_thread_runtime: bool,

    /// How many threads to spawn for the executor.
    #[arg(short = 't', long, env = "LSMUX_RUNTIME_WORKER_THREADS")]
    worker_threads: Option<usize>,
}

fn init_logging(opts: &Opts) -> anyhow::Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let default_directive = opts.log_level.map(|l| l.as_str()).unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    match &opts.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("error opening log file {}", path.display()))?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        None => registry.init(),
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    init_logging(&opts)?;

    let config = Config::from_files(&opts.config).context("error loading configuration")?;
    if config.listen.is_empty() {
        anyhow::bail!("no Listen endpoints configured");
    }
    if config.connections.is_empty() {
        warn!("no Connections configured, serving an empty site");
    }

    let mut builder = if opts.single_thread_runtime {
        tokio::runtime::Builder::new_current_thread()
    } else {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        if let Some(threads) = opts.worker_threads {
            builder.worker_threads(threads);
        }
        builder
    };
    let rt = builder.enable_all().build().context("error building runtime")?;
    rt.block_on(async_main(opts, config))
}

async fn async_main(opts: Opts, config: Config) -> anyhow::Result<()> {
    let session = Session::new(config).context("error creating session")?;
    session.start().await.context("error starting session")?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, reloading configuration");
                match Config::from_files(&opts.config) {
                    Ok(new_config) => {
                        if let Err(e) = session.reload(new_config).await {
                            error!("reload failed, keeping running configuration: {e:#}");
                        }
                    }
                    Err(e) => {
                        error!("reload failed, keeping running configuration: {e:#}");
                    }
                }
            }
            _ = sigusr1.recv() => {
                session.dump_state();
            }
        }
    }

    session.stop().await;
    info!("bye");
    Ok(())
}
