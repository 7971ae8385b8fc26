use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use frame_settings::SettingsStore;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

use photoframe_svc::cache::CacheManager;
use photoframe_svc::colormatch::{self, ColorMatcher, ColorSensor, FileColorSensor, NoSensor};
use photoframe_svc::config::Configuration;
use photoframe_svc::display::{DisplayAdapter, default_runner};
use photoframe_svc::event_log::EventLog;
use photoframe_svc::events::SlideshowEvent;
use photoframe_svc::history::ImageHistory;
use photoframe_svc::network::HttpClient;
use photoframe_svc::power::{self, PowerArbiter};
use photoframe_svc::provider_manager::ProviderManager;
use photoframe_svc::providers::ProviderContext;
use photoframe_svc::settings::SharedSettings;
use photoframe_svc::slideshow::{SharedCurrent, Slideshow, SlideshowParts};
use photoframe_svc::web::{self, AppState};

const EVENT_CAPACITY: usize = 100;
const EXIT_UNREADABLE: u8 = 1;
const EXIT_INVALID: u8 = 255;

#[derive(Debug, Parser)]
#[command(name = "photoframe", version, about = "networked photo frame service")]
struct Args {
    /// Path to YAML config
    #[arg(value_name = "CONFIG")]
    config: PathBuf,
    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
    /// Validate configuration and the base directory, then exit
    #[arg(long)]
    check: bool,
    /// Override the configured bind address of the control plane
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,
}

fn init_tracing(verbose: u8) {
    let fallback = match verbose {
        0 => "info",
        1 => "info,photoframe_svc=debug",
        _ => "info,photoframe_svc=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false)
        .compact()
        .init();
}

/// Makes sure the state directories exist and are writable.
fn prepare_dirs(cfg: &Configuration) -> Result<()> {
    for dir in [
        cfg.config_dir(),
        cfg.services_dir(),
        cfg.cache_dir(),
        cfg.history_dir(),
        cfg.temp_dir.clone(),
    ] {
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let probe = cfg.base_dir.join(".write-test");
    fs::write(&probe, b"ok")
        .with_context(|| format!("base directory {} is not writable", cfg.base_dir.display()))?;
    fs::remove_file(&probe).with_context(|| format!("failed to remove {}", probe.display()))?;
    Ok(())
}

fn check(config: &Path) -> ExitCode {
    if let Err(err) = fs::metadata(config) {
        eprintln!("cannot read {}: {err}", config.display());
        return ExitCode::from(EXIT_UNREADABLE);
    }
    let result = Configuration::from_yaml_file(config)
        .with_context(|| format!("failed to parse {}", config.display()))
        .and_then(|cfg| cfg.validated().context("invalid configuration values"))
        .and_then(|cfg| prepare_dirs(&cfg));
    match result {
        Ok(()) => {
            println!("{}: ok", config.display());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(EXIT_INVALID)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let Args {
        config,
        verbose,
        check: check_only,
        listen,
    } = Args::parse();
    init_tracing(verbose);

    if check_only {
        return Ok(check(&config));
    }

    let mut cfg = Configuration::from_yaml_file(&config)
        .with_context(|| format!("failed to load configuration from {}", config.display()))?
        .validated()
        .context("invalid configuration values")?;
    if let Some(addr) = listen {
        cfg.bind_address = addr;
    }
    tracing::debug!("loaded configuration from {}:\n{:#?}", config.display(), cfg);
    prepare_dirs(&cfg)?;

    let mut store = SettingsStore::load(cfg.settings_path())?;
    store.snapshot().validate().context("invalid user settings")?;
    let events = Arc::new(EventLog::with_capacity(EVENT_CAPACITY));
    let http = HttpClient::new(&cfg.http)?;
    let ctx = ProviderContext::new(&cfg, http, events.clone());
    let mut manager = ProviderManager::load(cfg.config_dir(), cfg.services_dir(), ctx)?;
    if manager.migrate_legacy(&mut store).await? {
        events.info("Imported the previous Google Photos configuration");
    }
    manager
        .set_refresh_hours(store.snapshot().refresh_content_hours)
        .await;
    let settings = SharedSettings::new(store);
    let manager = Arc::new(Mutex::new(manager));

    let cache = Arc::new(CacheManager::new(cfg.cache_dir())?);
    let history = ImageHistory::new(cfg.history_dir())?;
    let display = DisplayAdapter::new(cfg.display.clone())?;
    let matcher = ColorMatcher::new(cfg.colormatch.script.clone());
    let (colour_tx, colour_rx) = watch::channel(None);
    let (inbox_tx, inbox_rx) = mpsc::channel::<SlideshowEvent>(32);
    let arbiter = Arc::new(PowerArbiter::new(inbox_tx.clone()));
    let schedule_wake = Arc::new(Notify::new());
    let current = SharedCurrent::default();

    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            tracing::info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        let arbiter = arbiter.clone();
        tokio::spawn(async move {
            match signal(SignalKind::user_defined1()) {
                Ok(mut sigusr1) => loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = sigusr1.recv() => {
                            if received.is_none() {
                                break;
                            }
                            match arbiter.toggle_manual().await {
                                Ok(standby) => tracing::info!(standby, "SIGUSR1 received; toggled manual standby"),
                                Err(err) => {
                                    tracing::warn!("failed to toggle manual standby: {err:#}");
                                    break;
                                }
                            }
                        }
                    }
                },
                Err(err) => tracing::warn!("failed to register SIGUSR1 handler: {err}"),
            }
        });
    }

    let mut tasks = JoinSet::new();

    // Slideshow
    tasks.spawn({
        let parts = SlideshowParts {
            settings: settings.clone(),
            manager: manager.clone(),
            cache: cache.clone(),
            history,
            events: events.clone(),
            display: display.clone(),
            matcher,
            colour: colour_rx.clone(),
            inbox: inbox_rx,
            current: current.clone(),
            work_dir: cfg.temp_dir.clone(),
            supported_mimes: cfg.supported_mime_types.clone(),
            greeting: Some(format!(
                "Photo frame starting\nConfigure it on port {}",
                cfg.bind_address.port()
            )),
        };
        let cancel = cancel.clone();
        async move {
            Slideshow::new(parts)?
                .run(cancel)
                .await
                .context("slideshow task failed")
        }
    });

    // Control plane
    tasks.spawn({
        let state = AppState {
            settings: settings.clone(),
            manager: manager.clone(),
            events: events.clone(),
            cache: cache.clone(),
            arbiter: arbiter.clone(),
            schedule: schedule_wake.clone(),
            display: display.clone(),
            current,
            colour: colour_rx.clone(),
            inbox: inbox_tx.clone(),
            runner: default_runner(),
            maintenance: cfg.maintenance.clone(),
            redirect_uri: cfg.oauth_redirect_uri.clone(),
            static_dir: cfg.static_dir.clone(),
        };
        let addr = cfg.bind_address;
        let cancel = cancel.clone();
        async move { web::run(addr, state, cancel).await.context("web task failed") }
    });

    // Schedule watcher
    tasks.spawn({
        let settings = settings.clone();
        let arbiter = arbiter.clone();
        let cancel = cancel.clone();
        async move {
            power::schedule::run(settings, arbiter, schedule_wake, cancel)
                .await
                .context("schedule task failed")
        }
    });

    // Ambient light watcher
    tasks.spawn({
        let settings = settings.clone();
        let arbiter = arbiter.clone();
        let cancel = cancel.clone();
        async move {
            power::ambient::run(settings, arbiter, colour_rx, cancel)
                .await
                .context("ambient task failed")
        }
    });

    // Motion watcher
    tasks.spawn({
        let motion = cfg.motion.clone();
        let arbiter = arbiter.clone();
        let cancel = cancel.clone();
        async move {
            power::motion::run(motion, arbiter, cancel)
                .await
                .context("motion task failed")
        }
    });

    // Colour sampler
    tasks.spawn({
        let sensor: Box<dyn ColorSensor> = match &cfg.colormatch.sensor_path {
            Some(path) => Box::new(FileColorSensor::new(path)),
            None => Box::new(NoSensor),
        };
        let interval = cfg.colormatch.sample_interval;
        let cancel = cancel.clone();
        async move {
            colormatch::run(sensor, interval, colour_tx, cancel)
                .await
                .context("colour task failed")
        }
    });
    drop(inbox_tx);

    // Watchers that have nothing to watch return early; only failures stop the frame.
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("task error: {e:?}");
                cancel.cancel();
            }
            Err(e) => {
                tracing::error!("join error: {e}");
                cancel.cancel();
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
