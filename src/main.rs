// src/main.rs - Winder host entry point
use apa_winder::config::{self, Config, ConfigError};
use apa_winder::file_manager::{FileManager, FileManagerError};
use apa_winder::machine::{ControlLoop, Machine, MachineError};
use apa_winder::motion::MotionQueue;
use apa_winder::plc::{PlcAdapter, PlcDriver, PlcLogic, PlcStatusHandle};
use apa_winder::simulator::SimulatedPlc;
use apa_winder::web::UiServer;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};

#[derive(Debug, Parser)]
#[command(name = "winder-host", version, about = "APA wire winder control host")]
struct Args {
    /// Configuration file.
    #[arg(short, long, default_value = "configuration.toml")]
    config: PathBuf,
    /// Overrides `machine.data_dir`.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Overrides `ui.port`.
    #[arg(long)]
    port: Option<u16>,
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

#[derive(Debug, Error)]
enum HostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Data directory error: {0}")]
    Files(#[from] FileManagerError),
    #[error("Could not open the UI channel: {0}")]
    Bind(std::io::Error),
    #[error("Startup failed: {0}")]
    Startup(MachineError),
    #[error("PLC unavailable: {0}")]
    Plc(String),
    #[error("Control loop failed: {0}")]
    Machine(#[from] MachineError),
    #[error("Task crashed: {0}")]
    Task(#[from] JoinError),
}

impl HostError {
    fn exit_code(&self) -> ExitCode {
        match self {
            HostError::Config(_) | HostError::Files(_) | HostError::Bind(_) | HostError::Startup(_) => ExitCode::from(1),
            HostError::Plc(_) => ExitCode::from(2),
            HostError::Machine(_) | HostError::Task(_) => ExitCode::from(3),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    tracing::info!("Starting APA winder host");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Loading configuration from: {}", args.config.display());

    let config = match load(&args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config from '{}': {}", args.config.display(), e);
            return e.exit_code();
        }
    };

    match run(config).await {
        Ok(()) => {
            tracing::info!("Winder host stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{}", e);
            e.exit_code()
        }
    }
}

fn load(args: &Args) -> Result<Config, HostError> {
    let mut config = config::load_config(&args.config)?;
    if let Some(data_dir) = &args.data_dir {
        config.machine.data_dir = data_dir.clone();
    }
    if let Some(port) = args.port {
        config.ui.port = port;
    }
    tracing::info!("APA: {}", config.machine.apa_name);
    tracing::info!("Data directory: {}", config.machine.data_dir.display());
    tracing::info!("I/O period: {} ms, PLC timeout: {} ms", config.machine.io_period_ms, config.machine.plc_timeout_ms);
    Ok(config)
}

async fn run(config: Config) -> Result<(), HostError> {
    let files = FileManager::new(&config.machine.data_dir);
    files.ensure_layout()?;

    if !config.plc.simulated {
        return Err(HostError::Plc("no PLC adapter is available; set plc.simulated = true".to_string()));
    }
    tracing::info!("Using the simulated PLC ({} polls per move)", config.plc.completion_polls);
    let adapter: Arc<dyn PlcAdapter> = Arc::new(SimulatedPlc::new(config.plc.completion_polls));
    let mut logic = PlcLogic::new(adapter, config.machine.plc_timeout());
    let status = PlcStatusHandle::new();
    status.publish(logic.poll().await.map_err(|e| HostError::Plc(e.to_string()))?);

    let queue = MotionQueue::new(config.machine.queue_capacity);
    let driver = PlcDriver::new(logic, queue.clone(), status.clone(), config.machine.io_period())
        .with_move_timeout(config.machine.move_timeout());

    let mut machine = Machine::new(&config, files, queue, status).map_err(HostError::Startup)?;
    machine.boot().map_err(HostError::Startup)?;

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(4);
    let (mailbox_tx, mailbox_rx) = mpsc::channel(32);
    let control = ControlLoop::new(machine, mailbox_rx, shutdown_tx.clone(), config.machine.io_period());
    let listener = TcpListener::bind((config.ui.bind_address.as_str(), config.ui.port))
        .await
        .map_err(HostError::Bind)?;
    let ui = UiServer::new(listener, mailbox_tx, control.snapshot());

    let mut plc_task = tokio::spawn(driver.run(shutdown_tx.subscribe()));
    let mut control_task = tokio::spawn(control.run(shutdown_tx.subscribe()));
    let mut ui_task = tokio::spawn(ui.run(shutdown_tx.subscribe()));

    let (mut control_done, mut plc_done, mut ui_done) = (None, None, None);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupt received, shutting down"),
        _ = shutdown_rx.recv() => tracing::info!("Shutdown broadcast received"),
        result = &mut control_task => control_done = Some(result),
        result = &mut plc_task => plc_done = Some(result),
        result = &mut ui_task => ui_done = Some(result),
    }
    let _ = shutdown_tx.send(());

    let timeout = config.machine.shutdown_timeout();
    let control = join_task("Control loop", control_task, control_done, timeout).await;
    let plc = join_task("PLC task", plc_task, plc_done, timeout).await;
    let ui = join_task("UI channel", ui_task, ui_done, timeout).await;

    if let Some(Err(e)) = control? {
        return Err(e.into());
    }
    plc?;
    ui?;
    Ok(())
}

/// Wait up to `timeout` for a task, aborting it if it does not finish.
async fn join_task<T>(
    name: &str,
    mut handle: JoinHandle<T>,
    finished: Option<Result<T, JoinError>>,
    timeout: Duration,
) -> Result<Option<T>, HostError> {
    let result = match finished {
        Some(result) => result,
        None => match tokio::time::timeout(timeout, &mut handle).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("{} did not stop within {} ms, aborting", name, timeout.as_millis());
                handle.abort();
                return Ok(None);
            }
        },
    };
    match result {
        Ok(value) => {
            tracing::info!("{} stopped", name);
            Ok(Some(value))
        }
        Err(e) => {
            tracing::error!("{} crashed: {}", name, e);
            Err(HostError::Task(e))
        }
    }
}
