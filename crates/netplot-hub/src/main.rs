use clap::Parser;
use netplot_core::protocol::{AckMode, DEFAULT_MAX_LINE_BYTES};
use netplot_hub::listener::{DEFAULT_BASE_PORT, DEFAULT_PORT_COUNT};
use netplot_hub::session::SessionConfig;
use netplot_hub::HubConfig;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

#[derive(Clone, Debug)]
struct Config {
    hub: HubConfig,
    debug: bool,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "netplot-hub")]
struct Args {
    #[arg(long, default_value = "")]
    base_port: String,
    #[arg(long, default_value = "")]
    port_count: String,
    #[arg(long, default_value = "")]
    host: String,
    #[arg(long, default_value = "")]
    path: String,
    #[arg(long, default_value_t = 200)]
    quiet_ms: u64,
    /// Seconds without input before a session is closed; 0 keeps sessions open.
    #[arg(long, default_value_t = 0)]
    idle_timeout: u64,
    #[arg(long, default_value_t = false)]
    ack_per_line: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(value) => value,
        Err(err) => {
            eprintln!("config_error: {err}");
            std::process::exit(1);
        }
    };
    let _log_guard = init_logging(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "shutdown_requested");
        let _ = shutdown_tx.send(true);
    });

    info!(
        event = "hub_start",
        host = %config.hub.host,
        base_port = config.hub.base_port,
        port_count = config.hub.port_count,
        path = %config.hub.output_dir.display()
    );

    if let Err(err) = netplot_hub::run(config.hub.clone(), shutdown_rx).await {
        error!(event = "startup_error", error = %err);
        std::process::exit(1);
    }
}

fn load_config() -> Result<Config, String> {
    let args = Args::parse();
    let base_port = resolve_number("NETPLOT_BASE_PORT", &args.base_port, DEFAULT_BASE_PORT)?;
    let port_count = resolve_number("NETPLOT_PORT_COUNT", &args.port_count, DEFAULT_PORT_COUNT)?;
    let host = resolve_string("NETPLOT_HOST", &args.host).unwrap_or_else(|| "0.0.0.0".to_string());
    let output_dir = match resolve_string("NETPLOT_PATH", &args.path) {
        Some(value) => PathBuf::from(value),
        None => std::env::current_dir().map_err(|err| format!("current dir: {err}"))?,
    };
    let debug = args.debug || env_true("NETPLOT_DEBUG");
    let log_dir = resolve_string("NETPLOT_LOG_DIR", &args.log_dir)
        .unwrap_or_else(|| ".netplot/logs".to_string());

    let session = SessionConfig {
        ack_mode: if args.ack_per_line {
            AckMode::PerLine
        } else {
            AckMode::PerChunk
        },
        idle_timeout: (args.idle_timeout > 0).then(|| Duration::from_secs(args.idle_timeout)),
        max_line_bytes: DEFAULT_MAX_LINE_BYTES,
    };
    Ok(Config {
        hub: HubConfig {
            host,
            base_port,
            port_count,
            output_dir,
            quiet_period: Duration::from_millis(args.quiet_ms),
            session,
        },
        debug,
        log_dir,
    })
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("NETPLOT_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir, config.hub.base_port) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

/// Tees every log line to stdout and the per-grid log file.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, base_port: u16) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join(format!("netplot-hub-{base_port}.log"));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// Flag first, then the environment; `None` when both are blank.
fn resolve_string(env_key: &str, flag: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return Some(value.trim().to_string());
        }
    }
    None
}

fn resolve_number(env_key: &str, flag: &str, default: u16) -> Result<u16, String> {
    match resolve_string(env_key, flag) {
        Some(value) => value
            .parse::<u16>()
            .map_err(|err| format!("{env_key}={value}: {err}")),
        None => Ok(default),
    }
}
