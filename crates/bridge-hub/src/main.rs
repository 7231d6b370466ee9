use bridge_hub::config::{load_config, Config};
use bridge_hub::http::{self, AppState};
use bridge_hub::Coordinator;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() && !config.transport.allow_remote {
        error!(event = "invalid_addr", addr = %config.addr, reason = "non-loopback without --allow-remote");
        return;
    }

    let coordinator = Coordinator::start(config.coordinator.clone());
    let state = AppState {
        coordinator: coordinator.clone(),
        settings: config.transport.clone(),
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        heartbeat_ms = config.coordinator.heartbeat.interval.as_millis() as u64,
        missed_heartbeats = config.coordinator.heartbeat.missed_threshold,
        request_timeout_ms = config.coordinator.request_timeout.as_millis() as u64,
        max_failover_attempts = config.coordinator.max_failover_attempts
    );

    let drain = config.coordinator.shutdown_drain;
    let stopper = coordinator.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "shutdown_requested");
        stopper.shutdown(drain).await;
    });
    let mut stopped = coordinator.shutdown_signal();
    let shutdown = async move {
        let _ = stopped.wait_for(|done| *done).await;
    };

    if let Err(err) = http::serve(listener, state, shutdown).await {
        error!(event = "hub_error", error = %err);
    }
    info!(event = "hub_stop");
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("BRIDGE_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(config) {
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

/// Tees log lines to stdout and the optional log file.
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
            let _ = file.lock().write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let _ = file.lock().flush();
        }
        Ok(())
    }
}

fn open_log_file(config: &Config) -> io::Result<LogGuard> {
    let Some(dir) = &config.log_dir else {
        return Ok(LogGuard { file: None });
    };
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("bridge-hub-{}.log", config.port()));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
