mod routes;

use clap::Parser;
use rcv_storage::SyntheticsStore;
use rcv_synthetics::RunRequest;
use routes::{build_router, execute_run, AppState, DEFAULT_ROUTE_PREFIX};
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_HUB_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_DB_PATH: &str = ".rcv/synthetics.db";
const DEFAULT_LOG_DIR: &str = ".rcv/logs";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    db_path: String,
    route_prefix: String,
    api_token: Option<String>,
    debug: bool,
    tick_interval: Duration,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "rcv-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    db: String,
    #[arg(long, default_value = "")]
    prefix: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    /// Seconds between scheduled generator runs; 0 disables the scheduler.
    #[arg(long, default_value_t = 60)]
    tick_seconds: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let log_sink = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                error!(event = "hub_error", error = %err, db = %config.db_path);
                return;
            }
        }
    }
    let store = match SyntheticsStore::open(&config.db_path) {
        Ok(store) => store,
        Err(err) => {
            error!(event = "hub_error", error = %err, db = %config.db_path);
            return;
        }
    };

    let state = AppState::new(store, config.api_token.clone());
    start_scheduler(state.clone(), config.tick_interval);
    let app = build_router(state, &config.route_prefix);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    let log_file = log_sink
        .as_ref()
        .and_then(|sink| sink.path.as_ref())
        .map(|path| path.display().to_string())
        .unwrap_or_default();
    info!(
        event = "hub_start",
        addr = %config.addr,
        db = %config.db_path,
        prefix = %config.route_prefix,
        auth = config.api_token.is_some(),
        tick_seconds = config.tick_interval.as_secs(),
        log_file = %log_file
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
}

/// Minute-tick generator loop. A paused settings row turns each tick into a
/// logged no-op inside the runner.
fn start_scheduler(state: AppState, interval: Duration) {
    if interval.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the first run waits a full interval.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match execute_run(&state, RunRequest::scheduled()).await {
                Ok(result) if result.success => debug!(
                    event = "scheduled_run",
                    sessions = result.sessions_created,
                    scene_events = result.scene_events_created,
                    mindblock_events = result.mindblock_events_created
                ),
                Ok(result) => debug!(
                    event = "scheduled_run_skipped",
                    reason = result.error.as_deref().unwrap_or("unknown")
                ),
                Err(err) => warn!(event = "scheduled_run_failed", error = ?err),
            }
        }
    });
}

fn load_config() -> Config {
    let args = Args::parse();
    Config {
        addr: resolve_addr(&args.addr),
        db_path: resolve_db_path(&args.db),
        route_prefix: resolve_prefix(&args.prefix),
        api_token: resolve_api_token(),
        debug: args.debug || env_true("RCV_HUB_DEBUG"),
        tick_interval: Duration::from_secs(args.tick_seconds),
        log_dir: resolve_log_dir(&args.log_dir),
    }
}

fn init_logging(config: &Config) -> Option<LogSink> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("RCV_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let sink = LogSink::open(&config.log_dir, &config.db_path).unwrap_or_else(|err| {
        eprintln!("log_file_error: {err}");
        LogSink::default()
    });
    let writer_sink = sink.clone();
    let make_writer = BoxMakeWriter::new(move || writer_sink.writer());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(sink)
}

/// Per-database log file; hubs serving different databases from one log
/// directory do not interleave.
#[derive(Clone, Default)]
struct LogSink {
    file: Option<Arc<Mutex<File>>>,
    path: Option<PathBuf>,
}

impl LogSink {
    fn open(log_dir: &str, db_path: &str) -> io::Result<Self> {
        if log_dir.trim().is_empty() {
            return Ok(Self::default());
        }
        let dir = PathBuf::from(log_dir);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(log_file_name(db_path));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file: Some(Arc::new(Mutex::new(file))),
            path: Some(path),
        })
    }

    fn writer(&self) -> TeeWriter {
        TeeWriter {
            stdout: io::stdout(),
            file: self.file.clone(),
        }
    }
}

fn log_file_name(db_path: &str) -> String {
    let stem: String = Path::new(db_path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "rcv-hub.log".to_string()
    } else {
        format!("rcv-hub-{stem}.log")
    }
}

/// Copies each log line to stdout and the sink's file.
struct TeeWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<File>>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let _ = file
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let _ = file.lock().unwrap_or_else(PoisonError::into_inner).flush();
        }
        Ok(())
    }
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

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_flag_or_env(flag: &str, key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    env_non_empty(key).unwrap_or_else(|| default.to_string())
}

fn resolve_addr(addr_flag: &str) -> String {
    resolve_flag_or_env(addr_flag, "RCV_HUB_ADDR", DEFAULT_HUB_ADDR)
}

fn resolve_db_path(db_flag: &str) -> String {
    resolve_flag_or_env(db_flag, "RCV_DB_PATH", DEFAULT_DB_PATH)
}

fn resolve_prefix(prefix_flag: &str) -> String {
    resolve_flag_or_env(prefix_flag, "RCV_ROUTE_PREFIX", DEFAULT_ROUTE_PREFIX)
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    resolve_flag_or_env(log_dir_flag, "RCV_LOG_DIR", DEFAULT_LOG_DIR)
}

fn resolve_api_token() -> Option<String> {
    env_non_empty("RCV_API_TOKEN")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_win_over_defaults() {
        assert_eq!(
            resolve_flag_or_env("0.0.0.0:9000", "RCV_TEST_UNSET_ADDR", DEFAULT_HUB_ADDR),
            "0.0.0.0:9000"
        );
        assert_eq!(
            resolve_flag_or_env("  ", "RCV_TEST_UNSET_ADDR", DEFAULT_HUB_ADDR),
            DEFAULT_HUB_ADDR
        );
    }

    #[test]
    fn blank_log_dir_disables_file_output() {
        let sink = LogSink::open(" ", DEFAULT_DB_PATH).expect("no-op sink");
        assert!(sink.file.is_none());
        assert!(sink.path.is_none());
    }

    #[test]
    fn log_file_is_named_after_the_database() {
        assert_eq!(log_file_name(".rcv/synthetics.db"), "rcv-hub-synthetics.log");
        assert_eq!(log_file_name("/srv/stage one.sqlite"), "rcv-hub-stage_one.log");
        assert_eq!(log_file_name(""), "rcv-hub.log");
    }

    #[test]
    fn log_lines_reach_the_file() {
        let dir = std::env::temp_dir().join(format!("rcv-hub-logs-{}", std::process::id()));
        let sink =
            LogSink::open(dir.to_str().expect("utf8 path"), "staging.db").expect("log sink");
        let path = sink.path.clone().expect("file path");
        assert_eq!(path, dir.join("rcv-hub-staging.log"));

        let mut writer = sink.writer();
        writer.write_all(b"event=hub_start\n").expect("write line");
        writer.flush().expect("flush");
        let contents = std::fs::read_to_string(&path).expect("read log");
        assert!(contents.contains("event=hub_start"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
