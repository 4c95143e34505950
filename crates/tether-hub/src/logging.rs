use crate::config::HubConfig;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

/// Keeps the hub's log file open for the life of the process.
pub struct LogGuard {
    file: Option<Arc<Mutex<File>>>,
    path: Option<PathBuf>,
}

impl LogGuard {
    fn stdout_only() -> Self {
        Self {
            file: None,
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// One file per listen port, so hubs for separate editor installs can share
/// a log directory.
pub fn log_file_name(addr: SocketAddr) -> String {
    format!("tether-hub-{}.log", addr.port())
}

/// Filter directive used when `RUST_LOG` is unset.
fn default_directive(debug: bool, level: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    level
        .map(|level| level.trim().to_string())
        .filter(|level| !level.is_empty())
        .unwrap_or_else(|| "info".to_string())
}

/// Installs the global subscriber. Output goes to stdout and, when a log
/// directory is configured, is appended to the hub's per-port file there.
pub fn init_logging(config: &HubConfig) -> Option<LogGuard> {
    let directive = default_directive(config.debug, std::env::var("TETHER_LOG_LEVEL").ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let guard = match open_log_file(&config.log_dir, config.addr) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("tether-hub: cannot open log file in {}: {err}", config.log_dir);
            LogGuard::stdout_only()
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || TeeWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

struct TeeWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<File>>>,
}

impl TeeWriter {
    fn new(file: Option<Arc<Mutex<File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str, addr: SocketAddr) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard::stdout_only());
    }
    let dir = PathBuf::from(log_dir.trim());
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(log_file_name(addr));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
        path: Some(path),
    })
}
