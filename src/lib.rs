//! MCP-Gate: one MCP endpoint in front of many downstream MCP servers.
//!
//! - [`catalog`]: the installable downstream servers
//! - [`mcp_client`]: transports, per-server clients and the gateway registry
//! - [`upstream`]: the MCP server facing the host, with optional admin tools
//! - [`config`]: file + environment configuration

pub mod catalog;
pub mod config;
pub mod mcp_client;
pub mod upstream;

use std::path::{Path, PathBuf};

use config::GatewayConfig;

/// Log file name inside the log directory.
const LOG_FILE_NAME: &str = "mcp_gate.log";

/// Rotated generations kept next to the live log.
const LOG_GENERATIONS: u32 = 3;

/// Return the platform-standard data directory for the gateway.
///
/// - macOS: `~/Library/Application Support/{app_name}/`
/// - Windows: `{FOLDERID_RoamingAppData}\{app_name}\`
/// - Linux: `$XDG_DATA_HOME/{app_name}/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.{app_name}/` only if none of the above can be resolved.
pub fn data_dir(app_name: &str) -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join(app_name);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(format!(".{app_name}"))
}

/// Where logs are going, for the startup banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    File(PathBuf),
}

/// Initialize the tracing subscriber.
///
/// stdout carries the upstream protocol, so logs go either to stderr or to
/// a file. In file mode, on each startup:
/// 1. Rotates existing logs (mcp_gate.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh mcp_gate.log with a line-flushing writer.
/// 3. Logs a startup banner with the log location.
pub fn init_tracing(config: &GatewayConfig) -> std::io::Result<LogTarget> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_gate=info,warn"));

    let target = if config.log.redirect_to_stderr {
        fmt::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_target(true)
            .try_init()
            .map_err(std::io::Error::other)?;
        LogTarget::Stderr
    } else {
        let log_dir = config
            .log
            .dir
            .clone()
            .unwrap_or_else(|| data_dir(&config.app_name));
        std::fs::create_dir_all(&log_dir)?;

        let log_path = log_dir.join(LOG_FILE_NAME);
        rotate_log_file(&log_path, LOG_GENERATIONS);

        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        fmt::fmt()
            .with_env_filter(filter)
            .with_writer(FlushingWriter::new(log_file))
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false)
            .try_init()
            .map_err(std::io::Error::other)?;
        LogTarget::File(log_path)
    };

    let log_target = match &target {
        LogTarget::Stderr => "stderr".to_string(),
        LogTarget::File(path) => path.display().to_string(),
    };
    tracing::info!(
        app = %config.app_name,
        version = env!("CARGO_PKG_VERSION"),
        log = %log_target,
        pid = std::process::id(),
        "=== MCP-Gate starting ==="
    );

    Ok(target)
}

/// Rotate log files: `mcp_gate.log` → `mcp_gate.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    // Shift: .{n-1} → .{n}
    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// each log line is on disk even if the gateway is killed.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rotate_log_file_shifts_generations() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        std::fs::write(&base, "current").unwrap();
        std::fs::write(format!("{}.1", base.display()), "one").unwrap();
        std::fs::write(format!("{}.3", base.display()), "three").unwrap();

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let read = |n: u32| std::fs::read_to_string(format!("{}.{n}", base.display())).unwrap();
        assert_eq!(read(1), "current");
        assert_eq!(read(2), "one");
        assert!(!Path::new(&format!("{}.3", base.display())).exists());
    }

    #[test]
    fn test_rotate_log_file_without_existing_logs() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);
        rotate_log_file(&base, 3);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line one\n").unwrap();
        let mut clone = writer.clone();
        clone.write_all(b"line two\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\nline two\n");
    }

    #[test]
    fn test_data_dir_uses_app_name() {
        let dir = data_dir("mcp-gate-test");
        let last = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(last == "mcp-gate-test" || last == ".mcp-gate-test");
    }
}
