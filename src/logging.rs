//! Process-wide logger on top of flexi_logger.
//!
//! Lines look like `2026-01-02T03:04:05.678Z INFO pid=12 rid=ab12.. serve pic done`.
//! The `rid` field is the id of the HTTP request whose task emitted the line;
//! it is carried in a task-local set by [`in_request_scope`].

use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use flexi_logger::{
    Cleanup, Criterion, DeferredNow, Duplicate, FileSpec, Logger as FlexiLogger, LoggerHandle, Naming,
    WriteMode,
};
use log::{LevelFilter, Record};
use tokio::task_local;

use crate::config::Logger;

const MIB: u64 = 1024 * 1024;

#[derive(Clone, Copy, Debug)]
struct LineFormat {
    pid: bool,
    caller: bool,
    request_id: bool,
}

impl LineFormat {
    fn from_config(cfg: &Logger) -> Self {
        Self {
            pid: !cfg.nopid,
            caller: cfg.caller,
            request_id: cfg.traceid,
        }
    }

    fn write(&self, w: &mut dyn Write, now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
        write!(
            w,
            "{} {:<5}",
            now.now_utc_owned().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            record.level()
        )?;
        if self.pid {
            write!(w, " pid={}", std::process::id())?;
        }
        if self.request_id {
            match request_id() {
                Some(rid) => write!(w, " rid={rid}")?,
                None => write!(w, " rid=-")?,
            }
        }
        if self.caller {
            write!(
                w,
                " {}:{}",
                record.file().unwrap_or("-"),
                record.line().unwrap_or(0)
            )?;
        }
        write!(w, " {}", record.args())
    }
}

static LINE_FORMAT: OnceLock<LineFormat> = OnceLock::new();
static HANDLE: OnceLock<LoggerHandle> = OnceLock::new();

task_local! {
    static REQUEST_ID: String;
}

/// Starts logging to stdout, and to a rotated file when `logger.path` is set.
/// Only the first call has any effect.
pub fn init(cfg: &Logger, verbose: bool) -> Result<()> {
    if HANDLE.get().is_some() {
        return Ok(());
    }
    LINE_FORMAT.get_or_init(|| LineFormat::from_config(cfg));
    let level = if verbose { LevelFilter::Debug } else { level_of(&cfg.level) };

    let mut logger = FlexiLogger::try_with_str(level.as_str())
        .context("logger level")?
        .format(format_line)
        .log_to_stdout();

    let path = cfg.path.trim();
    if !path.is_empty() {
        let spec = FileSpec::try_from(Path::new(path)).with_context(|| format!("logger.path {path}"))?;
        logger = logger
            .log_to_file(spec)
            .duplicate_to_stderr(Duplicate::Warn)
            .write_mode(WriteMode::BufferAndFlush);
        if cfg.max_size > 0 {
            let keep = match cfg.max_backups {
                0 => Cleanup::Never,
                n => Cleanup::KeepLogFiles(n as usize),
            };
            logger = logger.rotate(Criterion::Size(cfg.max_size * MIB), Naming::Numbers, keep);
        }
    }

    let handle = logger.start().context("start logger")?;
    let _ = HANDLE.set(handle);
    Ok(())
}

/// Flushes buffered file output; called on shutdown.
pub fn flush() {
    if let Some(handle) = HANDLE.get() {
        handle.flush();
    }
}

fn level_of(raw: &str) -> LevelFilter {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

fn format_line(w: &mut dyn Write, now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    let fmt = LINE_FORMAT.get().copied().unwrap_or(LineFormat {
        pid: true,
        caller: false,
        request_id: false,
    });
    fmt.write(w, now, record)
}

/// Runs `fut` with `rid` attached to every log line it emits.
pub async fn in_request_scope<T>(rid: String, fut: impl Future<Output = T>) -> T {
    REQUEST_ID.scope(rid, fut).await
}

/// Id of the request being served by the current task, if any.
pub fn request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}
