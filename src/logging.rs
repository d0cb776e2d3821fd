use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use chrono::SecondsFormat;

static LOGGER: OnceLock<Logger> = OnceLock::new();

pub fn init_log_file(path: &Path) -> Result<()> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let logger = Logger::new(path)?;
    let _ = LOGGER.set(logger);
    Ok(())
}

pub fn init_default_log_file() -> Result<PathBuf> {
    let path = crate::config::default_log_file_path();
    init_log_file(&path)?;
    Ok(path)
}

pub fn info(msg: impl AsRef<str>) {
    log_kv("INFO", msg.as_ref(), &[]);
}

pub fn error(msg: impl AsRef<str>) {
    log_kv("ERROR", msg.as_ref(), &[]);
}

pub fn info_kv(msg: &str, kv: &[(&str, &str)]) {
    log_kv("INFO", msg, kv);
}

pub fn error_kv(msg: &str, kv: &[(&str, &str)]) {
    log_kv("ERROR", msg, kv);
}

fn log_kv(level: &str, msg: &str, kv: &[(&str, &str)]) {
    if let Some(logger) = LOGGER.get() {
        logger.write_kv(level, msg, kv);
    }
}

/// Per-root sync log at `<root>/.davsync.log`. Appends across runs; one
/// line per item completion and per run transition.
pub struct SyncLog {
    logger: Logger,
}

impl SyncLog {
    pub const FILE_NAME: &'static str = ".davsync.log";

    pub fn open(root: &Path) -> Result<Self> {
        let logger = Logger::append(&root.join(Self::FILE_NAME))?;
        Ok(Self { logger })
    }

    pub fn line(&self, msg: &str, kv: &[(&str, &str)]) {
        self.logger.write_kv("INFO", msg, kv);
    }
}

struct Logger {
    file: Mutex<File>,
    mirror_to_stdout: bool,
}

impl Logger {
    fn new(path: &Path) -> Result<Self> {
        Self::open_with(path, true, true)
    }

    fn append(path: &Path) -> Result<Self> {
        Self::open_with(path, false, false)
    }

    fn open_with(path: &Path, truncate: bool, mirror_to_stdout: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let mut opts = OpenOptions::new();
        opts.create(true).write(true);
        if truncate {
            opts.truncate(true);
        } else {
            opts.append(true);
        }
        let file = opts
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
            mirror_to_stdout,
        })
    }

    fn write_kv(&self, level: &str, msg: &str, kv: &[(&str, &str)]) {
        let ts = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut line = format!("time={ts} level={level} msg=\"{}\"", escape_value(msg));
        for (k, v) in kv {
            line.push(' ');
            line.push_str(k);
            line.push('=');
            line.push_str(v);
        }
        line.push('\n');
        if let Ok(mut f) = self.file.lock() {
            let _ = f.write_all(line.as_bytes());
            let _ = f.flush();
        }
        if self.mirror_to_stdout {
            let mut pretty = format!("{ts} {level} {msg}");
            for (k, v) in kv {
                pretty.push(' ');
                pretty.push_str(k);
                pretty.push('=');
                pretty.push_str(v);
            }
            pretty.push('\n');
            let mut out = std::io::stdout();
            let _ = out.write_all(pretty.as_bytes());
            let _ = out.flush();
        }
    }
}

fn escape_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}
