//! 日志：控制台（stderr）+ `<logs_dir>/latest.log`。
//!
//! 启动时超过 10MB 的旧日志先归档；`LogSystem` 被 drop 时刷新后台写线程，
//! 再把本次的 `latest.log` 压缩成 `log_<时间>.zip`。

use std::fs::{self, File};
use std::io::{self, IsTerminal};
use std::panic;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{error, info};
use tracing_appender::non_blocking::{NonBlockingBuilder, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use zip::CompressionMethod;
use zip::write::FileOptions;

const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;
const CURRENT_LOG: &str = "latest.log";

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("time formatting failed: {0}")]
    Time(#[from] time::error::Format),
}

#[derive(Clone, Debug)]
pub struct LogOptions {
    /// 控制台输出 DEBUG 级别并显示 target
    pub debug: bool,
    pub archive_on_exit: bool,
    pub logs_dir: PathBuf,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            debug: false,
            archive_on_exit: true,
            logs_dir: PathBuf::from("logs"),
        }
    }
}

/// 持有期间日志写入有效；drop 时落盘并归档。
pub struct LogSystem {
    logs_dir: PathBuf,
    archive_on_exit: bool,
    flush: Option<WorkerGuard>,
}

impl LogSystem {
    pub fn init(options: LogOptions) -> Result<Self, LogError> {
        let LogOptions {
            debug,
            archive_on_exit,
            logs_dir,
        } = options;
        fs::create_dir_all(&logs_dir)?;
        rotate_oversized(&logs_dir)?;

        let (file_writer, flush) = NonBlockingBuilder::default()
            .lossy(false)
            .finish(rolling::never(&logs_dir, CURRENT_LOG));

        // 进度条也画在 stderr 上，两者共用同一个终端流
        let console = fmt::layer()
            .with_writer(io::stderr)
            .with_ansi(io::stderr().is_terminal())
            .with_target(debug)
            .with_filter(if debug {
                LevelFilter::DEBUG
            } else {
                LevelFilter::INFO
            });
        let file = fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_thread_names(true)
            .with_filter(LevelFilter::DEBUG);

        tracing_subscriber::registry()
            .with(console)
            .with(file)
            .try_init()
            .map_err(|_| LogError::AlreadyInitialized)?;
        log_panics();

        info!(target: "startup", dir = %logs_dir.display(), "日志已初始化");
        Ok(Self {
            logs_dir,
            archive_on_exit,
            flush: Some(flush),
        })
    }
}

impl Drop for LogSystem {
    fn drop(&mut self) {
        // guard 的 drop 会等待后台线程写完
        drop(self.flush.take());
        if self.archive_on_exit
            && let Err(e) = archive(&self.logs_dir)
        {
            eprintln!("failed to archive log: {e}");
        }
    }
}

/// panic 信息先写进日志，再交给原来的 hook 打印。
fn log_panics() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let at = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        error!(target: "panic", at = %at, "{info}");
        previous(info);
    }));
}

fn rotate_oversized(logs_dir: &Path) -> Result<(), LogError> {
    let size = fs::metadata(logs_dir.join(CURRENT_LOG)).map_or(0, |m| m.len());
    if size >= ROTATE_AT_BYTES {
        archive(logs_dir)?;
    }
    Ok(())
}

/// 把 `latest.log` 压缩为一个新的 zip 并删除原文件。空文件直接删除。
fn archive(logs_dir: &Path) -> Result<Option<PathBuf>, LogError> {
    let current = logs_dir.join(CURRENT_LOG);
    let Ok(meta) = fs::metadata(&current) else {
        return Ok(None);
    };
    if meta.len() == 0 {
        let _ = fs::remove_file(&current);
        return Ok(None);
    }

    let stamp = OffsetDateTime::now_utc().format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))?;
    let target = (0..)
        .map(|n| match n {
            0 => logs_dir.join(format!("log_{stamp}.zip")),
            n => logs_dir.join(format!("log_{stamp}_{n}.zip")),
        })
        .find(|p| !p.exists())
        .unwrap_or_else(|| logs_dir.join(format!("log_{stamp}.zip")));

    let mut zip = zip::ZipWriter::new(File::create(&target)?);
    zip.start_file(
        format!("{stamp}.log"),
        FileOptions::default().compression_method(CompressionMethod::Deflated),
    )?;
    io::copy(&mut File::open(&current)?, &mut zip)?;
    zip.finish()?;

    fs::remove_file(&current)?;
    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn archive_moves_log_into_zip() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join(CURRENT_LOG);
        fs::write(&current, "line one\nline two\n").unwrap();

        let archived = archive(dir.path()).unwrap().unwrap();
        assert!(archived.exists());
        assert!(!current.exists());

        let mut zip = zip::ZipArchive::new(File::open(&archived).unwrap()).unwrap();
        assert_eq!(zip.len(), 1);
        let mut text = String::new();
        zip.by_index(0).unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "line one\nline two\n");
    }

    #[test]
    fn repeated_archives_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join(CURRENT_LOG);
        fs::write(&current, "first").unwrap();
        let a = archive(dir.path()).unwrap().unwrap();
        fs::write(&current, "second").unwrap();
        let b = archive(dir.path()).unwrap().unwrap();
        assert_ne!(a, b);
        assert!(a.exists() && b.exists());
    }

    #[test]
    fn empty_or_missing_log_is_not_archived() {
        let dir = tempfile::tempdir().unwrap();
        assert!(archive(dir.path()).unwrap().is_none());
        let current = dir.path().join(CURRENT_LOG);
        fs::write(&current, "").unwrap();
        assert!(archive(dir.path()).unwrap().is_none());
        assert!(!current.exists());
    }

    #[test]
    fn small_log_is_left_alone_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join(CURRENT_LOG);
        fs::write(&current, "x").unwrap();
        rotate_oversized(dir.path()).unwrap();
        assert!(current.exists());
    }
}
