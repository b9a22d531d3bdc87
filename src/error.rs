//! 爬取流程的错误分类。
//!
//! 单页 / 单文件失败（`Fetch`、`Persistence`）在记录与上报后被吞掉；
//! `Offline`、`Authentication` 只终止当前博客的爬取。

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::library::blog::BlogKind;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out: {url}")]
    Timeout { url: String },
    #[error("unexpected status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("network error for {url}: {message}")]
    Network { url: String, message: String },
    #[error("failed to read body of {url}: {source}")]
    Body { url: String, source: io::Error },
    #[error("invalid request: {0}")]
    Build(String),
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::Status { status: 404, .. })
    }

    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return FetchError::Timeout {
                url: url.to_string(),
            };
        }
        if let Some(status) = err.status() {
            return FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            };
        }
        if err.is_builder() {
            return FetchError::Build(err.to_string());
        }
        FetchError::Network {
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn from_io(url: &str, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            return FetchError::Timeout {
                url: url.to_string(),
            };
        }
        FetchError::Body {
            url: url.to_string(),
            source: err,
        }
    }
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("blog {blog} is offline")]
    Offline { blog: String },
    #[error("password authentication failed for {blog}: {reason}")]
    Authentication { blog: String, reason: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("crawl cancelled")]
    Cancelled,
    #[error("could not write {path}: {source}")]
    Persistence { path: PathBuf, source: io::Error },
    #[error("no crawler for blog kind {0:?}")]
    UnsupportedKind(BlogKind),
    #[error("blog {0} is already being crawled")]
    AlreadyCrawling(String),
}
