//! 博客条目：来源信息、下载偏好与爬取统计。

use std::fmt;
use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::base_system::context::{Config, safe_fs_name};
use crate::download::models::{DiscoveryStats, DownloadOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlogKind {
    Tumblr,
    #[serde(rename = "tmblrpriv")]
    TumblrHidden,
    #[serde(rename = "tlb")]
    TumblrLikedBy,
    #[serde(rename = "tumblrsearch")]
    TumblrSearch,
    #[serde(rename = "tumblrtagsearch")]
    TumblrTagSearch,
}

impl BlogKind {
    pub const ALL: [BlogKind; 5] = [
        BlogKind::Tumblr,
        BlogKind::TumblrHidden,
        BlogKind::TumblrLikedBy,
        BlogKind::TumblrSearch,
        BlogKind::TumblrTagSearch,
    ];

    /// 索引文件扩展名。
    pub fn extension(self) -> &'static str {
        match self {
            BlogKind::Tumblr => "tumblr",
            BlogKind::TumblrHidden => "tmblrpriv",
            BlogKind::TumblrLikedBy => "tlb",
            BlogKind::TumblrSearch => "tumblrsearch",
            BlogKind::TumblrTagSearch => "tumblrtagsearch",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.extension() == ext)
    }
}

impl fmt::Display for BlogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlogUrlError {
    #[error("not a valid url: {0}")]
    Malformed(String),
    #[error("unsupported blog url: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blog {
    pub name: String,
    pub kind: BlogKind,
    pub url: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub tags: String,

    #[serde(default = "default_true")]
    pub download_photo: bool,
    #[serde(default = "default_true")]
    pub download_video: bool,
    #[serde(default)]
    pub download_audio: bool,
    #[serde(default)]
    pub skip_gif: bool,

    #[serde(default)]
    pub online: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_complete_crawl: Option<OffsetDateTime>,
    #[serde(default)]
    pub total_count: usize,
    #[serde(default)]
    pub photos: usize,
    #[serde(default)]
    pub videos: usize,
    #[serde(default)]
    pub audios: usize,
    #[serde(default)]
    pub duplicate_photos: usize,
    #[serde(default)]
    pub duplicate_videos: usize,
    #[serde(default)]
    pub duplicate_audios: usize,
    #[serde(default)]
    pub downloaded_images: usize,
    #[serde(default)]
    pub downloaded_photos: usize,
    #[serde(default)]
    pub downloaded_videos: usize,
    #[serde(default)]
    pub downloaded_audios: usize,
    #[serde(default)]
    pub progress: String,
}

fn default_true() -> bool {
    true
}

impl Blog {
    pub fn new(name: impl Into<String>, kind: BlogKind, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            url: url.into(),
            password: String::new(),
            tags: String::new(),
            download_photo: true,
            download_video: true,
            download_audio: false,
            skip_gif: false,
            online: false,
            last_complete_crawl: None,
            total_count: 0,
            photos: 0,
            videos: 0,
            audios: 0,
            duplicate_photos: 0,
            duplicate_videos: 0,
            duplicate_audios: 0,
            downloaded_images: 0,
            downloaded_photos: 0,
            downloaded_videos: 0,
            downloaded_audios: 0,
            progress: String::new(),
        }
    }

    /// 识别博客地址并得到规范化的条目：
    ///
    /// - `https://<name>.tumblr.com/…` → `Tumblr`
    /// - `https://www.tumblr.com/dashboard/blog/<name>` → `TumblrHidden`
    /// - `https://www.tumblr.com/liked/by/<name>` → `TumblrLikedBy`
    /// - `https://www.tumblr.com/search/<query>` → `TumblrSearch`
    /// - `https://www.tumblr.com/tagged/<tag>` → `TumblrTagSearch`
    pub fn from_url(raw: &str) -> Result<Self, BlogUrlError> {
        let trimmed = raw.trim();
        let url = Url::parse(trimmed).map_err(|_| BlogUrlError::Malformed(trimmed.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(BlogUrlError::Unsupported(trimmed.to_string()));
        }
        let host = url
            .host_str()
            .map(|h| h.to_ascii_lowercase())
            .ok_or_else(|| BlogUrlError::Malformed(trimmed.to_string()))?;
        let unsupported = || BlogUrlError::Unsupported(trimmed.to_string());

        if host == "www.tumblr.com" || host == "tumblr.com" {
            let segments: Vec<&str> = url
                .path_segments()
                .map(|s| s.filter(|p| !p.is_empty()).collect())
                .unwrap_or_default();
            let (kind, name) = match segments.as_slice() {
                ["dashboard", "blog", name, ..] => (BlogKind::TumblrHidden, *name),
                ["liked", "by", name, ..] => (BlogKind::TumblrLikedBy, *name),
                ["search", query, ..] => (BlogKind::TumblrSearch, *query),
                ["tagged", tag, ..] => (BlogKind::TumblrTagSearch, *tag),
                _ => return Err(unsupported()),
            };
            let canonical = match kind {
                BlogKind::TumblrHidden => format!("https://www.tumblr.com/dashboard/blog/{name}"),
                BlogKind::TumblrLikedBy => format!("https://www.tumblr.com/liked/by/{name}"),
                BlogKind::TumblrSearch => format!("https://www.tumblr.com/search/{name}"),
                _ => format!("https://www.tumblr.com/tagged/{name}"),
            };
            return Ok(Self::new(name, kind, canonical));
        }

        let name = host
            .strip_suffix(".tumblr.com")
            .filter(|n| !n.is_empty() && !n.contains('.'))
            .ok_or_else(unsupported)?;
        Ok(Self::new(
            name,
            BlogKind::Tumblr,
            format!("https://{name}.tumblr.com/"),
        ))
    }

    /// 认证流程中使用的子域名（`+` 不是合法的主机字符）。
    pub fn host_name(&self) -> String {
        self.name.replace('+', "-")
    }

    pub fn password(&self) -> Option<&str> {
        Some(self.password.as_str()).filter(|p| !p.is_empty())
    }

    /// 逗号分隔的标签，去掉空白与空项。
    pub fn tag_list(&self) -> Vec<String> {
        self.tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn index_file_name(&self) -> String {
        format!("{}.{}", self.name, self.kind.extension())
    }

    pub fn download_dir(&self, root: &Path) -> PathBuf {
        root.join(safe_fs_name(&self.name, "_", 120))
    }

    /// 新增博客时从全局配置继承下载偏好。
    pub fn apply_defaults(&mut self, config: &Config) {
        self.download_photo = config.download_photos;
        self.download_video = config.download_videos;
        self.download_audio = config.download_audios;
        self.skip_gif = config.skip_gif;
    }

    /// 发现阶段结束后写入计数：重复数按类型，总数为去重后的数量。
    pub fn apply_discovery(&mut self, stats: &DiscoveryStats) {
        self.photos = stats.discovered.photos;
        self.videos = stats.discovered.videos;
        self.audios = stats.discovered.audios;
        self.duplicate_photos = stats.duplicates.photos;
        self.duplicate_videos = stats.duplicates.videos;
        self.duplicate_audios = stats.duplicates.audios;
        self.total_count = stats.unique_total();
    }

    pub fn apply_download(&mut self, outcome: &DownloadOutcome) {
        self.downloaded_photos += outcome.downloaded.photos;
        self.downloaded_videos += outcome.downloaded.videos;
        self.downloaded_audios += outcome.downloaded.audios;
        self.downloaded_images = self.downloaded_photos;
    }

    pub fn mark_complete(&mut self) {
        self.last_complete_crawl = Some(OffsetDateTime::now_utc());
    }

    pub fn has_been_crawled(&self) -> bool {
        self.last_complete_crawl.is_some()
    }
}
