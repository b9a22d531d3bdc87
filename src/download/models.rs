//! 下载相关的数据模型定义。
//!
//! 包含待下载条目（Post）、进度快照、事件与各阶段的统计结果。

use std::collections::HashSet;

use serde::Serialize;
use sha1::{Digest, Sha1};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PostKind {
    Photo,
    Video,
    Audio,
}

impl PostKind {
    pub const ALL: [PostKind; 3] = [PostKind::Photo, PostKind::Video, PostKind::Audio];

    pub fn label(self) -> &'static str {
        match self {
            PostKind::Photo => "photo",
            PostKind::Video => "video",
            PostKind::Audio => "audio",
        }
    }
}

/// 发现阶段产出、下载阶段恰好消费一次的媒体引用。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub kind: PostKind,
    pub url: String,
    pub id: String,
    pub post_id: Option<String>,
}

impl Post {
    pub fn new(kind: PostKind, url: impl Into<String>, post_id: Option<String>) -> Self {
        let url = url.into();
        let id = stable_id(&url);
        Self {
            kind,
            url,
            id,
            post_id,
        }
    }

    pub fn photo(url: impl Into<String>) -> Self {
        Self::new(PostKind::Photo, url, None)
    }

    pub fn video(url: impl Into<String>) -> Self {
        Self::new(PostKind::Video, url, None)
    }

    /// 去重使用的标识：去掉查询串与片段、统一协议后的 URL。
    pub fn identity(&self) -> String {
        normalize_url(&self.url)
    }

    /// 落盘文件名：URL 最后一段路径。
    pub fn file_name(&self) -> String {
        let normalized = normalize_url(&self.url);
        normalized
            .rsplit('/')
            .find(|seg| !seg.is_empty())
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.id.clone())
    }
}

fn stable_id(url: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(normalize_url(url).as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    let cut = trimmed
        .find(['?', '#'])
        .map(|idx| &trimmed[..idx])
        .unwrap_or(trimmed);
    match cut.strip_prefix("http://") {
        Some(rest) => format!("https://{rest}"),
        None => cut.to_string(),
    }
}

/// 宿主可观察的进度：单调递增的计数与一条状态文本。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    pub progress: usize,
    pub message: String,
}

/// 面向操作者的非致命错误。
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub detail: String,
    pub message: String,
    pub context: String,
}

#[derive(Debug, Clone, Serialize)]
pub enum CrawlEvent {
    Progress {
        blog: String,
        progress: DownloadProgress,
    },
    Error(ErrorReport),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    pub photos: usize,
    pub videos: usize,
    pub audios: usize,
}

impl KindCounts {
    pub fn get(&self, kind: PostKind) -> usize {
        match kind {
            PostKind::Photo => self.photos,
            PostKind::Video => self.videos,
            PostKind::Audio => self.audios,
        }
    }

    pub fn bump(&mut self, kind: PostKind) {
        match kind {
            PostKind::Photo => self.photos += 1,
            PostKind::Video => self.videos += 1,
            PostKind::Audio => self.audios += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.photos + self.videos + self.audios
    }
}

/// 发现阶段结束后的统计（去重前）。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryStats {
    pub pages_crawled: usize,
    pub discovered: KindCounts,
    pub duplicates: KindCounts,
}

impl DiscoveryStats {
    /// 按类型计算重复数：发现总数减去唯一标识数。
    pub fn from_posts<'a>(pages_crawled: usize, posts: impl IntoIterator<Item = &'a Post>) -> Self {
        let mut discovered = KindCounts::default();
        let mut unique = KindCounts::default();
        let mut seen: HashSet<(PostKind, String)> = HashSet::new();
        for post in posts {
            discovered.bump(post.kind);
            if seen.insert((post.kind, post.identity())) {
                unique.bump(post.kind);
            }
        }
        let duplicates = KindCounts {
            photos: discovered.photos - unique.photos,
            videos: discovered.videos - unique.videos,
            audios: discovered.audios - unique.audios,
        };
        Self {
            pages_crawled,
            discovered,
            duplicates,
        }
    }

    pub fn unique_total(&self) -> usize {
        self.discovered.total() - self.duplicates.total()
    }
}

/// 下载阶段的结果。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadOutcome {
    pub downloaded: KindCounts,
    pub duplicates: KindCounts,
    pub already_present: usize,
    pub failed: usize,
}

impl DownloadOutcome {
    pub fn any_success(&self) -> bool {
        self.downloaded.total() > 0
    }
}
