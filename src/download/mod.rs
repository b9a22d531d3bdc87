//! 下载流程模块入口。
//!
//! 子模块：
//! - `models`      : 数据模型（Post / DownloadProgress / 统计）
//! - `post_queue`  : 发现与下载之间的阻塞队列
//! - `progress`    : 事件发布与 CLI 进度条
//! - `downloader`  : 队列消费与落盘

pub mod downloader;
pub mod models;
pub mod post_queue;
pub mod progress;

pub use downloader::BlogDownloader;
pub use models::{CrawlEvent, DiscoveryStats, DownloadOutcome, DownloadProgress, Post, PostKind};
pub use post_queue::PostQueue;
pub use progress::{BlogProgress, EventSink};
