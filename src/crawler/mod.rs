//! 博客爬虫：在线检查、密码认证与分页发现。
//!
//! 每种博客来源对应 `Crawler` 的一个变体；编排层只通过 `CrawlPhase`
//! 驱动它们。

pub mod extract;
pub mod pagination;
pub mod tumblr;

use std::sync::Arc;

use crate::base_system::context::Config;
use crate::base_system::control::CrawlControl;
use crate::download::models::DiscoveryStats;
use crate::download::post_queue::PostQueue;
use crate::download::progress::{BlogProgress, EventSink};
use crate::error::CrawlError;
use crate::library::blog::{Blog, BlogKind};
use crate::network_parser::request_factory::HttpTransport;

pub use pagination::{LiteralPageNumber, NextPageLink, PaginationProbe};
pub use tumblr::TumblrBlogCrawler;

/// 一次爬取共享的依赖。
#[derive(Clone)]
pub struct CrawlerDeps {
    pub config: Arc<Config>,
    pub transport: Arc<dyn HttpTransport>,
    pub control: CrawlControl,
    pub events: EventSink,
    pub queue: Arc<PostQueue>,
    /// 本次爬取唯一的进度计数，所有阶段都通过它发布进度。
    pub progress: Arc<BlogProgress>,
}

pub trait CrawlPhase {
    /// 检查博客是否在线，需要时完成密码认证。会更新 `blog.online`。
    fn is_online(&self, blog: &mut Blog) -> Result<(), CrawlError>;

    /// 扫描全部分页并把条目写入队列。返回前队列一定已经完成。
    fn discover(&self) -> DiscoveryStats;

    /// 把最近一次发现的统计写回博客，并清空收集到的条目。
    fn finalize_stats(&self, blog: &mut Blog);
}

pub enum Crawler {
    Tumblr(TumblrBlogCrawler),
}

impl Crawler {
    pub fn for_blog(blog: &Blog, deps: CrawlerDeps) -> Result<Self, CrawlError> {
        match blog.kind {
            BlogKind::Tumblr => Ok(Crawler::Tumblr(TumblrBlogCrawler::new(blog, deps))),
            other => Err(CrawlError::UnsupportedKind(other)),
        }
    }

    /// 替换翻页判断，默认是 `LiteralPageNumber`。
    pub fn with_probe(self, probe: Box<dyn PaginationProbe>) -> Self {
        match self {
            Crawler::Tumblr(c) => Crawler::Tumblr(c.with_probe(probe)),
        }
    }
}

impl CrawlPhase for Crawler {
    fn is_online(&self, blog: &mut Blog) -> Result<(), CrawlError> {
        match self {
            Crawler::Tumblr(c) => c.is_online(blog),
        }
    }

    fn discover(&self) -> DiscoveryStats {
        match self {
            Crawler::Tumblr(c) => c.discover(),
        }
    }

    fn finalize_stats(&self, blog: &mut Blog) {
        match self {
            Crawler::Tumblr(c) => c.finalize_stats(blog),
        }
    }
}
