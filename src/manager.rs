//! 单个博客的爬取编排：在线检查 → 并行发现与下载 → 统计 → 保存。

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::base_system::context::Config;
use crate::base_system::control::{CrawlControl, Semaphore};
use crate::crawler::{CrawlPhase, Crawler, CrawlerDeps};
use crate::download::downloader::BlogDownloader;
use crate::download::models::{DiscoveryStats, DownloadOutcome};
use crate::download::post_queue::PostQueue;
use crate::download::progress::{BlogProgress, EventSink};
use crate::error::{CrawlError, FetchError};
use crate::library::blog::Blog;
use crate::library::index::{BlogIndex, IndexError};
use crate::network_parser::cookies::SharedCookieJar;
use crate::network_parser::request_factory::{HttpTransport, RequestFactory};

/// 批量在线检查的并发上限。
pub const ONLINE_CHECK_LIMIT: usize = 25;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlOutcome {
    pub success: bool,
    pub cancelled: bool,
    pub stats: DiscoveryStats,
    pub download: DownloadOutcome,
}

pub struct CrawlManager {
    config: Arc<Config>,
    transport: Arc<dyn HttpTransport>,
    index: BlogIndex,
    events: EventSink,
    active: Mutex<HashSet<String>>,
}

impl CrawlManager {
    pub fn new(config: Arc<Config>, transport: Arc<dyn HttpTransport>, events: EventSink) -> Self {
        let index = BlogIndex::from_config(&config);
        Self {
            config,
            transport,
            index,
            events,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// 使用真实网络的管理器，cookie 在所有博客间共享。
    pub fn with_network(config: Arc<Config>, events: EventSink) -> Result<Self, FetchError> {
        let jar = Arc::new(SharedCookieJar::new());
        let factory = RequestFactory::new(&config, jar)?;
        Ok(Self::new(config, Arc::new(factory), events))
    }

    pub fn with_index(mut self, index: BlogIndex) -> Self {
        self.index = index;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn index(&self) -> &BlogIndex {
        &self.index
    }

    fn deps(&self, blog: &Blog, control: &CrawlControl) -> CrawlerDeps {
        CrawlerDeps {
            config: Arc::clone(&self.config),
            transport: Arc::clone(&self.transport),
            control: control.clone(),
            events: self.events.clone(),
            queue: Arc::new(PostQueue::new()),
            progress: Arc::new(BlogProgress::new(&blog.name, self.events.clone())),
        }
    }

    /// 更新 `blog.online` 并返回结果。没有专用爬虫的类型退回到 HEAD 探测。
    pub fn check_online(&self, blog: &mut Blog) -> bool {
        let deps = self.deps(blog, &CrawlControl::new());
        match Crawler::for_blog(blog, deps) {
            Ok(crawler) => match crawler.is_online(blog) {
                Ok(()) => true,
                Err(e) => {
                    debug!(target: "manager", blog = %blog.name, error = %e, "在线检查未通过");
                    blog.online
                }
            },
            Err(_) => {
                blog.online = self
                    .transport
                    .remote_page_is_valid(&blog.url)
                    .unwrap_or(false);
                blog.online
            }
        }
    }

    pub fn check_online_all(&self, blogs: &mut [Blog]) {
        let semaphore = Semaphore::new(ONLINE_CHECK_LIMIT);
        thread::scope(|s| {
            for blog in blogs.iter_mut() {
                let permit = semaphore.acquire();
                s.spawn(move || {
                    let _permit = permit;
                    self.check_online(blog);
                });
            }
        });
        let online = blogs.iter().filter(|b| b.online).count();
        info!(target: "manager", total = blogs.len(), online, "在线检查完成");
    }

    pub fn crawl(&self, blog: &mut Blog, control: &CrawlControl) -> Result<CrawlOutcome, CrawlError> {
        let _active = self.claim(&blog.name)?;
        let deps = self.deps(blog, control);
        let crawler = Crawler::for_blog(blog, deps.clone())?;
        info!(target: "manager", blog = %blog.name, "开始爬取");

        if let Err(e) = crawler.is_online(blog) {
            warn!(target: "manager", blog = %blog.name, error = %e, "博客不可用，跳过");
            self.save(blog);
            deps.progress.clear();
            return Ok(CrawlOutcome {
                cancelled: control.cancel.is_cancelled(),
                ..CrawlOutcome::default()
            });
        }

        let downloader = BlogDownloader::new(blog, &deps);
        let (stats, download) = thread::scope(|s| {
            let worker = s.spawn(|| downloader.run());
            let stats = crawler.discover();
            crawler.finalize_stats(blog);
            let download = worker.join().unwrap_or_else(|_| {
                error!(target: "manager", blog = %blog.name, "下载线程异常退出");
                DownloadOutcome::default()
            });
            (stats, download)
        });

        blog.apply_download(&download);
        let cancelled = control.cancel.is_cancelled();
        if !cancelled {
            blog.mark_complete();
        }
        blog.progress.clear();
        self.save(blog);

        let downloaded = download.downloaded.total();
        info!(
            target: "manager",
            blog = %blog.name,
            pages = stats.pages_crawled,
            total = blog.total_count,
            downloaded,
            cancelled,
            "爬取结束"
        );
        deps.progress
            .advance(format!("finished: {downloaded} downloaded"));
        deps.progress.clear();

        Ok(CrawlOutcome {
            success: download.any_success(),
            cancelled,
            stats,
            download,
        })
    }

    /// 删除索引；配置允许时连同下载目录一起删除。
    pub fn remove(&self, blog: &Blog) -> Result<(), IndexError> {
        self.index.delete(
            blog,
            &self.config.download_root(),
            !self.config.delete_only_index,
        )
    }

    fn save(&self, blog: &Blog) {
        if let Err(e) = self.index.save(blog) {
            error!(target: "manager", blog = %blog.name, error = %e, "保存博客失败");
            self.events
                .error(e.to_string(), "could not save blog index", &blog.name);
        }
    }

    fn claim(&self, name: &str) -> Result<ActiveCrawl<'_>, CrawlError> {
        if !lock(&self.active).insert(name.to_string()) {
            return Err(CrawlError::AlreadyCrawling(name.to_string()));
        }
        Ok(ActiveCrawl {
            active: &self.active,
            name: name.to_string(),
        })
    }
}

struct ActiveCrawl<'a> {
    active: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for ActiveCrawl<'_> {
    fn drop(&mut self) {
        lock(self.active).remove(&self.name);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    struct Offline {
        jar: SharedCookieJar,
    }

    impl HttpTransport for Offline {
        fn fetch_text(&self, url: &str, _referer: Option<&str>) -> Result<String, FetchError> {
            Err(FetchError::Network {
                url: url.to_string(),
                message: "connection refused".into(),
            })
        }

        fn post_form(
            &self,
            url: &str,
            _referer: Option<&str>,
            _headers: &[(&str, &str)],
            _form: &[(&str, &str)],
        ) -> Result<String, FetchError> {
            self.fetch_text(url, None)
        }

        fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, FetchError> {
            Err(FetchError::Network {
                url: url.to_string(),
                message: "connection refused".into(),
            })
        }

        fn remote_page_is_valid(&self, url: &str) -> Result<bool, FetchError> {
            Ok(url.contains("tagged"))
        }

        fn cookie_jar(&self) -> &SharedCookieJar {
            &self.jar
        }
    }

    fn manager(root: &std::path::Path) -> CrawlManager {
        let config = Arc::new(Config {
            download_location: root.display().to_string(),
            ..Config::default()
        });
        CrawlManager::new(
            config,
            Arc::new(Offline {
                jar: SharedCookieJar::new(),
            }),
            EventSink::disabled(),
        )
    }

    #[test]
    fn offline_blog_is_saved_and_unsuccessful() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let mut blog = Blog::from_url("https://foo.tumblr.com").unwrap();
        blog.online = true;

        let outcome = m.crawl(&mut blog, &CrawlControl::new()).unwrap();
        assert!(!outcome.success);
        assert!(!blog.online);
        assert!(blog.last_complete_crawl.is_none());
        assert!(m.index().contains(&blog));
    }

    #[test]
    fn second_concurrent_crawl_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let guard = m.claim("foo").unwrap();
        let mut blog = Blog::from_url("https://foo.tumblr.com").unwrap();
        let err = m.crawl(&mut blog, &CrawlControl::new()).unwrap_err();
        assert!(matches!(err, CrawlError::AlreadyCrawling(name) if name == "foo"));
        drop(guard);
        assert!(m.crawl(&mut blog, &CrawlControl::new()).is_ok());
    }

    #[test]
    fn unsupported_kinds_cannot_be_crawled_but_can_be_checked() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let mut blog = Blog::from_url("https://www.tumblr.com/tagged/cats").unwrap();
        assert!(matches!(
            m.crawl(&mut blog, &CrawlControl::new()),
            Err(CrawlError::UnsupportedKind(_))
        ));
        assert!(m.check_online(&mut blog));
    }

    #[test]
    fn check_online_all_visits_every_blog() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let mut blogs: Vec<Blog> = (0..40)
            .map(|i| {
                let mut b = Blog::from_url(&format!("https://b{i}.tumblr.com")).unwrap();
                b.online = true;
                b
            })
            .collect();
        m.check_online_all(&mut blogs);
        assert!(blogs.iter().all(|b| !b.online));
    }
}
