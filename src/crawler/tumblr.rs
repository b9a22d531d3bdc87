//! `https://<name>.tumblr.com` 博客的爬虫。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;

use tracing::{debug, error, info, warn};

use super::extract::{self, ExtractOptions};
use super::pagination::{LiteralPageNumber, PaginationProbe};
use super::{CrawlPhase, CrawlerDeps};
use crate::base_system::control::Semaphore;
use crate::download::models::{DiscoveryStats, Post};
use crate::download::post_queue::CompleteOnDrop;
use crate::error::{CrawlError, FetchError};
use crate::library::blog::Blog;

const TUMBLR_REFERER: &str = "https://www.tumblr.com/";
const BLOG_AUTH_URL: &str = "https://www.tumblr.com/blog_auth/";

pub struct TumblrBlogCrawler {
    name: String,
    host_name: String,
    url: String,
    password: Option<String>,
    tags: Vec<String>,
    opts: ExtractOptions,
    deps: CrawlerDeps,
    probe: Box<dyn PaginationProbe>,
    pages_crawled: AtomicUsize,
    // 本次发现的全部条目（含重复），用于计算统计
    collected: Mutex<Vec<Post>>,
    stats: Mutex<Option<DiscoveryStats>>,
}

impl TumblrBlogCrawler {
    pub fn new(blog: &Blog, deps: CrawlerDeps) -> Self {
        let opts = ExtractOptions {
            photos: blog.download_photo,
            videos: blog.download_video,
            skip_gif: blog.skip_gif,
            image_size: deps.config.image_size,
            video_size: deps.config.video_size,
        };
        let mut url = blog.url.clone();
        if !url.ends_with('/') {
            url.push('/');
        }
        Self {
            name: blog.name.clone(),
            host_name: blog.host_name(),
            url,
            password: blog.password().map(str::to_string),
            tags: blog.tag_list(),
            opts,
            deps,
            probe: Box::new(LiteralPageNumber),
            pages_crawled: AtomicUsize::new(0),
            collected: Mutex::new(Vec::new()),
            stats: Mutex::new(None),
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn PaginationProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn page_url(&self, page: usize) -> String {
        format!("{}page/{}", self.url, page)
    }

    fn authenticate(&self) -> Result<(), CrawlError> {
        let Some(password) = self.password.as_deref() else {
            return Err(self.auth_error("no password configured"));
        };
        let transport = &self.deps.transport;
        let auth_url = format!("{BLOG_AUTH_URL}{}", self.name);
        let document = transport
            .post_form(&auth_url, Some(&auth_url), &[], &[("password", password)])
            .map_err(|e| self.auth_error(format!("password request failed: {e}")))?;
        let token = extract::auth_token(&document)
            .ok_or_else(|| self.auth_error("auth token missing from response"))?;

        let blog_url = format!("https://{}.tumblr.com/", self.host_name);
        let jar = transport.cookie_jar();
        let before = jar.cookies_for(&blog_url);
        transport
            .post_form(&blog_url, Some(&auth_url), &[("DNT", "1")], &[("auth", token)])
            .map_err(|e| self.auth_error(format!("token request failed: {e}")))?;
        // 之前的响应可能已经写过 cookie，必须是这次新增或改变的才算会话
        let after = jar.cookies_for(&blog_url);
        if !after.iter().any(|pair| !before.contains(pair)) {
            return Err(self.auth_error("no session cookie received"));
        }
        info!(target: "crawler", blog = %self.name, "密码认证完成");
        Ok(())
    }

    fn auth_error(&self, reason: impl Into<String>) -> CrawlError {
        CrawlError::Authentication {
            blog: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn scan(&self, first_page: usize, step: usize) {
        let control = &self.deps.control;
        let mut page = first_page;
        loop {
            if !control.checkpoint() {
                debug!(target: "crawler", blog = %self.name, page, "扫描已取消");
                return;
            }
            let url = self.page_url(page);
            let document = match self.deps.transport.fetch_text(&url, Some(TUMBLR_REFERER)) {
                Ok(doc) => doc,
                Err(e) if e.is_not_found() => {
                    debug!(target: "crawler", blog = %self.name, page, "页面不存在，扫描结束");
                    return;
                }
                Err(e) => {
                    self.report_page_error(&e);
                    return;
                }
            };
            if control.cancel.is_cancelled() {
                return;
            }

            for post in extract::page_posts(&document, &self.opts) {
                self.enqueue(post);
            }

            let crawled = self.pages_crawled.fetch_add(1, Ordering::SeqCst) + 1;
            self.deps.progress.advance(format!("crawling page {crawled}"));

            if !self.probe.has_next_page(&document, page) {
                debug!(target: "crawler", blog = %self.name, page, "没有下一页");
                return;
            }
            page += step;
        }
    }

    fn enqueue(&self, post: Post) {
        lock(&self.collected).push(post.clone());
        if let Err(e) = self.deps.queue.add(post) {
            warn!(target: "crawler", blog = %self.name, error = %e, "队列已关闭");
        }
    }

    fn report_page_error(&self, e: &FetchError) {
        error!(target: "crawler", blog = %self.name, error = %e, "抓取页面失败");
        let message = if e.is_timeout() {
            "timeout reached while crawling"
        } else {
            "could not fetch page"
        };
        self.deps.events.error(e.to_string(), message, &self.name);
    }
}

impl CrawlPhase for TumblrBlogCrawler {
    fn is_online(&self, blog: &mut Blog) -> Result<(), CrawlError> {
        let result = self.deps.transport.fetch_text(&self.url, Some(TUMBLR_REFERER));
        let document = match result {
            Ok(doc) => doc,
            Err(e) if e.is_timeout() => {
                error!(target: "crawler", blog = %self.name, error = %e, "在线检查超时");
                self.deps.events.error(
                    e.to_string(),
                    "timeout reached while checking online status",
                    &self.name,
                );
                blog.online = false;
                return Err(CrawlError::Offline {
                    blog: self.name.clone(),
                });
            }
            Err(e) => {
                debug!(target: "crawler", blog = %self.name, error = %e, "博客离线");
                blog.online = false;
                return Err(CrawlError::Offline {
                    blog: self.name.clone(),
                });
            }
        };

        blog.online = true;
        if extract::is_password_protected(&document) {
            warn!(target: "crawler", blog = %self.name, "博客受密码保护");
            self.deps
                .events
                .error("password protected", "password protected", &self.name);
            self.authenticate()?;
        }
        Ok(())
    }

    fn discover(&self) -> DiscoveryStats {
        let _complete = CompleteOnDrop(&self.deps.queue);
        let scans = self.deps.config.concurrent_scans.max(1);
        if !self.tags.is_empty() {
            debug!(target: "crawler", blog = %self.name, tags = ?self.tags, "标签");
        }
        info!(target: "crawler", blog = %self.name, scanners = scans, "开始扫描分页");

        let semaphore = Semaphore::new(scans);
        thread::scope(|s| {
            for first_page in 1..=scans {
                let permit = semaphore.acquire();
                s.spawn(move || {
                    let _permit = permit;
                    self.scan(first_page, scans);
                });
            }
        });
        self.deps.queue.complete();

        let stats = DiscoveryStats::from_posts(
            self.pages_crawled.load(Ordering::SeqCst),
            lock(&self.collected).iter(),
        );
        info!(
            target: "crawler",
            blog = %self.name,
            pages = stats.pages_crawled,
            found = stats.discovered.total(),
            duplicates = stats.duplicates.total(),
            "扫描完成"
        );
        *lock(&self.stats) = Some(stats.clone());
        stats
    }

    fn finalize_stats(&self, blog: &mut Blog) {
        self.deps.progress.advance("evaluating unique downloads");
        if let Some(stats) = lock(&self.stats).take() {
            blog.apply_discovery(&stats);
        }
        lock(&self.collected).clear();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Read;
    use std::sync::Arc;

    use crate::base_system::context::Config;
    use crate::base_system::control::CrawlControl;
    use crate::download::models::CrawlEvent;
    use crate::download::post_queue::PostQueue;
    use crate::download::progress::{BlogProgress, EventSink};
    use crate::network_parser::cookies::SharedCookieJar;
    use crate::network_parser::request_factory::HttpTransport;

    #[derive(Default)]
    struct MapTransport {
        pages: HashMap<String, Result<String, u16>>,
        posts: Mutex<Vec<(String, String)>>,
        jar: SharedCookieJar,
        // 提交 auth 令牌后是否下发会话 cookie
        grants_session: bool,
        auth_times_out: bool,
    }

    impl HttpTransport for MapTransport {
        fn fetch_text(&self, url: &str, _referer: Option<&str>) -> Result<String, FetchError> {
            match self.pages.get(url) {
                Some(Ok(body)) => Ok(body.clone()),
                Some(Err(0)) => Err(FetchError::Timeout { url: url.into() }),
                Some(Err(status)) => Err(FetchError::Status {
                    status: *status,
                    url: url.into(),
                }),
                None => Err(FetchError::Status {
                    status: 404,
                    url: url.into(),
                }),
            }
        }

        fn post_form(
            &self,
            url: &str,
            _referer: Option<&str>,
            _headers: &[(&str, &str)],
            form: &[(&str, &str)],
        ) -> Result<String, FetchError> {
            let body = crate::network_parser::request_factory::url_encode(form);
            lock(&self.posts).push((url.to_string(), body));
            if self.auth_times_out {
                return Err(FetchError::Timeout { url: url.into() });
            }
            if url.contains("blog_auth") {
                Ok(r#"<input name="auth" value="tok">"#.to_string())
            } else {
                if self.grants_session {
                    self.jar.merge(url, ["pfs=session; Path=/"]);
                }
                Ok(String::new())
            }
        }

        fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, FetchError> {
            Err(FetchError::Build(url.to_string()))
        }

        fn remote_page_is_valid(&self, _url: &str) -> Result<bool, FetchError> {
            Ok(true)
        }

        fn cookie_jar(&self) -> &SharedCookieJar {
            &self.jar
        }
    }

    fn crawler(
        transport: MapTransport,
        scans: usize,
    ) -> (
        TumblrBlogCrawler,
        Arc<PostQueue>,
        crossbeam_channel::Receiver<CrawlEvent>,
    ) {
        let (events, rx) = EventSink::channel();
        let queue = Arc::new(PostQueue::new());
        let progress = Arc::new(BlogProgress::new("foo", events.clone()));
        let deps = CrawlerDeps {
            config: Arc::new(Config {
                concurrent_scans: scans,
                ..Config::default()
            }),
            transport: Arc::new(transport),
            control: CrawlControl::new(),
            events,
            queue: Arc::clone(&queue),
            progress,
        };
        let mut blog = Blog::from_url("https://foo.tumblr.com").unwrap();
        blog.password = "hunter2".into();
        (TumblrBlogCrawler::new(&blog, deps), queue, rx)
    }

    fn page(photo: &str, next: Option<usize>) -> Result<String, u16> {
        let link = next.map(|n| format!("<a href=\"/page/{n}\">")).unwrap_or_default();
        Ok(format!(
            "<img src=\"https://64.media.tumblr.com/{photo}/tumblr_{photo}_500.jpg\">{link}"
        ))
    }

    #[test]
    fn discovers_every_page_once_and_completes_queue() {
        let mut t = MapTransport::default();
        t.pages.insert("https://foo.tumblr.com/page/1".into(), page("a", Some(2)));
        t.pages.insert("https://foo.tumblr.com/page/2".into(), page("b", Some(3)));
        t.pages.insert("https://foo.tumblr.com/page/3".into(), page("a", None));
        let (c, queue, _rx) = crawler(t, 2);

        let stats = c.discover();
        assert!(queue.is_completed());
        assert_eq!(stats.pages_crawled, 3);
        assert_eq!(stats.discovered.photos, 3);
        assert_eq!(stats.duplicates.photos, 1);
        assert_eq!(queue.len(), 3);

        let mut blog = Blog::from_url("https://foo.tumblr.com").unwrap();
        c.finalize_stats(&mut blog);
        assert_eq!(blog.total_count, 2);
        assert_eq!(blog.duplicate_photos, 1);
    }

    #[test]
    fn password_protected_blog_authenticates() {
        let mut t = MapTransport {
            grants_session: true,
            ..MapTransport::default()
        };
        t.pages.insert(
            "https://foo.tumblr.com/".into(),
            Ok(r#"<form id="auth_password" method="post">"#.into()),
        );
        let (c, _queue, rx) = crawler(t, 1);
        let mut blog = Blog::from_url("https://foo.tumblr.com").unwrap();
        c.is_online(&mut blog).unwrap();
        assert!(blog.online);
        assert!(rx.try_iter().any(|e| matches!(e, CrawlEvent::Error(r) if r.message == "password protected")));

        assert!(c.deps.transport.cookie_jar().has_cookies_for("https://foo.tumblr.com/"));
    }

    #[test]
    fn timeout_on_online_check_reports_and_marks_offline() {
        let mut t = MapTransport::default();
        t.pages.insert("https://foo.tumblr.com/".into(), Err(0));
        let (c, _queue, rx) = crawler(t, 1);
        let mut blog = Blog::from_url("https://foo.tumblr.com").unwrap();
        blog.online = true;
        assert!(matches!(c.is_online(&mut blog), Err(CrawlError::Offline { .. })));
        assert!(!blog.online);
        let reports: Vec<_> = rx
            .try_iter()
            .filter(|e| matches!(e, CrawlEvent::Error(_)))
            .collect();
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn network_failure_is_offline_without_report() {
        let mut t = MapTransport::default();
        t.pages.insert("https://foo.tumblr.com/".into(), Err(503));
        let (c, _queue, rx) = crawler(t, 1);
        let mut blog = Blog::from_url("https://foo.tumblr.com").unwrap();
        assert!(c.is_online(&mut blog).is_err());
        assert!(!blog.online);
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn cancelled_before_start_still_completes_queue() {
        let mut t = MapTransport::default();
        t.pages.insert("https://foo.tumblr.com/page/1".into(), page("a", Some(2)));
        let (c, queue, _rx) = crawler(t, 3);
        c.deps.control.cancel.cancel();
        let stats = c.discover();
        assert_eq!(stats.pages_crawled, 0);
        assert!(queue.is_completed());
        assert!(queue.is_empty());
    }

    fn protected_root() -> MapTransport {
        let mut t = MapTransport::default();
        t.pages.insert(
            "https://foo.tumblr.com/".into(),
            Ok(r#"<form id="auth_password" method="post">"#.into()),
        );
        t
    }

    #[test]
    fn earlier_cookie_is_not_taken_as_session() {
        let t = protected_root();
        t.jar.merge("https://foo.tumblr.com/", ["tmgioct=visitor; Path=/"]);
        let (c, _queue, _rx) = crawler(t, 1);
        let mut blog = Blog::from_url("https://foo.tumblr.com").unwrap();

        let err = c.is_online(&mut blog).unwrap_err();
        assert!(
            matches!(&err, CrawlError::Authentication { reason, .. } if reason == "no session cookie received"),
            "{err}"
        );
    }

    #[test]
    fn auth_request_timeout_is_authentication_failure() {
        let mut t = protected_root();
        t.auth_times_out = true;
        let (c, _queue, _rx) = crawler(t, 1);
        let mut blog = Blog::from_url("https://foo.tumblr.com").unwrap();

        let err = c.is_online(&mut blog).unwrap_err();
        assert!(matches!(err, CrawlError::Authentication { .. }), "{err}");
    }

    #[test]
    fn page_progress_is_monotonic() {
        let mut t = MapTransport::default();
        for p in 1..=4 {
            let next = (p < 4).then_some(p + 1);
            t.pages.insert(format!("https://foo.tumblr.com/page/{p}"), page("a", next));
        }
        let (c, _queue, rx) = crawler(t, 3);
        c.discover();
        let mut blog = Blog::from_url("https://foo.tumblr.com").unwrap();
        c.finalize_stats(&mut blog);

        let counts: Vec<usize> = rx
            .try_iter()
            .filter_map(|e| match e {
                CrawlEvent::Progress { progress, .. } => Some(progress.progress),
                CrawlEvent::Error(_) => None,
            })
            .collect();
        assert_eq!(counts, [1, 2, 3, 4, 5]);
    }
}
