//! 从 `PostQueue` 取出条目并写入博客下载目录。
//!
//! 每个文件先写到同目录的临时文件，完整后再原子替换到目标路径，
//! 中途失败或取消不会留下半截文件。

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use tempfile::NamedTempFile;
use tracing::{debug, error, info};

use super::models::{DownloadOutcome, Post, PostKind};
use super::post_queue::PostQueue;
use super::progress::{BlogProgress, EventSink};
use crate::base_system::context::safe_fs_name;
use crate::base_system::control::{CrawlControl, Semaphore};
use crate::crawler::CrawlerDeps;
use crate::error::{CrawlError, FetchError};
use crate::library::blog::Blog;
use crate::network_parser::request_factory::HttpTransport;

const CHUNK: usize = 64 * 1024;
const MAX_NAME_LEN: usize = 200;

pub struct BlogDownloader {
    name: String,
    dir: PathBuf,
    connections: usize,
    transport: Arc<dyn HttpTransport>,
    control: CrawlControl,
    events: EventSink,
    queue: Arc<PostQueue>,
    progress: Arc<BlogProgress>,
}

impl BlogDownloader {
    pub fn new(blog: &Blog, deps: &CrawlerDeps) -> Self {
        Self {
            name: blog.name.clone(),
            dir: blog.download_dir(&deps.config.download_root()),
            connections: deps.config.concurrent_connections.max(1),
            transport: Arc::clone(&deps.transport),
            control: deps.control.clone(),
            events: deps.events.clone(),
            queue: Arc::clone(&deps.queue),
            progress: Arc::clone(&deps.progress),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 消费队列直到完成或取消，返回按类型统计的结果。
    pub fn run(&self) -> DownloadOutcome {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            error!(target: "download", dir = %self.dir.display(), error = %e, "无法创建下载目录");
            self.events
                .error(e.to_string(), "could not create download directory", &self.name);
            return DownloadOutcome::default();
        }

        let outcome = Mutex::new(DownloadOutcome::default());
        let semaphore = Semaphore::new(self.connections);
        // 去重与发现阶段的统计使用同一个标识
        let mut handled: HashSet<(PostKind, String)> = HashSet::new();
        let mut names = FileNames::default();

        thread::scope(|s| {
            for post in self.queue.drain() {
                if !self.control.checkpoint() {
                    debug!(target: "download", blog = %self.name, "下载已取消");
                    break;
                }
                let identity = post.identity();
                if !handled.insert((post.kind, identity.clone())) {
                    lock(&outcome).duplicates.bump(post.kind);
                    continue;
                }
                let target = self.dir.join(names.resolve(&post, identity));
                if target.exists() {
                    lock(&outcome).already_present += 1;
                    continue;
                }

                let permit = semaphore.acquire();
                let outcome = &outcome;
                s.spawn(move || {
                    let _permit = permit;
                    match self.download(&post, &target) {
                        Ok(()) => lock(outcome).downloaded.bump(post.kind),
                        Err(CrawlError::Cancelled) => {}
                        Err(e) => {
                            self.report(&post, &e);
                            lock(outcome).failed += 1;
                        }
                    }
                });
            }
        });

        let outcome = outcome.into_inner().unwrap_or_else(|p| p.into_inner());
        info!(
            target: "download",
            blog = %self.name,
            downloaded = outcome.downloaded.total(),
            duplicates = outcome.duplicates.total(),
            present = outcome.already_present,
            failed = outcome.failed,
            "下载结束"
        );
        outcome
    }

    fn download(&self, post: &Post, target: &Path) -> Result<(), CrawlError> {
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.progress.advance(format!("downloading {file_name}"));

        let mut reader = self.transport.open(&post.url)?;
        let persistence = |source: io::Error| CrawlError::Persistence {
            path: target.to_path_buf(),
            source,
        };
        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(persistence)?;

        let mut buf = vec![0u8; CHUNK];
        loop {
            if self.control.cancel.is_cancelled() {
                return Err(CrawlError::Cancelled);
            }
            let read = reader
                .read(&mut buf)
                .map_err(|e| FetchError::from_io(&post.url, e))?;
            if read == 0 {
                break;
            }
            tmp.write_all(&buf[..read]).map_err(persistence)?;
        }
        tmp.flush().map_err(persistence)?;
        tmp.persist(target).map_err(|e| persistence(e.error))?;
        debug!(target: "download", file = %target.display(), "已保存");
        Ok(())
    }

    fn report(&self, post: &Post, e: &CrawlError) {
        error!(target: "download", blog = %self.name, url = %post.url, error = %e, "下载失败");
        let message = match e {
            CrawlError::Fetch(f) if f.is_timeout() => "timeout reached while downloading",
            CrawlError::Persistence { .. } => "could not save file",
            _ => "could not download file",
        };
        self.events.error(e.to_string(), message, &self.name);
    }
}

/// 本次会话里文件名到标识的占用表。不同标识解析出同名文件时，
/// 后来者在扩展名前加上标识哈希的前 8 位。
#[derive(Debug, Default)]
struct FileNames {
    owners: HashMap<String, String>,
}

impl FileNames {
    fn resolve(&mut self, post: &Post, identity: String) -> String {
        let name = safe_fs_name(&post.file_name(), "_", MAX_NAME_LEN);
        match self.owners.get(&name) {
            None => {
                self.owners.insert(name.clone(), identity);
                name
            }
            Some(owner) if *owner == identity => name,
            Some(_) => {
                let suffix = &post.id[..8.min(post.id.len())];
                let renamed = match name.rsplit_once('.') {
                    Some((stem, ext)) => format!("{stem}_{suffix}.{ext}"),
                    None => format!("{name}_{suffix}"),
                };
                self.owners.insert(renamed.clone(), identity);
                renamed
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;

    use crate::base_system::context::Config;
    use crate::download::models::{CrawlEvent, PostKind};
    use crate::network_parser::cookies::SharedCookieJar;

    #[derive(Default)]
    struct FileTransport {
        files: HashMap<String, Vec<u8>>,
        jar: SharedCookieJar,
    }

    impl HttpTransport for FileTransport {
        fn fetch_text(&self, url: &str, _referer: Option<&str>) -> Result<String, FetchError> {
            Err(FetchError::Build(url.to_string()))
        }

        fn post_form(
            &self,
            url: &str,
            _referer: Option<&str>,
            _headers: &[(&str, &str)],
            _form: &[(&str, &str)],
        ) -> Result<String, FetchError> {
            Err(FetchError::Build(url.to_string()))
        }

        fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, FetchError> {
            match self.files.get(url) {
                Some(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
                None => Err(FetchError::Status {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }

        fn remote_page_is_valid(&self, _url: &str) -> Result<bool, FetchError> {
            Ok(true)
        }

        fn cookie_jar(&self) -> &SharedCookieJar {
            &self.jar
        }
    }

    fn setup(
        root: &Path,
        files: &[(&str, &str)],
    ) -> (BlogDownloader, crossbeam_channel::Receiver<CrawlEvent>) {
        let transport = FileTransport {
            files: files
                .iter()
                .map(|(u, b)| (u.to_string(), b.as_bytes().to_vec()))
                .collect(),
            ..FileTransport::default()
        };
        let (events, rx) = EventSink::channel();
        let progress = Arc::new(BlogProgress::new("foo", events.clone()));
        let deps = CrawlerDeps {
            config: Arc::new(Config {
                download_location: root.display().to_string(),
                concurrent_connections: 2,
                ..Config::default()
            }),
            transport: Arc::new(transport),
            control: CrawlControl::new(),
            events,
            queue: Arc::new(PostQueue::new()),
            progress,
        };
        let blog = Blog::from_url("https://foo.tumblr.com").unwrap();
        (BlogDownloader::new(&blog, &deps), rx)
    }

    #[test]
    fn downloads_unique_files_and_counts_duplicates() {
        let root = tempfile::tempdir().unwrap();
        let (dl, _rx) = setup(
            root.path(),
            &[
                ("https://m/a.jpg", "aaa"),
                ("https://m/b.jpg", "bbb"),
                ("https://v/c.mp4", "ccc"),
            ],
        );
        dl.queue.add(Post::photo("https://m/a.jpg")).unwrap();
        dl.queue.add(Post::photo("https://m/b.jpg")).unwrap();
        dl.queue.add(Post::photo("https://m/a.jpg?x=1")).unwrap();
        dl.queue.add(Post::video("https://v/c.mp4")).unwrap();
        dl.queue.complete();

        let outcome = dl.run();
        assert_eq!(outcome.downloaded.photos, 2);
        assert_eq!(outcome.downloaded.videos, 1);
        assert_eq!(outcome.duplicates.get(PostKind::Photo), 1);
        assert!(outcome.any_success());
        assert_eq!(fs::read(dl.dir().join("a.jpg")).unwrap(), b"aaa");
        assert_eq!(fs::read(dl.dir().join("c.mp4")).unwrap(), b"ccc");
    }

    #[test]
    fn existing_files_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let (dl, _rx) = setup(root.path(), &[("https://m/a.jpg", "new")]);
        fs::create_dir_all(dl.dir()).unwrap();
        fs::write(dl.dir().join("a.jpg"), b"old").unwrap();
        dl.queue.add(Post::photo("https://m/a.jpg")).unwrap();
        dl.queue.complete();

        let outcome = dl.run();
        assert_eq!(outcome.already_present, 1);
        assert!(!outcome.any_success());
        assert_eq!(fs::read(dl.dir().join("a.jpg")).unwrap(), b"old");
    }

    #[test]
    fn failed_download_is_reported_and_leaves_no_file() {
        let root = tempfile::tempdir().unwrap();
        let (dl, rx) = setup(root.path(), &[]);
        dl.queue.add(Post::photo("https://m/missing.jpg")).unwrap();
        dl.queue.complete();

        let outcome = dl.run();
        assert_eq!(outcome.failed, 1);
        assert!(!dl.dir().join("missing.jpg").exists());
        let errors = rx
            .try_iter()
            .filter(|e| matches!(e, CrawlEvent::Error(_)))
            .count();
        assert_eq!(errors, 1);
    }

    #[test]
    fn cancelled_downloader_stops_consuming() {
        let root = tempfile::tempdir().unwrap();
        let (dl, _rx) = setup(root.path(), &[("https://m/a.jpg", "a")]);
        dl.queue.add(Post::photo("https://m/a.jpg")).unwrap();
        dl.queue.complete();
        dl.control.cancel.cancel();

        let outcome = dl.run();
        assert_eq!(outcome.downloaded.total(), 0);
        assert!(!dl.dir().join("a.jpg").exists());
    }

    #[test]
    fn same_file_name_from_different_hosts_is_not_a_duplicate() {
        let root = tempfile::tempdir().unwrap();
        let a = "https://64.media.tumblr.com/x/tumblr_same_500.jpg";
        let b = "https://65.media.tumblr.com/y/tumblr_same_500.jpg";
        let (dl, _rx) = setup(root.path(), &[(a, "from-64"), (b, "from-65")]);
        let posts = [Post::photo(a), Post::photo(b)];
        for post in &posts {
            dl.queue.add(post.clone()).unwrap();
        }
        dl.queue.complete();

        let outcome = dl.run();
        let stats = crate::download::models::DiscoveryStats::from_posts(1, &posts);
        assert_eq!(outcome.duplicates, stats.duplicates);
        assert_eq!(outcome.downloaded.photos, 2);

        let mut written: Vec<Vec<u8>> = fs::read_dir(dl.dir())
            .unwrap()
            .map(|e| fs::read(e.unwrap().path()).unwrap())
            .collect();
        written.sort();
        assert_eq!(written, [b"from-64".to_vec(), b"from-65".to_vec()]);
        assert_eq!(fs::read(dl.dir().join("tumblr_same_500.jpg")).unwrap(), b"from-64");
    }

    #[test]
    fn download_progress_continues_shared_counter() {
        let root = tempfile::tempdir().unwrap();
        let (dl, rx) = setup(root.path(), &[("https://m/a.jpg", "a")]);
        dl.progress.advance("crawling page 1");
        dl.progress.advance("crawling page 2");
        dl.queue.add(Post::photo("https://m/a.jpg")).unwrap();
        dl.queue.complete();
        dl.run();

        let last = rx
            .try_iter()
            .filter_map(|e| match e {
                CrawlEvent::Progress { progress, .. } => Some(progress),
                CrawlEvent::Error(_) => None,
            })
            .last()
            .unwrap();
        assert_eq!(last.progress, 3);
        assert_eq!(last.message, "downloading a.jpg");
    }
}
