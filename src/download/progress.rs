//! 进度与错误事件的发布，以及 CLI 端的进度条显示。
//!
//! 爬虫和下载器只持有 `EventSink`，不关心谁在消费；CLI 通过
//! `CliProgress` 把事件画成每个博客一行的 spinner。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::warn;

use super::models::{CrawlEvent, DownloadProgress, ErrorReport};

#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<CrawlEvent>>,
}

impl EventSink {
    pub fn new(tx: Sender<CrawlEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn channel() -> (Self, Receiver<CrawlEvent>) {
        let (tx, rx) = unbounded();
        (Self::new(tx), rx)
    }

    /// 丢弃所有事件。
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn progress(&self, blog: &str, progress: usize, message: impl Into<String>) {
        self.send(CrawlEvent::Progress {
            blog: blog.to_string(),
            progress: DownloadProgress {
                progress,
                message: message.into(),
            },
        });
    }

    pub fn clear(&self, blog: &str) {
        self.progress(blog, 0, "");
    }

    pub fn error(
        &self,
        detail: impl Into<String>,
        message: impl Into<String>,
        context: impl Into<String>,
    ) {
        self.send(CrawlEvent::Error(ErrorReport {
            detail: detail.into(),
            message: message.into(),
            context: context.into(),
        }));
    }

    fn send(&self, event: CrawlEvent) {
        if let Some(tx) = self.tx.as_ref() {
            // 接收端已关闭时直接丢弃
            let _ = tx.send(event);
        }
    }
}

/// 一次爬取的进度计数。爬虫、下载器和编排层共用同一个实例，
/// 自增与发送在同一把锁内完成，接收端看到的计数严格递增。
#[derive(Debug)]
pub struct BlogProgress {
    blog: String,
    events: EventSink,
    count: Mutex<usize>,
}

impl BlogProgress {
    pub fn new(blog: impl Into<String>, events: EventSink) -> Self {
        Self {
            blog: blog.into(),
            events,
            count: Mutex::new(0),
        }
    }

    /// 推进一个工作单元并发布消息，返回新的计数。
    pub fn advance(&self, message: impl Into<String>) -> usize {
        let mut count = self.lock();
        *count += 1;
        self.events.progress(&self.blog, *count, message);
        *count
    }

    pub fn current(&self) -> usize {
        *self.lock()
    }

    /// 清空状态文本。计数不回退，清空事件的进度值固定为 0。
    pub fn clear(&self) {
        let _count = self.lock();
        self.events.clear(&self.blog);
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 终端进度显示：每个博客一个 spinner，错误打印在进度条上方。
pub struct CliProgress {
    mp: MultiProgress,
    style: ProgressStyle,
    bars: HashMap<String, ProgressBar>,
}

impl CliProgress {
    pub fn new() -> Self {
        let style = ProgressStyle::with_template("{spinner} {prefix:.bold} [{elapsed}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        Self {
            mp: MultiProgress::with_draw_target(ProgressDrawTarget::stderr()),
            style,
            bars: HashMap::new(),
        }
    }

    /// 在后台线程消费事件，直到所有发送端被丢弃。
    pub fn spawn(rx: Receiver<CrawlEvent>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut view = CliProgress::new();
            for event in rx {
                view.handle(event);
            }
            view.finish();
        })
    }

    pub fn handle(&mut self, event: CrawlEvent) {
        match event {
            CrawlEvent::Progress { blog, progress } => {
                let bar = self.bar(&blog);
                if progress.message.is_empty() {
                    bar.finish_with_message("done");
                } else {
                    bar.set_message(progress.message);
                }
            }
            CrawlEvent::Error(report) => {
                warn!(
                    target: "download",
                    context = %report.context,
                    detail = %report.detail,
                    "{}",
                    report.message
                );
                let _ = self
                    .mp
                    .println(format!("[{}] {}", report.context, report.message));
            }
        }
    }

    fn bar(&mut self, blog: &str) -> &ProgressBar {
        self.bars.entry(blog.to_string()).or_insert_with(|| {
            let bar = self.mp.add(ProgressBar::new_spinner());
            bar.set_style(self.style.clone());
            bar.set_prefix(blog.to_string());
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        })
    }

    pub fn finish(&mut self) {
        for (_, bar) in self.bars.drain() {
            bar.finish_and_clear();
        }
    }
}

impl Default for CliProgress {
    fn default() -> Self {
        Self::new()
    }
}
