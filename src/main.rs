//! tumbl-downloader 命令行入口。

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use tumbl_downloader::base_system::config::load_or_create;
use tumbl_downloader::base_system::context::Config;
use tumbl_downloader::base_system::control::CrawlControl;
use tumbl_downloader::base_system::logging::{LogOptions, LogSystem};
use tumbl_downloader::download::progress::{CliProgress, EventSink};
use tumbl_downloader::library::blog::Blog;
use tumbl_downloader::library::index::IndexError;
use tumbl_downloader::manager::CrawlManager;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "tumbl-downloader", version = VERSION)]
#[command(about = "Crawl blogs and download their photos and videos")]
struct Cli {
    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 数据目录路径（存放 config.yml 和 logs）
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 添加博客（可一次添加多个地址）
    Add { urls: Vec<String> },
    /// 列出已添加的博客
    List,
    /// 检查所有博客的在线状态
    Check,
    /// 爬取博客；不指定名称时爬取全部在线博客
    Crawl {
        names: Vec<String>,
        /// 只爬取从未完整爬取过的博客
        #[arg(long, default_value_t = false)]
        new_only: bool,
        /// 只爬取已经完整爬取过的博客
        #[arg(long, default_value_t = false, conflicts_with = "new_only")]
        crawled_only: bool,
    },
    /// 移除博客索引（`delete_only_index: false` 时同时删除已下载文件）
    Remove { names: Vec<String> },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.as_deref();
    let _log = init_logging(cli.debug, data_dir)?;

    let config: Config =
        load_or_create(None, data_dir).map_err(|e| anyhow!(e.to_string()))?;
    let config = Arc::new(config);

    let (events, rx) = EventSink::channel();
    let view = CliProgress::spawn(rx);
    let manager =
        CrawlManager::with_network(Arc::clone(&config), events).context("初始化网络客户端失败")?;

    let result = match cli.command {
        Command::Add { urls } => add(&manager, &urls),
        Command::List => list(&manager),
        Command::Check => check(&manager),
        Command::Crawl {
            names,
            new_only,
            crawled_only,
        } => crawl(&manager, &names, new_only, crawled_only),
        Command::Remove { names } => remove(&manager, &names),
    };

    // 所有发送端释放后进度线程才会退出
    drop(manager);
    let _ = view.join();
    result
}

fn init_logging(debug: bool, base_dir: Option<&Path>) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        logs_dir: base_dir
            .map(|d| d.join("logs"))
            .unwrap_or_else(|| PathBuf::from("logs")),
        ..LogOptions::default()
    };
    LogSystem::init(opts).map_err(|e| anyhow!(e))
}

fn load_library(manager: &CrawlManager) -> Result<Vec<Blog>> {
    manager
        .index()
        .load_all()
        .with_context(|| format!("读取索引失败: {}", manager.index().dir().display()))
}

fn select<'a>(blogs: &'a mut [Blog], names: &[String]) -> Vec<&'a mut Blog> {
    blogs
        .iter_mut()
        .filter(|b| names.is_empty() || names.iter().any(|n| n == &b.name))
        .collect()
}

fn add(manager: &CrawlManager, urls: &[String]) -> Result<()> {
    if urls.is_empty() {
        return Err(anyhow!("请至少提供一个博客地址"));
    }
    for url in urls {
        match manager.index().add_from_url(url, manager.config()) {
            Ok(blog) => println!("已添加: {} ({})", blog.name, blog.kind),
            Err(IndexError::AlreadyExists(name)) => println!("已存在: {name}"),
            Err(e) => warn!(target: "startup", url = %url, "无法添加: {e}"),
        }
    }
    Ok(())
}

fn list(manager: &CrawlManager) -> Result<()> {
    let blogs = load_library(manager)?;
    if blogs.is_empty() {
        println!("还没有添加任何博客");
        return Ok(());
    }
    println!("\n===== 博客列表 =====");
    for b in &blogs {
        let last = b
            .last_complete_crawl
            .map(|t| t.date().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} | {} | {} | 上次完成: {} | 条目: {} | 已下载: {}",
            b.name,
            b.kind,
            if b.online { "在线" } else { "离线" },
            last,
            b.total_count,
            b.downloaded_photos + b.downloaded_videos + b.downloaded_audios,
        );
    }
    println!();
    Ok(())
}

fn check(manager: &CrawlManager) -> Result<()> {
    let mut blogs = load_library(manager)?;
    manager.check_online_all(&mut blogs);
    for b in &blogs {
        manager.index().save(b)?;
        println!("{}: {}", b.name, if b.online { "在线" } else { "离线" });
    }
    Ok(())
}

fn crawl(
    manager: &CrawlManager,
    names: &[String],
    new_only: bool,
    crawled_only: bool,
) -> Result<()> {
    let mut blogs = load_library(manager)?;
    let mut selected = select(&mut blogs, names);
    if selected.is_empty() {
        println!("没有匹配的博客");
        return Ok(());
    }

    if manager.config().check_online_status_on_startup {
        let mut checked: Vec<Blog> = selected.iter().map(|b| (**b).clone()).collect();
        manager.check_online_all(&mut checked);
        for (dst, src) in selected.iter_mut().zip(checked) {
            dst.online = src.online;
        }
    }
    selected.retain(|b| b.online);
    if new_only {
        selected.retain(|b| !b.has_been_crawled());
    }
    if crawled_only {
        selected.retain(|b| b.has_been_crawled());
    }

    let control = CrawlControl::new();
    install_controls(&control)?;

    for blog in selected {
        if control.cancel.is_cancelled() {
            break;
        }
        match manager.crawl(blog, &control) {
            Ok(outcome) => println!(
                "{}: 页面 {} | 条目 {} | 重复 {} | 下载 {} | 失败 {}{}",
                blog.name,
                outcome.stats.pages_crawled,
                blog.total_count,
                outcome.stats.duplicates.total(),
                outcome.download.downloaded.total(),
                outcome.download.failed,
                if outcome.cancelled { " (已取消)" } else { "" },
            ),
            Err(e) => warn!(target: "manager", blog = %blog.name, "无法爬取: {e}"),
        }
    }
    Ok(())
}

/// Ctrl-C 取消当前爬取；标准输入 `p` 暂停、`r` 恢复。
fn install_controls(control: &CrawlControl) -> Result<()> {
    let cancel = control.cancel.clone();
    ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            std::process::exit(130);
        }
        warn!(target: "manager", "收到中断信号，正在停止（再次按下立即退出）");
        cancel.cancel();
    })
    .context("无法注册 Ctrl-C 处理")?;

    let pause = control.pause.clone();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match line.trim() {
                "p" => {
                    pause.pause();
                    info!(target: "manager", "已暂停，输入 r 恢复");
                }
                "r" => {
                    pause.resume();
                    info!(target: "manager", "已恢复");
                }
                _ => {}
            }
        }
    });
    Ok(())
}

fn remove(manager: &CrawlManager, names: &[String]) -> Result<()> {
    if names.is_empty() {
        return Err(anyhow!("请至少提供一个博客名称"));
    }
    let mut blogs = load_library(manager)?;
    for blog in select(&mut blogs, names) {
        manager.remove(blog)?;
        println!("已移除: {}", blog.name);
    }
    Ok(())
}
