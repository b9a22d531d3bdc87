//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息。爬取期间配置以
//! `Arc<Config>` 的形式只读共享。

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::{ConfigSpec, FieldMeta};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 路径配置
    #[serde(default)]
    pub download_location: String,

    // 网络配置
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_concurrent_scans")]
    pub concurrent_scans: usize,
    #[serde(default = "default_concurrent_connections")]
    pub concurrent_connections: usize,
    #[serde(default = "default_false")]
    pub limit_scan_bandwidth: bool,
    #[serde(default = "default_bandwidth_kib")]
    pub bandwidth_kib: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    // 代理配置
    #[serde(default)]
    pub proxy_host: String,
    #[serde(default)]
    pub proxy_port: String,
    #[serde(default)]
    pub proxy_username: String,
    #[serde(default)]
    pub proxy_password: String,

    // 媒体配置
    #[serde(default = "default_video_size")]
    pub video_size: u32,
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    #[serde(default = "default_false")]
    pub skip_gif: bool,
    #[serde(default = "default_true")]
    pub download_photos: bool,
    #[serde(default = "default_true")]
    pub download_videos: bool,
    #[serde(default = "default_false")]
    pub download_audios: bool,

    // 库管理配置
    #[serde(default = "default_true")]
    pub check_online_status_on_startup: bool,
    #[serde(default = "default_true")]
    pub delete_only_index: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_location: String::new(),
            timeout_secs: default_timeout_secs(),
            concurrent_scans: default_concurrent_scans(),
            concurrent_connections: default_concurrent_connections(),
            limit_scan_bandwidth: default_false(),
            bandwidth_kib: default_bandwidth_kib(),
            user_agent: default_user_agent(),
            proxy_host: String::new(),
            proxy_port: String::new(),
            proxy_username: String::new(),
            proxy_password: String::new(),
            video_size: default_video_size(),
            image_size: default_image_size(),
            skip_gif: default_false(),
            download_photos: default_true(),
            download_videos: default_true(),
            download_audios: default_false(),
            check_online_status_on_startup: default_true(),
            delete_only_index: default_true(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 19] = [
            FieldMeta {
                name: "download_location",
                description: "下载根目录（留空为当前目录下的 Blogs），索引保存在其中的 Index 子目录",
            },
            FieldMeta {
                name: "timeout_secs",
                description: "请求超时时间（秒）",
            },
            FieldMeta {
                name: "concurrent_scans",
                description: "每个博客并发扫描的页面数",
            },
            FieldMeta {
                name: "concurrent_connections",
                description: "每个博客并发下载的连接数",
            },
            FieldMeta {
                name: "limit_scan_bandwidth",
                description: "是否限制传输带宽",
            },
            FieldMeta {
                name: "bandwidth_kib",
                description: "总带宽上限（KiB/s），按并发连接数平分",
            },
            FieldMeta {
                name: "user_agent",
                description: "请求使用的 User-Agent",
            },
            FieldMeta {
                name: "proxy_host",
                description: "代理主机（留空不使用代理）",
            },
            FieldMeta {
                name: "proxy_port",
                description: "代理端口",
            },
            FieldMeta {
                name: "proxy_username",
                description: "代理用户名（可留空）",
            },
            FieldMeta {
                name: "proxy_password",
                description: "代理密码（可留空）",
            },
            FieldMeta {
                name: "video_size",
                description: "视频分辨率, 可选: [1080, 480]",
            },
            FieldMeta {
                name: "image_size",
                description: "图片尺寸, 可选: [1280, 500, 400, 250, 100, 75]",
            },
            FieldMeta {
                name: "skip_gif",
                description: "新添加博客默认是否跳过 gif",
            },
            FieldMeta {
                name: "download_photos",
                description: "新添加博客默认是否下载图片",
            },
            FieldMeta {
                name: "download_videos",
                description: "新添加博客默认是否下载视频",
            },
            FieldMeta {
                name: "download_audios",
                description: "新添加博客默认是否下载音频",
            },
            FieldMeta {
                name: "check_online_status_on_startup",
                description: "启动时检查所有博客的在线状态",
            },
            FieldMeta {
                name: "delete_only_index",
                description: "删除博客时只删除索引文件，保留已下载文件",
            },
        ];
        &FIELDS
    }

    fn validate(&self) -> Result<(), String> {
        if !matches!(self.video_size, 480 | 1080) {
            return Err(format!(
                "video_size must be 480 or 1080, got {}",
                self.video_size
            ));
        }
        if self.concurrent_scans == 0 || self.concurrent_connections == 0 {
            return Err("concurrent_scans / concurrent_connections must be >= 1".to_string());
        }
        Ok(())
    }
}

impl Config {
    pub fn download_root(&self) -> PathBuf {
        if self.download_location.trim().is_empty() {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("Blogs")
        } else {
            PathBuf::from(&self.download_location)
        }
    }

    pub fn index_dir(&self) -> PathBuf {
        self.download_root().join("Index")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// 每条连接的限速（字节/秒），0 表示不限速。
    pub fn per_stream_bytes_per_sec(&self) -> u64 {
        if !self.limit_scan_bandwidth || self.bandwidth_kib == 0 {
            return 0;
        }
        let connections = self.concurrent_connections.max(1) as u64;
        (self.bandwidth_kib / connections).max(1) * 1024
    }

    pub fn proxy_url(&self) -> Option<String> {
        let host = self.proxy_host.trim();
        let port = self.proxy_port.trim();
        if host.is_empty() || port.is_empty() {
            return None;
        }
        if host.contains("://") {
            Some(format!("{host}:{port}"))
        } else {
            Some(format!("http://{host}:{port}"))
        }
    }

    pub fn proxy_credentials(&self) -> Option<(&str, &str)> {
        if self.proxy_username.is_empty() || self.proxy_password.is_empty() {
            return None;
        }
        Some((&self.proxy_username, &self.proxy_password))
    }
}

pub fn safe_fs_name(name: &str, replacement: &str, max_len: usize) -> String {
    let fallback = replacement.chars().next().unwrap_or('_');
    let mut cleaned: String = name
        .chars()
        .map(|ch| match ch {
            ':' | '"' | '<' | '>' | '/' | '\\' | '|' | '?' | '*' => fallback,
            c if (c as u32) < 32 => fallback,
            _ => ch,
        })
        .collect();

    while cleaned.ends_with(' ') || cleaned.ends_with('.') {
        cleaned.pop();
    }

    if cleaned.is_empty() {
        cleaned.push_str("unnamed");
    }

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    let upper = cleaned.to_uppercase();
    if RESERVED.contains(&upper.as_str()) {
        cleaned = format!("_{}", cleaned);
    }

    if cleaned.len() > max_len {
        // 避免在多字节 UTF-8 字符中间截断导致 panic
        let mut end = max_len;
        while !cleaned.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        cleaned.truncate(end);
        if cleaned.is_empty() {
            cleaned.push_str("unnamed");
        }
    }

    cleaned
}

fn default_false() -> bool {
    false
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_concurrent_scans() -> usize {
    4
}

fn default_concurrent_connections() -> usize {
    8
}

fn default_bandwidth_kib() -> u64 {
    0
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120 Safari/537.36".to_string()
}

fn default_video_size() -> u32 {
    1080
}

fn default_image_size() -> u32 {
    1280
}
