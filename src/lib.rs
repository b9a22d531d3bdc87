//! 博客媒体爬取与下载。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置 / 日志 / 取消与暂停等基础设施
//! - `network_parser`：请求构造、共享 cookie、限速流
//! - `crawler`：在线检查、密码认证、分页发现
//! - `download`：待下载队列、下载器、进度事件
//! - `library`：博客条目与索引目录
//! - `manager`：单次爬取的编排

pub mod base_system;
pub mod crawler;
pub mod download;
pub mod error;
pub mod library;
pub mod manager;
pub mod network_parser;

pub use base_system::context::Config;
pub use base_system::control::{CancelToken, CrawlControl, PauseToken};
pub use error::{CrawlError, FetchError};
pub use manager::{CrawlManager, CrawlOutcome};
