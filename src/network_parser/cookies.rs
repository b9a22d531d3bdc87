//! 多个博客的认证流程共享的 Cookie 存储。
//!
//! 底层是 `cookie_store::CookieStore`，按 RFC 6265 处理 Domain/Path/Secure
//! 与过期；这里只包一层锁并接到 reqwest 的 `CookieStore` 上。

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use cookie_store::CookieStore as Store;
use reqwest::Url;
use reqwest::cookie::CookieStore;
use reqwest::header::HeaderValue;
use tracing::debug;

#[derive(Debug, Default)]
pub struct SharedCookieJar {
    store: RwLock<Store>,
}

impl SharedCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取会随请求 `url` 发送的全部未过期 cookie，按名称排序。
    pub fn cookies_for(&self, url: &str) -> Vec<(String, String)> {
        let Ok(url) = Url::parse(url) else {
            return Vec::new();
        };
        let mut out: Vec<(String, String)> = self
            .read()
            .get_request_values(&url)
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        out.sort();
        out
    }

    pub fn has_cookies_for(&self, url: &str) -> bool {
        !self.cookies_for(url).is_empty()
    }

    /// 合并一批 `Set-Cookie` 行；带过期时间的行会删除同名 cookie。
    pub fn merge<'a>(&self, url: &str, set_cookie_lines: impl IntoIterator<Item = &'a str>) {
        let Ok(url) = Url::parse(url) else {
            return;
        };
        let mut store = self.write();
        for line in set_cookie_lines {
            match store.parse(line, &url) {
                Ok(action) => {
                    debug!(target: "network", url = %url, action = ?action, "cookie stored")
                }
                Err(e) => debug!(target: "network", url = %url, error = %e, "cookie ignored"),
            }
        }
    }

    /// 直接写入一个对 `domain` 及其子域名生效的 cookie。
    pub fn insert(&self, domain: &str, name: &str, value: &str) {
        let domain = domain.trim_start_matches('.').to_ascii_lowercase();
        let line = format!("{name}={value}; Domain={domain}; Path=/");
        self.merge(&format!("https://{domain}/"), [line.as_str()]);
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.store
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.store
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CookieStore for SharedCookieJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let lines: Vec<&str> = cookie_headers.filter_map(|h| h.to_str().ok()).collect();
        self.merge(url.as_str(), lines);
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let header = self
            .read()
            .get_request_values(url)
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        if header.is_empty() {
            return None;
        }
        HeaderValue::from_str(&header).ok()
    }
}
