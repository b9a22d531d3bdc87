//! 出站请求构造与执行。
//!
//! 所有请求共享同一个 `SharedCookieJar`：发送前从中读取 cookie，
//! 收到响应后把 `Set-Cookie` 合并回去。响应体在启用带宽限制时经过
//! `ThrottledStream` 读取。

use std::io::Read;
use std::sync::Arc;

use reqwest::blocking::{Client, ClientBuilder, RequestBuilder, Response};
use reqwest::header::{
    ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, REFERER, USER_AGENT,
};
use reqwest::{Proxy, StatusCode, redirect};
use tracing::{debug, warn};

use super::cookies::SharedCookieJar;
use super::throttle::ThrottledStream;
use crate::base_system::context::Config;
use crate::error::FetchError;

const MAX_REDIRECTS: usize = 10;
const XHR_ACCEPT: &str = "application/json, text/javascript, */*; q=0.01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Get,
    GetXhr,
    Post,
    PostXhr,
}

impl RequestKind {
    fn is_post(self) -> bool {
        matches!(self, RequestKind::Post | RequestKind::PostXhr)
    }

    fn is_xhr(self) -> bool {
        matches!(self, RequestKind::GetXhr | RequestKind::PostXhr)
    }
}

/// 爬虫与下载器依赖的网络接口。`RequestFactory` 是唯一的生产实现。
pub trait HttpTransport: Send + Sync {
    /// GET 并返回完整的响应文本。
    fn fetch_text(&self, url: &str, referer: Option<&str>) -> Result<String, FetchError>;

    /// 以表单方式 POST，返回响应文本；响应 cookie 写入共享 jar。
    fn post_form(
        &self,
        url: &str,
        referer: Option<&str>,
        headers: &[(&str, &str)],
        form: &[(&str, &str)],
    ) -> Result<String, FetchError>;

    /// 打开一个资源的字节流，用于下载。
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, FetchError>;

    /// HEAD 探测，仅当返回 200 时为 true。
    fn remote_page_is_valid(&self, url: &str) -> Result<bool, FetchError>;

    fn cookie_jar(&self) -> &SharedCookieJar;
}

pub struct RequestFactory {
    client: Client,
    head_client: Client,
    jar: Arc<SharedCookieJar>,
    user_agent: String,
    bytes_per_sec: u64,
}

impl RequestFactory {
    pub fn new(config: &Config, jar: Arc<SharedCookieJar>) -> Result<Self, FetchError> {
        let client = Self::client_builder(config, &jar)?
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| FetchError::Build(e.to_string()))?;
        let head_client = Self::client_builder(config, &jar)?
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| FetchError::Build(e.to_string()))?;

        Ok(Self {
            client,
            head_client,
            jar,
            user_agent: config.user_agent.clone(),
            bytes_per_sec: config.per_stream_bytes_per_sec(),
        })
    }

    fn client_builder(
        config: &Config,
        jar: &Arc<SharedCookieJar>,
    ) -> Result<ClientBuilder, FetchError> {
        let mut builder = Client::builder()
            .http1_only()
            .gzip(true)
            .deflate(true)
            .connect_timeout(config.timeout())
            .timeout(config.timeout())
            .cookie_provider(Arc::clone(jar));

        if let Some(proxy_url) = config.proxy_url() {
            let mut proxy =
                Proxy::all(&proxy_url).map_err(|e| FetchError::Build(e.to_string()))?;
            if let Some((user, pass)) = config.proxy_credentials() {
                proxy = proxy.basic_auth(user, pass);
            }
            debug!(target: "network", proxy = %proxy_url, "使用代理");
            builder = builder.proxy(proxy);
        }
        Ok(builder)
    }

    fn base_headers(&self, referer: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent)
                .unwrap_or(HeaderValue::from_static("Mozilla/5.0")),
        );
        if let Some(referer) = referer
            && let Ok(v) = HeaderValue::from_str(referer)
        {
            headers.insert(REFERER, v);
        }
        headers
    }

    /// 构造一个已配置好的请求。
    pub fn build(
        &self,
        kind: RequestKind,
        url: &str,
        referer: Option<&str>,
        extra_headers: &[(&str, &str)],
    ) -> RequestBuilder {
        let mut headers = self.base_headers(referer);
        if kind.is_post() {
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            );
        }
        if kind.is_xhr() {
            if !kind.is_post() {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            headers.insert(ACCEPT, HeaderValue::from_static(XHR_ACCEPT));
            headers.insert(
                HeaderName::from_static("x-requested-with"),
                HeaderValue::from_static("XMLHttpRequest"),
            );
        }
        for (name, value) in extra_headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(n), Ok(v)) => {
                    headers.insert(n, v);
                }
                _ => warn!(target: "network", header = name, "忽略非法请求头"),
            }
        }

        let builder = if kind.is_post() {
            self.client.post(url)
        } else {
            self.client.get(url)
        };
        builder.headers(headers)
    }

    pub fn remote_page_is_valid(&self, url: &str) -> Result<bool, FetchError> {
        let resp = self
            .head_client
            .head(url)
            .headers(self.base_headers(None))
            .send()
            .map_err(|e| FetchError::from_reqwest(url, e))?;
        Ok(resp.status() == StatusCode::OK)
    }

    /// 执行请求并读取完整响应体（按需限速）。
    pub fn read_request_to_end(
        &self,
        url: &str,
        request: RequestBuilder,
    ) -> Result<String, FetchError> {
        let resp = self.send(url, request)?;
        let mut body = Vec::new();
        ThrottledStream::new(resp, self.bytes_per_sec)
            .read_to_end(&mut body)
            .map_err(|e| FetchError::from_io(url, e))?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    fn send(&self, url: &str, request: RequestBuilder) -> Result<Response, FetchError> {
        let resp = request
            .send()
            .map_err(|e| FetchError::from_reqwest(url, e))?;
        debug!(target: "network", url, status = resp.status().as_u16(), "响应");
        resp.error_for_status()
            .map_err(|e| FetchError::from_reqwest(url, e))
    }
}

/// `k=v&k2=v2`，值做 URL 编码，末尾不带分隔符。
pub fn url_encode(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

impl HttpTransport for RequestFactory {
    fn fetch_text(&self, url: &str, referer: Option<&str>) -> Result<String, FetchError> {
        let request = self.build(RequestKind::Get, url, referer, &[]);
        self.read_request_to_end(url, request)
    }

    fn post_form(
        &self,
        url: &str,
        referer: Option<&str>,
        headers: &[(&str, &str)],
        form: &[(&str, &str)],
    ) -> Result<String, FetchError> {
        let request = self
            .build(RequestKind::Post, url, referer, headers)
            .body(url_encode(form));
        self.read_request_to_end(url, request)
    }

    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, FetchError> {
        let request = self.build(RequestKind::Get, url, None, &[]);
        let resp = self.send(url, request)?;
        Ok(Box::new(ThrottledStream::new(resp, self.bytes_per_sec)))
    }

    fn remote_page_is_valid(&self, url: &str) -> Result<bool, FetchError> {
        RequestFactory::remote_page_is_valid(self, url)
    }

    fn cookie_jar(&self) -> &SharedCookieJar {
        &self.jar
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory(config: &Config) -> RequestFactory {
        RequestFactory::new(config, Arc::new(SharedCookieJar::new())).unwrap()
    }

    #[test]
    fn url_encode_joins_without_trailing_separator() {
        assert_eq!(
            url_encode(&[("password", "a b&c"), ("redirect_to", "/x")]),
            "password=a%20b%26c&redirect_to=%2Fx"
        );
        assert_eq!(url_encode(&[]), "");
    }

    #[test]
    fn post_xhr_sets_form_and_xhr_headers() {
        let f = factory(&Config::default());
        let req = f
            .build(
                RequestKind::PostXhr,
                "https://www.tumblr.com/svc/x",
                Some("https://www.tumblr.com/"),
                &[("DNT", "1")],
            )
            .build()
            .unwrap();
        assert_eq!(*req.method(), reqwest::Method::POST);
        let h = req.headers();
        assert_eq!(h[CONTENT_TYPE], "application/x-www-form-urlencoded");
        assert_eq!(h[ACCEPT], XHR_ACCEPT);
        assert_eq!(h["x-requested-with"], "XMLHttpRequest");
        assert_eq!(h[REFERER], "https://www.tumblr.com/");
        assert_eq!(h["dnt"], "1");
    }

    #[test]
    fn get_xhr_uses_json_content_type() {
        let f = factory(&Config::default());
        let req = f
            .build(RequestKind::GetXhr, "https://www.tumblr.com/svc/x", None, &[])
            .build()
            .unwrap();
        assert_eq!(*req.method(), reqwest::Method::GET);
        assert_eq!(req.headers()[CONTENT_TYPE], "application/json");
        assert!(req.headers().get(REFERER).is_none());
    }

    #[test]
    fn plain_get_carries_user_agent_only() {
        let cfg = Config {
            user_agent: "agent/1.0".into(),
            ..Config::default()
        };
        let f = factory(&cfg);
        let req = f
            .build(RequestKind::Get, "https://foo.tumblr.com/", None, &[])
            .build()
            .unwrap();
        assert_eq!(req.headers()[USER_AGENT], "agent/1.0");
        assert!(req.headers().get(CONTENT_TYPE).is_none());
        assert!(req.headers().get("x-requested-with").is_none());
    }

    #[test]
    fn proxy_with_credentials_builds() {
        let cfg = Config {
            proxy_host: "127.0.0.1".into(),
            proxy_port: "3128".into(),
            proxy_username: "u".into(),
            proxy_password: "p".into(),
            ..Config::default()
        };
        assert!(RequestFactory::new(&cfg, Arc::new(SharedCookieJar::new())).is_ok());
    }
}
