//! 从页面文档中提取媒体链接。全部是纯函数，便于单独测试。

use std::sync::OnceLock;

use regex::Regex;

use crate::download::models::Post;

static RE_PHOTO: OnceLock<Regex> = OnceLock::new();
static RE_VIDEO: OnceLock<Regex> = OnceLock::new();
static RE_SIZE: OnceLock<Regex> = OnceLock::new();
static RE_AUTH: OnceLock<Regex> = OnceLock::new();

const PASSWORD_FORM: &str = r#"<form id="auth_password" method="post">"#;
const VIDEO_HOST: &str = "https://vt.tumblr.com/";

fn re_photo() -> &'static Regex {
    RE_PHOTO.get_or_init(|| {
        Regex::new(r#""(http[A-Za-z0-9_/:.]*media\.tumblr\.com[A-Za-z0-9_/:.]*(jpg|png|gif))""#)
            .expect("compile RE_PHOTO")
    })
}

fn re_video() -> &'static Regex {
    RE_VIDEO.get_or_init(|| {
        Regex::new(r#""(http[A-Za-z0-9_/:.]*\.com/video_file/[A-Za-z0-9_/:.]*)""#)
            .expect("compile RE_VIDEO")
    })
}

fn re_size() -> &'static Regex {
    RE_SIZE.get_or_init(|| {
        Regex::new(r"_(1280|540|500|400|250|100|75sq)\.(jpg|png|gif)$").expect("compile RE_SIZE")
    })
}

fn re_auth() -> &'static Regex {
    RE_AUTH.get_or_init(|| Regex::new(r#"name="auth" value="(\S*)""#).expect("compile RE_AUTH"))
}

/// 提取阶段需要的过滤选项。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    pub photos: bool,
    pub videos: bool,
    pub skip_gif: bool,
    pub image_size: u32,
    pub video_size: u32,
}

pub fn is_password_protected(document: &str) -> bool {
    document.contains(PASSWORD_FORM)
}

/// 认证表单中的 `auth` 令牌；空值视为缺失。
pub fn auth_token(document: &str) -> Option<&str> {
    re_auth()
        .captures(document)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|s| !s.is_empty())
}

/// 头像与预览图不是博客内容。
fn is_ignored_photo(url: &str) -> bool {
    url.contains("avatar") || url.contains("previews")
}

/// 把尺寸后缀改写为目标尺寸；没有尺寸后缀的 URL 原样返回。
pub fn resize_image_url(url: &str, image_size: u32) -> String {
    re_size()
        .replace(url, format!("_{image_size}.${{2}}"))
        .into_owned()
}

/// `…/video_file/…/<id>[/480]` → `https://vt.tumblr.com/<id>.mp4`（或 `_480.mp4`）。
pub fn video_download_url(video_file_url: &str, video_size: u32) -> Option<String> {
    let stripped = video_file_url.replace("/480", "");
    let id = stripped.trim_end_matches('/').rsplit('/').next()?;
    if id.is_empty() || id == "video_file" {
        return None;
    }
    match video_size {
        480 => Some(format!("{VIDEO_HOST}{id}_480.mp4")),
        _ => Some(format!("{VIDEO_HOST}{id}.mp4")),
    }
}

pub fn photo_posts(document: &str, opts: &ExtractOptions) -> Vec<Post> {
    if !opts.photos {
        return Vec::new();
    }
    re_photo()
        .captures_iter(document)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|url| !is_ignored_photo(url))
        .filter(|url| !(opts.skip_gif && url.ends_with(".gif")))
        .map(|url| Post::photo(resize_image_url(url, opts.image_size)))
        .collect()
}

pub fn video_posts(document: &str, opts: &ExtractOptions) -> Vec<Post> {
    if !opts.videos {
        return Vec::new();
    }
    re_video()
        .captures_iter(document)
        .filter_map(|c| c.get(1))
        .filter_map(|m| video_download_url(m.as_str(), opts.video_size))
        .map(Post::video)
        .collect()
}

/// 一页中的全部候选条目：先图片后视频。
pub fn page_posts(document: &str, opts: &ExtractOptions) -> Vec<Post> {
    let mut posts = photo_posts(document, opts);
    posts.extend(video_posts(document, opts));
    posts
}
