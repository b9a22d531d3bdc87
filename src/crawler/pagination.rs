//! 判断分页是否还有下一页。

/// 根据刚抓取的页面决定扫描是否继续。
pub trait PaginationProbe: Send + Sync {
    fn has_next_page(&self, document: &str, page: usize) -> bool;
}

/// 页面中出现 `page + 1` 的字面数字即认为还有下一页。
///
/// 这是一个很宽松的判断：任何包含该数字的文本（时间戳、ID）都会命中，
/// 结果偏向多抓一页，多出的页面通常以 404 结束。
#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralPageNumber;

impl PaginationProbe for LiteralPageNumber {
    fn has_next_page(&self, document: &str, page: usize) -> bool {
        document.contains(&(page + 1).to_string())
    }
}

/// 查找 `/page/<n+1>` 链接，比字面数字更可靠。
#[derive(Debug, Clone, Copy, Default)]
pub struct NextPageLink;

impl PaginationProbe for NextPageLink {
    fn has_next_page(&self, document: &str, page: usize) -> bool {
        let link = format!("/page/{}", page + 1);
        document.match_indices(&link).any(|(idx, _)| {
            document[idx + link.len()..]
                .chars()
                .next()
                .is_none_or(|c| !c.is_ascii_digit())
        })
    }
}
