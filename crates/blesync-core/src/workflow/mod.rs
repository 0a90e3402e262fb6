//! 工作流模块
//!
//! 在协调器之上封装演示场景：
//!
//! - **presenter**: 服务端选择文档、翻页并广播页码
//! - **follower**: 客户端根据收到的值打开文档或跳页

pub mod follower;
pub mod presenter;

use std::fmt;

pub use follower::{Follower, Renderer};
pub use presenter::{Document, DocumentSource, Presenter};

const PAGE_PREFIX: &str = "PAGE:";

/// 同步值的含义
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncValue {
    /// `PAGE:<n>`，页码从 0 开始
    Page(u32),
    /// 其他内容（通常是文档名称）
    Text(String),
}

impl SyncValue {
    pub fn parse(value: &str) -> Self {
        value
            .strip_prefix(PAGE_PREFIX)
            .and_then(|page| page.parse().ok())
            .map_or_else(|| SyncValue::Text(value.to_string()), SyncValue::Page)
    }
}

impl From<&str> for SyncValue {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl fmt::Display for SyncValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncValue::Page(page) => write!(f, "{}{}", PAGE_PREFIX, page),
            SyncValue::Text(text) => f.write_str(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_values() {
        assert_eq!(SyncValue::parse("PAGE:5"), SyncValue::Page(5));
        assert_eq!(SyncValue::Page(12).to_string(), "PAGE:12");
    }

    #[test]
    fn test_other_values_are_text() {
        assert_eq!(
            SyncValue::parse("PAGE:five"),
            SyncValue::Text("PAGE:five".to_string())
        );
        assert_eq!(SyncValue::parse("PAGE:-1"), SyncValue::Text("PAGE:-1".to_string()));
        assert_eq!(
            SyncValue::from("slides.pdf"),
            SyncValue::Text("slides.pdf".to_string())
        );
        assert_eq!(SyncValue::parse("slides.pdf").to_string(), "slides.pdf");
    }
}
