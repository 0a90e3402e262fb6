//! 载荷编解码
//!
//! 把应用层字符串放进固定大小的厂商数据字段：UTF-8 编码后截断到
//! `max_bytes`，编码永不失败，只报告是否发生了截断。
//!
//! # 截断模式
//!
//! - [`TruncationMode::Byte`]: 严格按字节截断，可能切断多字节字符，
//!   接收端会把这样的载荷当作无效数据
//! - [`TruncationMode::CharBoundary`]: 向下取整到最近的字符边界（默认）

use serde::{Deserialize, Serialize};

use crate::config::SyncSettings;
use crate::error::SyncError;

/// 无法解码时返回的占位字符串
pub const INVALID_DATA: &str = "<invalid data>";

/// 截断模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TruncationMode {
    Byte,
    #[default]
    CharBoundary,
}

/// 编码结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub truncated: bool,
    /// 截断前的字节数
    pub original_len: usize,
}

impl Encoded {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// 按字节截断编码
pub fn encode(value: &str, max_bytes: usize) -> Encoded {
    encode_with(value, max_bytes, TruncationMode::Byte)
}

/// 按指定模式截断编码
pub fn encode_with(value: &str, max_bytes: usize, mode: TruncationMode) -> Encoded {
    let raw = value.as_bytes();
    if raw.len() <= max_bytes {
        return Encoded {
            bytes: raw.to_vec(),
            truncated: false,
            original_len: raw.len(),
        };
    }

    let cut = match mode {
        TruncationMode::Byte => max_bytes,
        TruncationMode::CharBoundary => floor_char_boundary(value, max_bytes),
    };

    Encoded {
        bytes: raw[..cut].to_vec(),
        truncated: true,
        original_len: raw.len(),
    }
}

fn floor_char_boundary(value: &str, index: usize) -> usize {
    let mut i = index.min(value.len());
    while !value.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// 解码，失败时返回 [`INVALID_DATA`]
pub fn decode(bytes: &[u8]) -> String {
    try_decode(bytes).unwrap_or_else(|_| INVALID_DATA.to_string())
}

/// 解码并去掉尾部的 NUL 填充
pub fn try_decode(bytes: &[u8]) -> Result<String, SyncError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| SyncError::InvalidData(format!("payload is not valid UTF-8: {}", e)))?;
    Ok(text.trim_end_matches('\0').to_string())
}

/// 带容量、截断模式和消息前缀的编解码器
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadCodec {
    max_bytes: usize,
    mode: TruncationMode,
    prefix: String,
}

impl PayloadCodec {
    pub fn new(max_bytes: usize, mode: TruncationMode) -> Self {
        Self {
            max_bytes,
            mode,
            prefix: String::new(),
        }
    }

    /// 设置消息前缀，前缀占用载荷预算
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// 广播使用的编解码器
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(settings.payload_limit(), settings.truncation)
            .with_prefix(settings.message_prefix.clone())
    }

    /// GATT 使用的编解码器：无容量限制、无前缀
    pub fn unbounded() -> Self {
        Self::new(usize::MAX, TruncationMode::CharBoundary)
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// 去掉前缀后留给值本身的字节数
    pub fn value_budget(&self) -> usize {
        self.max_bytes.saturating_sub(self.prefix.len())
    }

    pub fn encode(&self, value: &str) -> Encoded {
        if self.prefix.is_empty() {
            encode_with(value, self.max_bytes, self.mode)
        } else {
            encode_with(&format!("{}{}", self.prefix, value), self.max_bytes, self.mode)
        }
    }

    /// 解码并剥离前缀；缺少前缀视为无效数据
    pub fn decode(&self, bytes: &[u8]) -> Result<String, SyncError> {
        let text = try_decode(bytes)?;
        if self.prefix.is_empty() {
            return Ok(text);
        }
        text.strip_prefix(self.prefix.as_str())
            .map(str::to_string)
            .ok_or_else(|| SyncError::InvalidData(format!("missing prefix '{}'", self.prefix)))
    }

    /// 把值截断到载荷预算内
    ///
    /// 结果必须仍是字符串，所以两种模式都在字符边界处截断。
    /// `Byte` 模式下广播出去的字节可能更长，但切断的字符在接收端本来就无法解码。
    pub fn clamp(&self, value: &str) -> String {
        let cut = floor_char_boundary(value, self.value_budget());
        value[..cut].to_string()
    }
}
