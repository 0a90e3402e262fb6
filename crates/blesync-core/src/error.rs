//! 错误分类
//!
//! 所有对外报告的失败都归入 [`FailureCause`] 中的一类，并附带可读描述。
//! 单条广播记录的失败不会中断扫描会话；角色启动失败会使协调器回到 Idle。

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::permissions::Capability;
use crate::sync::Role;

/// 失败原因分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureCause {
    /// 缺少必要的授权
    PermissionDenied,
    /// 编码后的载荷超出广播容量
    PayloadTooLarge,
    /// 控制器的广播实例已用尽
    TooManyAdvertisers,
    /// 该角色已经处于活动状态
    AlreadyActive,
    /// 硬件或平台不支持
    Unsupported,
    /// 协议栈内部错误，通常是暂时性的
    Internal,
    /// 无法解码的数据
    InvalidData,
}

impl FailureCause {
    /// 获取可读描述
    pub fn describe(&self) -> &'static str {
        match self {
            FailureCause::PermissionDenied => "required permission not granted",
            FailureCause::PayloadTooLarge => "advertisement data too large",
            FailureCause::TooManyAdvertisers => "too many advertisers",
            FailureCause::AlreadyActive => "already started",
            FailureCause::Unsupported => "feature unsupported",
            FailureCause::Internal => "internal error",
            FailureCause::InvalidData => "invalid data",
        }
    }

    /// 只有内部错误允许重试（且最多一次）
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureCause::Internal)
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// 核心库错误
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Permission denied: {0} not granted")]
    PermissionDenied(Capability),

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("{0} role already active")]
    AlreadyActive(Role),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Radio failure: {0}")]
    Radio(FailureCause),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Coordinator is no longer running")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to serialize settings: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

impl SyncError {
    /// 归类到 [`FailureCause`]
    pub fn cause(&self) -> FailureCause {
        match self {
            SyncError::PermissionDenied(_) => FailureCause::PermissionDenied,
            SyncError::PayloadTooLarge { .. } => FailureCause::PayloadTooLarge,
            SyncError::AlreadyActive(_) => FailureCause::AlreadyActive,
            SyncError::Unsupported(_) => FailureCause::Unsupported,
            SyncError::Radio(cause) => *cause,
            SyncError::InvalidData(_) => FailureCause::InvalidData,
            SyncError::ChannelClosed
            | SyncError::Io(_)
            | SyncError::ConfigParse(_)
            | SyncError::ConfigSerialize(_) => FailureCause::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_mapping() {
        let err = SyncError::PayloadTooLarge { size: 40, max: 31 };
        assert_eq!(err.cause(), FailureCause::PayloadTooLarge);
        assert_eq!(err.to_string(), "Payload too large: 40 bytes (max: 31)");

        let err = SyncError::PermissionDenied(Capability::Scan);
        assert_eq!(err.cause(), FailureCause::PermissionDenied);
        assert!(err.to_string().contains("scan"));
    }

    #[test]
    fn test_only_internal_is_retryable() {
        assert!(FailureCause::Internal.is_retryable());
        assert!(!FailureCause::PayloadTooLarge.is_retryable());
        assert!(!FailureCause::Unsupported.is_retryable());
    }
}
