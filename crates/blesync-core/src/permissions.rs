//! 权限检查
//!
//! 广播、扫描和 GATT 连接都需要外部授权。授权本身由外部组件完成
//! （桌面环境、polkit 或测试桩），这里只定义查询接口。缺少授权时操作
//! 立即以 `PermissionDenied` 失败，不会触碰无线电。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::SyncError;

/// 需要授权的能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Advertise,
    Scan,
    Connect,
}

impl Capability {
    pub const ALL: [Capability; 3] = [Capability::Advertise, Capability::Scan, Capability::Connect];

    pub fn name(&self) -> &'static str {
        match self {
            Capability::Advertise => "advertise",
            Capability::Scan => "scan",
            Capability::Connect => "connect",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 权限授予方
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn is_granted(&self, capability: Capability) -> bool;
}

/// 授予所有能力
pub struct AllowAll;

#[async_trait]
impl PermissionGate for AllowAll {
    async fn is_granted(&self, _capability: Capability) -> bool {
        true
    }
}

/// 固定的授权集合（来自配置文件）
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    granted: HashSet<Capability>,
}

impl StaticPermissions {
    pub fn new(granted: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            granted: granted.into_iter().collect(),
        }
    }

    pub fn grant(&mut self, capability: Capability) {
        self.granted.insert(capability);
    }

    pub fn revoke(&mut self, capability: Capability) {
        self.granted.remove(&capability);
    }
}

#[async_trait]
impl PermissionGate for StaticPermissions {
    async fn is_granted(&self, capability: Capability) -> bool {
        self.granted.contains(&capability)
    }
}

/// 检查一组能力，返回第一个缺失的
pub async fn require(
    gate: &dyn PermissionGate,
    capabilities: &[Capability],
) -> Result<(), SyncError> {
    for &capability in capabilities {
        if !gate.is_granted(capability).await {
            return Err(SyncError::PermissionDenied(capability));
        }
    }
    Ok(())
}
