//! 应用配置和持久化
//!
//! 服务/特征 UUID、厂商 ID、载荷预算和重启延迟等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::ble::mgmt_advertiser;
use crate::ble::{CHARACTERISTIC_UUID, MANUFACTURER_ID, SERVICE_UUID};
use crate::codec::TruncationMode;
use crate::error::SyncError;
use crate::permissions::Capability;

/// 广播后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdvertiserBackend {
    /// BlueZ D-Bus `LEAdvertisingManager1`
    #[default]
    Dbus,
    /// 内核 MGMT socket，精确控制 Legacy 广播数据（需要 `CAP_NET_ADMIN`）
    Mgmt,
}

/// 同步设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// 广播和 GATT 服务 UUID
    pub service_uuid: Uuid,
    /// GATT 特征 UUID
    pub characteristic_uuid: Uuid,
    /// 厂商数据字段的厂商 ID
    pub vendor_id: u16,
    /// 载荷最大字节数（受 Legacy 广播容量约束）
    pub max_payload_bytes: usize,
    /// 消息前缀，为空则不使用
    pub message_prefix: String,
    /// 截断模式
    pub truncation: TruncationMode,
    /// 停止广播到重新开始之间的等待时间
    pub restart_settle_ms: u64,
    /// 内部错误时的重试次数
    pub retry_limit: u8,
    /// 广播中包含设备名称
    pub include_device_name: bool,
    /// 广播中包含发射功率
    pub include_tx_power: bool,
    /// 是否开放 GATT 服务
    pub connectable: bool,
    /// 设备名称
    pub device_name: String,
    /// 广播后端
    pub backend: AdvertiserBackend,
    /// 控制器索引 (0 = hci0)
    pub controller_index: u16,
    /// 服务端启动时广播的初始值
    pub initial_value: String,
    /// 已授予的能力
    pub capabilities: Vec<Capability>,
    /// 事件日志保留条数
    pub journal_capacity: usize,
    /// 详细日志模式
    pub verbose: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID,
            characteristic_uuid: CHARACTERISTIC_UUID,
            vendor_id: MANUFACTURER_ID,
            max_payload_bytes: 18,
            message_prefix: String::new(),
            truncation: TruncationMode::default(),
            restart_settle_ms: 100,
            retry_limit: 1,
            include_device_name: false,
            include_tx_power: false,
            connectable: true,
            device_name: get_default_device_name(),
            backend: AdvertiserBackend::default(),
            controller_index: 0,
            initial_value: "server-ready".to_string(),
            capabilities: Capability::ALL.to_vec(),
            journal_capacity: 64,
            verbose: false,
        }
    }
}

impl SyncSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("blesync");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> Result<(), SyncError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = self.to_toml()?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, SyncError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// 实际可用的载荷字节数
    ///
    /// 取配置值与 Legacy 广播剩余容量中的较小者。
    pub fn payload_limit(&self) -> usize {
        self.max_payload_bytes
            .min(mgmt_advertiser::payload_capacity(self.include_tx_power))
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    /// 广播中使用的本地名称
    pub fn local_name(&self) -> Option<String> {
        self.include_device_name.then(|| self.device_name.clone())
    }
}

/// 获取默认设备名称（主机名）
fn get_default_device_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "blesync".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = SyncSettings::default();
        assert_eq!(settings.vendor_id, 0xFFFF);
        assert_eq!(settings.payload_limit(), 18);
        assert_eq!(settings.restart_settle(), Duration::from_millis(100));
        assert!(settings.local_name().is_none());
        assert_eq!(settings.capabilities.len(), 3);
    }

    #[test]
    fn test_payload_limit_is_capped_by_layout() {
        let settings = SyncSettings {
            max_payload_bytes: 64,
            ..Default::default()
        };
        assert_eq!(settings.payload_limit(), 24);

        let settings = SyncSettings {
            max_payload_bytes: 64,
            include_tx_power: true,
            ..Default::default()
        };
        assert_eq!(settings.payload_limit(), 21);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: SyncSettings = toml::from_str(
            r#"
            vendor_id = 76
            message_prefix = "BLE:"
            truncation = "byte"
            backend = "mgmt"
            "#,
        )
        .unwrap();

        assert_eq!(settings.vendor_id, 0x004C);
        assert_eq!(settings.message_prefix, "BLE:");
        assert_eq!(settings.truncation, TruncationMode::Byte);
        assert_eq!(settings.backend, AdvertiserBackend::Mgmt);
        assert_eq!(settings.service_uuid, SERVICE_UUID);
        assert_eq!(settings.max_payload_bytes, 18);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blesync").join("settings.toml");

        let settings = SyncSettings {
            device_name: "thinkpad-z13".to_string(),
            include_device_name: true,
            capabilities: vec![Capability::Scan],
            ..Default::default()
        };
        settings.save_to(&path).unwrap();

        let loaded = SyncSettings::load_from(&path);
        assert_eq!(loaded, settings);
        assert_eq!(loaded.local_name().as_deref(), Some("thinkpad-z13"));
    }

    #[test]
    fn test_broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "vendor_id = \"not a number\"").unwrap();

        let loaded = SyncSettings::load_from(&path);
        assert_eq!(loaded.vendor_id, MANUFACTURER_ID);
    }
}
