//! Legacy BLE Advertising via BlueZ MGMT API
//!
//! 直接使用 BlueZ Management Socket API 发送 Legacy Advertising，
//! 绕过 bluer 的 D-Bus 接口，对广播包布局有完全控制权。
//!
//! # 包布局
//!
//! ```text
//! Adv Data (31 字节):
//!   Flags            3 字节 (由内核添加)
//!   Manufacturer     4 字节头 + 载荷
//!   TX Power         3 字节 (可选, 由内核添加)
//!
//! Scan Response (31 字节):
//!   128-bit 服务 UUID 18 字节
//!   设备名称          剩余空间, 放不下时截短
//! ```
//!
//! 不设置 `SecondaryChannelWithLe*` 标志，强制使用 Legacy 模式。
//!
//! # 权限要求
//!
//! 需要 `CAP_NET_ADMIN` 权限：
//! ```bash
//! sudo setcap 'cap_net_admin+eip' your_binary
//! ```

use btmgmt::Client;
use btmgmt::command::{AddAdvertising, RemoveAdvertising};
use btmgmt::packet::{AdvDataScanResp, AdvertiseInstance, AdvertisingFlag};
use log::{debug, error, info, trace};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::ble::AdvertisementPacket;
use crate::error::{FailureCause, SyncError};

/// Legacy 广播数据上限
pub const MAX_ADV_DATA_LEN: usize = 31;

const FLAGS_FIELD_LEN: usize = 3;
/// 长度 + 类型 + 2 字节厂商 ID
const MANUFACTURER_HEADER_LEN: usize = 4;
const TX_POWER_FIELD_LEN: usize = 3;

const AD_TYPE_SHORTENED_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_NAME: u8 = 0x09;
const AD_TYPE_COMPLETE_128_UUIDS: u8 = 0x07;
const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// "Add TX Power field to Adv_Data"
const ADV_FLAG_TX_POWER: u32 = 1 << 4;

/// Legacy 广播包中厂商数据载荷的最大字节数
pub fn payload_capacity(include_tx_power: bool) -> usize {
    let capacity = MAX_ADV_DATA_LEN - FLAGS_FIELD_LEN - MANUFACTURER_HEADER_LEN;
    if include_tx_power {
        capacity - TX_POWER_FIELD_LEN
    } else {
        capacity
    }
}

/// Legacy 广播配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyAdvConfig {
    /// 控制器索引 (通常为 0 = hci0)
    pub controller_index: u16,
    /// 广播实例 ID (1-255)
    pub instance: u8,
    pub connectable: bool,
    pub discoverable: bool,
    /// 由内核追加 TX Power 字段
    pub include_tx_power: bool,
    /// 广播数据，不含 Flags
    pub adv_data: Vec<u8>,
    pub scan_rsp_data: Vec<u8>,
    /// 持续时间 (秒, 0=无限)
    pub duration: u16,
    /// 超时 (秒, 0=无限)
    pub timeout: u16,
}

impl Default for LegacyAdvConfig {
    fn default() -> Self {
        Self {
            controller_index: 0,
            instance: 1,
            connectable: true,
            discoverable: true,
            include_tx_power: false,
            adv_data: Vec::new(),
            scan_rsp_data: Vec::new(),
            duration: 0,
            timeout: 0,
        }
    }
}

impl LegacyAdvConfig {
    /// 按广播包构建 Legacy 广播配置
    ///
    /// 载荷超过 [`payload_capacity`] 时返回 [`SyncError::PayloadTooLarge`]。
    pub fn from_packet(
        packet: &AdvertisementPacket,
        controller_index: u16,
        instance: u8,
    ) -> Result<Self, SyncError> {
        let max = payload_capacity(packet.include_tx_power);
        if packet.payload.len() > max {
            return Err(SyncError::PayloadTooLarge {
                size: packet.payload.len(),
                max,
            });
        }

        let mut adv_data = Vec::with_capacity(MAX_ADV_DATA_LEN);
        adv_data.push((packet.payload.len() + 3) as u8);
        adv_data.push(AD_TYPE_MANUFACTURER_DATA);
        adv_data.extend_from_slice(&packet.vendor_id.to_le_bytes());
        adv_data.extend_from_slice(&packet.payload);

        let mut scan_rsp = Vec::with_capacity(MAX_ADV_DATA_LEN);
        scan_rsp.push(17);
        scan_rsp.push(AD_TYPE_COMPLETE_128_UUIDS);
        scan_rsp.extend_from_slice(&packet.service_uuid.as_u128().to_le_bytes());

        if let Some(name) = packet.local_name.as_deref() {
            let room = MAX_ADV_DATA_LEN - scan_rsp.len() - 2;
            let mut end = name.len().min(room);
            while !name.is_char_boundary(end) {
                end -= 1;
            }
            if end > 0 {
                let ad_type = if end < name.len() {
                    AD_TYPE_SHORTENED_NAME
                } else {
                    AD_TYPE_COMPLETE_NAME
                };
                scan_rsp.push((end + 1) as u8);
                scan_rsp.push(ad_type);
                scan_rsp.extend_from_slice(&name.as_bytes()[..end]);
            }
        }

        debug!(
            "Legacy adv config: adv_data={} bytes, scan_rsp={} bytes",
            adv_data.len(),
            scan_rsp.len()
        );
        trace!("Adv data: {:02x?}", adv_data);
        trace!("Scan rsp: {:02x?}", scan_rsp);

        Ok(Self {
            controller_index,
            instance,
            connectable: packet.connectable,
            include_tx_power: packet.include_tx_power,
            adv_data,
            scan_rsp_data: scan_rsp,
            ..Default::default()
        })
    }

    fn flags(&self) -> AdvertisingFlag {
        let mut flags = AdvertisingFlag::AddFlagsFieldToAdvData;
        if self.connectable {
            flags |= AdvertisingFlag::SwitchIntoConnectableMode;
        }
        if self.discoverable {
            flags |= AdvertisingFlag::AdvertiseAsDiscoverable;
        }
        if self.include_tx_power {
            flags |= AdvertisingFlag::from_bits_truncate(ADV_FLAG_TX_POWER);
        }
        flags
    }
}

/// 将 MGMT 错误归类
pub fn classify_error(error: &anyhow::Error) -> FailureCause {
    let text = format!("{:?}", error).to_lowercase();
    if text.contains("permission") || text.contains("not permitted") {
        FailureCause::PermissionDenied
    } else if text.contains("notsupported") || text.contains("not supported") {
        FailureCause::Unsupported
    } else if text.contains("busy") || text.contains("noresources") {
        FailureCause::TooManyAdvertisers
    } else if text.contains("invalidparameters") || text.contains("invalid parameters") {
        FailureCause::PayloadTooLarge
    } else {
        FailureCause::Internal
    }
}

/// MGMT Legacy 广播器
pub struct MgmtLegacyAdvertiser {
    client: Arc<Mutex<Client>>,
    controller_index: u16,
    active: Option<LegacyAdvConfig>,
}

impl MgmtLegacyAdvertiser {
    pub async fn new(controller_index: u16) -> anyhow::Result<Self> {
        debug!("Opening MGMT socket...");
        let client = Client::open()?;
        info!("MGMT socket opened successfully");

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            controller_index,
            active: None,
        })
    }

    pub fn controller_index(&self) -> u16 {
        self.controller_index
    }

    /// 启动 Legacy 广播，已有广播时先移除
    pub async fn start(&mut self, config: LegacyAdvConfig) -> anyhow::Result<()> {
        if self.active.is_some() {
            debug!("Advertising already active, stopping first...");
            self.stop().await?;
        }

        let flags = config.flags();
        debug!(
            "Starting Legacy advertising with flags: {:?} (bits: 0x{:08x})",
            flags,
            flags.bits()
        );

        let cmd = AddAdvertising::new(
            AdvertiseInstance::new(config.instance),
            flags,
            config.duration,
            config.timeout,
            AdvDataScanResp::new(config.adv_data.clone(), config.scan_rsp_data.clone()),
        );

        let client = self.client.lock().await;
        let reply = client.call(Some(config.controller_index), cmd).await?;
        drop(client);

        info!(
            "Legacy advertising started: instance={}, reply={:?}",
            config.instance, reply
        );
        self.active = Some(config);
        Ok(())
    }

    /// 停止广播
    pub async fn stop(&mut self) -> anyhow::Result<()> {
        let Some(config) = self.active.take() else {
            return Ok(());
        };

        let client = self.client.lock().await;
        let cmd = RemoveAdvertising::new(AdvertiseInstance::new(config.instance));
        match client.call(Some(config.controller_index), cmd).await {
            Ok(_) => info!("Advertising instance {} removed", config.instance),
            Err(e) => error!("Failed to remove advertising: {}", e),
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for MgmtLegacyAdvertiser {
    fn drop(&mut self) {
        if self.active.is_some() {
            // 无法 async，广播实例会在 MGMT socket 关闭时由内核清理
            debug!("MgmtLegacyAdvertiser dropped, advertising will be cleaned up");
        }
    }
}
