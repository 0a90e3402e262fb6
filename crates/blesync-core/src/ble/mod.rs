//! BLE 层
//!
//! - **radio**: 无线电抽象和事件定义
//! - **bluez**: 基于 BlueZ 的无线电后端 (bluer / btmgmt)
//! - **mock**: 内存无线电，用于测试
//! - **client**: 主动连接服务端的 GATT 客户端 (btleplug)

pub mod bluez;
pub mod client;
pub mod mgmt_advertiser;
pub mod mock;
pub mod radio;
pub mod scanner;
pub mod server;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub use bluez::BluerRadio;
pub use client::{BleClient, BleClientError, Connection, DiscoveredServer};
pub use mock::{MockAir, MockRadio};
pub use radio::{
    AdvertiseEvent, EventInbox, EventSink, GattEvent, GattStatus, Radio, ScanEvent, event_channel,
};

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_123456789abc);
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x87654321_4321_4321_4321_cba987654321);

/// 厂商数据字段使用的厂商 ID (0xFFFF = 测试/未分配)
pub const MANUFACTURER_ID: u16 = 0xFFFF;

/// 对端设备地址，统一为大写
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<bluer::Address> for PeerAddress {
    fn from(address: bluer::Address) -> Self {
        Self::new(address.to_string())
    }
}

/// 待发送的广播
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementPacket {
    pub service_uuid: Uuid,
    pub vendor_id: u16,
    pub payload: Vec<u8>,
    /// `Some` 时在广播中包含设备名称
    pub local_name: Option<String>,
    pub include_tx_power: bool,
    pub connectable: bool,
}

impl AdvertisementPacket {
    pub fn manufacturer_data(&self) -> BTreeMap<u16, Vec<u8>> {
        BTreeMap::from([(self.vendor_id, self.payload.clone())])
    }
}

/// 扫描到的一条广播
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementRecord {
    pub address: PeerAddress,
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub rssi: Option<i16>,
}

impl AdvertisementRecord {
    /// 按广播包构造记录（即对端扫描到的样子）
    pub fn from_packet(
        address: PeerAddress,
        packet: &AdvertisementPacket,
        rssi: Option<i16>,
    ) -> Self {
        Self {
            address,
            local_name: packet.local_name.clone(),
            service_uuids: vec![packet.service_uuid],
            manufacturer_data: packet.manufacturer_data(),
            rssi,
        }
    }

    pub fn advertises(&self, service_uuid: Uuid) -> bool {
        self.service_uuids.contains(&service_uuid)
    }

    pub fn vendor_payload(&self, vendor_id: u16) -> Option<&[u8]> {
        self.manufacturer_data.get(&vendor_id).map(Vec::as_slice)
    }
}

/// 扫描过滤条件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanFilter {
    pub service_uuid: Uuid,
    pub vendor_id: u16,
}

/// GATT 服务定义：一个服务，一个读/写/通知特征
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattServiceSpec {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
}

/// 信号强度分级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalQuality {
    Excellent,
    Good,
    Fair,
    Weak,
}

impl SignalQuality {
    pub fn from_rssi(rssi: i16) -> Self {
        match rssi {
            r if r >= -50 => SignalQuality::Excellent,
            r if r >= -60 => SignalQuality::Good,
            r if r >= -70 => SignalQuality::Fair,
            _ => SignalQuality::Weak,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SignalQuality::Excellent => "excellent",
            SignalQuality::Good => "good",
            SignalQuality::Fair => "fair",
            SignalQuality::Weak => "weak",
        }
    }
}
