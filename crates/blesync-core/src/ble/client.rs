//! BLE Client - 主动连接服务端
//!
//! 与扫描引擎的被动接收不同，这里用 btleplug 直接连接服务端的 GATT 服务：
//!
//! 1. 扫描广播服务 UUID 的设备
//! 2. 连接并发现特征
//! 3. 读取完整值（不受广播载荷限制）、写入新值或订阅通知

use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral, ScanFilter as CentralScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures_util::{Stream, StreamExt, future};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio::time;
use uuid::Uuid;

use crate::ble::{PeerAddress, SignalQuality};
use crate::codec::{self, PayloadCodec};
use crate::config::SyncSettings;

/// BLE 客户端错误
#[derive(Debug, thiserror::Error)]
pub enum BleClientError {
    #[error("No Bluetooth adapters found")]
    NoAdapter,

    #[error("Device not found")]
    DeviceNotFound,

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] btleplug::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// 扫描到的服务端
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredServer {
    pub address: PeerAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    /// 广播中的值，无法解码时为 `None`
    pub value: Option<String>,
}

impl DiscoveredServer {
    fn from_advertisement(
        address: &str,
        name: Option<String>,
        rssi: Option<i16>,
        manufacturer_data: &HashMap<u16, Vec<u8>>,
        vendor_id: u16,
        codec: &PayloadCodec,
    ) -> Self {
        let value = manufacturer_data
            .get(&vendor_id)
            .and_then(|payload| codec.decode(payload).ok());
        Self {
            address: PeerAddress::new(address),
            name,
            rssi,
            value,
        }
    }

    pub fn signal(&self) -> Option<SignalQuality> {
        self.rssi.map(SignalQuality::from_rssi)
    }
}

/// 通知流
pub type ValueStream = Pin<Box<dyn Stream<Item = String> + Send>>;

pub struct BleClient {
    adapter: Adapter,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    vendor_id: u16,
    codec: PayloadCodec,
}

impl BleClient {
    pub async fn new(settings: &SyncSettings) -> Result<Self, BleClientError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(BleClientError::NoAdapter)?;

        Ok(Self {
            adapter,
            service_uuid: settings.service_uuid,
            characteristic_uuid: settings.characteristic_uuid,
            vendor_id: settings.vendor_id,
            codec: PayloadCodec::from_settings(settings),
        })
    }

    /// 扫描 `timeout` 后返回所有广播服务 UUID 的设备
    pub async fn discover(
        &self,
        timeout: Duration,
    ) -> Result<Vec<DiscoveredServer>, BleClientError> {
        info!("Scanning for {} seconds", timeout.as_secs());
        self.adapter
            .start_scan(CentralScanFilter {
                services: vec![self.service_uuid],
            })
            .await?;
        time::sleep(timeout).await;
        self.adapter.stop_scan().await?;

        let mut servers = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            if !props.services.contains(&self.service_uuid) {
                continue;
            }
            let server = DiscoveredServer::from_advertisement(
                &props.address.to_string(),
                props.local_name,
                props.rssi,
                &props.manufacturer_data,
                self.vendor_id,
                &self.codec,
            );
            debug!("Found server {} ({:?})", server.address, server.value);
            servers.push(server);
        }
        info!("Scan complete: found {} server(s)", servers.len());
        Ok(servers)
    }

    /// 连接服务端；未指定地址时连接第一个发现的服务端
    pub async fn connect(
        &self,
        address: Option<&str>,
        timeout: Duration,
    ) -> Result<Connection, BleClientError> {
        let address = match address {
            Some(address) => PeerAddress::new(address),
            None => self
                .discover(timeout)
                .await?
                .into_iter()
                .next()
                .map(|server| server.address)
                .ok_or(BleClientError::DeviceNotFound)?,
        };

        let peripheral = self.find_device(&address).await?;
        if !peripheral.is_connected().await? {
            info!("Connecting to {}", address);
            peripheral
                .connect()
                .await
                .map_err(|e| BleClientError::ConnectionFailed(e.to_string()))?;
        }

        debug!("Discovering services...");
        peripheral.discover_services().await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == self.service_uuid && c.uuid == self.characteristic_uuid)
            .ok_or(BleClientError::CharacteristicNotFound(self.characteristic_uuid))?;

        Ok(Connection {
            address,
            peripheral,
            characteristic,
            codec: self.codec.clone(),
        })
    }

    async fn find_device(
        &self,
        address: &PeerAddress,
    ) -> Result<PlatformPeripheral, BleClientError> {
        for peripheral in self.adapter.peripherals().await? {
            if let Some(props) = peripheral.properties().await? {
                if PeerAddress::new(props.address.to_string()) == *address {
                    return Ok(peripheral);
                }
            }
        }
        Err(BleClientError::DeviceNotFound)
    }
}

/// 与服务端的连接
pub struct Connection {
    address: PeerAddress,
    peripheral: PlatformPeripheral,
    characteristic: Characteristic,
    codec: PayloadCodec,
}

impl Connection {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// 读取完整的当前值
    pub async fn read_state(&self) -> Result<String, BleClientError> {
        let data = self.peripheral.read(&self.characteristic).await?;
        debug!("Read {} bytes from {}", data.len(), self.address);
        codec::try_decode(&data).map_err(|e| BleClientError::InvalidData(e.to_string()))
    }

    /// 写入新值，返回实际写入（截断后）的值
    pub async fn write_state(
        &self,
        value: &str,
        with_response: bool,
    ) -> Result<String, BleClientError> {
        let value = self.codec.clamp(value);
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        info!("Writing '{}' to {} ({:?})", value, self.address, write_type);
        self.peripheral
            .write(&self.characteristic, value.as_bytes(), write_type)
            .await?;
        Ok(value)
    }

    /// 订阅值变化
    pub async fn follow(&self) -> Result<ValueStream, BleClientError> {
        self.peripheral.subscribe(&self.characteristic).await?;
        let uuid = self.characteristic.uuid;
        let notifications = self.peripheral.notifications().await?;
        info!("Following {}", self.address);
        Ok(Box::pin(notifications.filter_map(move |n| {
            let value = if n.uuid == uuid {
                codec::try_decode(&n.value).ok()
            } else {
                None
            };
            future::ready(value)
        })))
    }

    pub async fn disconnect(self) -> Result<(), BleClientError> {
        self.peripheral.disconnect().await?;
        debug!("Disconnected from {}", self.address);
        Ok(())
    }
}
