//! BLE Scanner - 被动扫描服务端广播
//!
//! 使用 bluer (BlueZ D-Bus) 发现设备。BlueZ 按服务 UUID 过滤，
//! 设备属性（厂商数据、RSSI）变化时会再次上报，每次上报都转成一条
//! [`AdvertisementRecord`] 投递给协调器（没有 RSSI 的缓存设备除外）。
//! 值的解码和去重由扫描引擎负责。

use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport};
use futures_util::StreamExt;
use log::{debug, info, trace, warn};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

use crate::ble::bluez::classify;
use crate::ble::{AdvertisementRecord, EventSink, PeerAddress, ScanEvent, ScanFilter};

/// 读取设备当前的广播属性
pub async fn read_record(
    adapter: &Adapter,
    address: Address,
) -> bluer::Result<AdvertisementRecord> {
    let device = adapter.device(address)?;
    let local_name = device.name().await?;
    let service_uuids = device.uuids().await?.unwrap_or_default();
    let manufacturer_data = device.manufacturer_data().await?.unwrap_or_default();
    let rssi = device.rssi().await?;

    trace!(
        "Device {}: name={:?}, uuids={}, m_data={}, rssi={:?}",
        address,
        local_name,
        service_uuids.len(),
        manufacturer_data.len(),
        rssi
    );

    Ok(AdvertisementRecord {
        address: PeerAddress::from(address),
        local_name,
        service_uuids: service_uuids.into_iter().collect(),
        manufacturer_data: manufacturer_data.into_iter().collect(),
        rssi,
    })
}

fn discovery_filter(filter: ScanFilter) -> DiscoveryFilter {
    DiscoveryFilter {
        uuids: HashSet::from([filter.service_uuid]),
        transport: DiscoveryTransport::Le,
        duplicate_data: true,
        ..Default::default()
    }
}

/// 运行一次扫描会话，直到 `cancel` 被触发
///
/// 依次投递 `Started`（或 `StartFailed`）、若干 `Record`，最后是 `Stopped`。
pub async fn run_scan(
    adapter: Adapter,
    filter: ScanFilter,
    sink: EventSink,
    cancel: CancellationToken,
) {
    let discover = async {
        adapter.set_powered(true).await?;
        adapter.set_discovery_filter(discovery_filter(filter)).await?;
        adapter.discover_devices_with_changes().await
    };

    let mut events = match discover.await {
        Ok(events) => events,
        Err(e) => {
            warn!("Failed to start discovery on '{}': {}", adapter.name(), e);
            if cancel.is_cancelled() {
                sink.emit(ScanEvent::Stopped);
            } else {
                sink.emit(ScanEvent::StartFailed(classify(&e)));
            }
            return;
        }
    };

    info!(
        "Discovery started on '{}' for service {}",
        adapter.name(),
        filter.service_uuid
    );
    sink.emit(ScanEvent::Started);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(AdapterEvent::DeviceAdded(address)) => report(&adapter, address, &sink).await,
                Some(other) => trace!("Adapter event: {:?}", other),
                None => {
                    warn!("Discovery stream ended");
                    break;
                }
            },
        }
    }

    drop(events);
    info!("Discovery stopped");
    sink.emit(ScanEvent::Stopped);
}

/// 本次扫描中真正收到过广播的设备才有 RSSI
///
/// 发现流一开始会把 BlueZ 缓存的所有设备列出来，其中可能有早已离开的服务端。
fn heard_live(record: &AdvertisementRecord) -> bool {
    record.rssi.is_some()
}

async fn report(adapter: &Adapter, address: Address, sink: &EventSink) {
    match read_record(adapter, address).await {
        Ok(record) if heard_live(&record) => {
            sink.emit(ScanEvent::Record(record));
        }
        Ok(_) => trace!("Skipping cached device {}", address),
        Err(e) => debug!("Skipping {}: {}", address, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{MANUFACTURER_ID, SERVICE_UUID};

    #[test]
    fn test_discovery_filter_limits_to_service() {
        let filter = discovery_filter(ScanFilter {
            service_uuid: SERVICE_UUID,
            vendor_id: MANUFACTURER_ID,
        });
        assert_eq!(filter.uuids, HashSet::from([SERVICE_UUID]));
        assert!(matches!(filter.transport, DiscoveryTransport::Le));
        assert!(filter.duplicate_data);
    }

    #[test]
    fn test_cached_devices_without_rssi_are_skipped() {
        let mut record = AdvertisementRecord {
            address: PeerAddress::new("AA:BB:CC:DD:EE:FF"),
            local_name: None,
            service_uuids: vec![SERVICE_UUID],
            manufacturer_data: [(MANUFACTURER_ID, b"PAGE:1".to_vec())].into_iter().collect(),
            rssi: None,
        };
        assert!(!heard_live(&record));

        record.rssi = Some(-60);
        assert!(heard_live(&record));
    }
}
