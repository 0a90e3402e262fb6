//! 内存无线电
//!
//! 不依赖硬件的 [`Radio`] 实现，用于测试和演示：
//!
//! - 记录所有请求（[`RadioCall`]）
//! - 自动确认模式下立即回送 Started/Stopped/Opened/Closed 事件
//! - 可以预置下一次启动的失败原因
//! - 多个 `MockRadio` 可以共享一个 [`MockAir`]，一方的广播会成为另一方的扫描结果

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

use crate::ble::{
    AdvertiseEvent, AdvertisementPacket, AdvertisementRecord, EventSink, GattEvent,
    GattServiceSpec, GattStatus, PeerAddress, Radio, ScanEvent, ScanFilter,
};
use crate::error::FailureCause;
use crate::sync::SyncEvent;

/// 模拟的信号强度
const MOCK_RSSI: i16 = -48;

/// 对无线电的一次请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartAdvertising(AdvertisementPacket),
    StopAdvertising,
    StartScan(ScanFilter),
    StopScan,
    OpenGattServer(GattServiceSpec),
    CloseGattServer,
    NotifyValue(Vec<u8>),
}

#[derive(Default)]
struct MockState {
    calls: Vec<RadioCall>,
    advertise_failures: VecDeque<FailureCause>,
    scan_failures: VecDeque<FailureCause>,
    gatt_failures: VecDeque<FailureCause>,
}

pub struct MockRadio {
    sink: EventSink,
    address: PeerAddress,
    auto_ack: bool,
    air: Option<MockAir>,
    state: Mutex<MockState>,
}

impl MockRadio {
    /// 自动确认所有请求
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            address: PeerAddress::new("02:00:00:00:00:01"),
            auto_ack: true,
            air: None,
            state: Mutex::new(MockState::default()),
        }
    }

    /// 只记录请求，事件由测试通过 [`MockRadio::emit`] 注入
    pub fn manual(sink: EventSink) -> Self {
        Self {
            auto_ack: false,
            ..Self::new(sink)
        }
    }

    /// 接入共享的空中信道
    pub fn on_air(sink: EventSink, air: &MockAir, address: &str) -> Self {
        let address = PeerAddress::new(address);
        air.join(address.clone(), sink.clone());
        Self {
            address,
            air: Some(air.clone()),
            ..Self::new(sink)
        }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.state().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<RadioCall> {
        std::mem::take(&mut self.state().calls)
    }

    pub fn fail_next_advertise(&self, cause: FailureCause) {
        self.state().advertise_failures.push_back(cause);
    }

    pub fn fail_next_scan(&self, cause: FailureCause) {
        self.state().scan_failures.push_back(cause);
    }

    pub fn fail_next_gatt(&self, cause: FailureCause) {
        self.state().gatt_failures.push_back(cause);
    }

    /// 注入一个事件
    pub fn emit(&self, event: impl Into<SyncEvent>) {
        self.sink.emit(event);
    }

    /// 注入一条扫描结果
    pub fn deliver(&self, record: AdvertisementRecord) {
        self.emit(ScanEvent::Record(record));
    }

    /// 模拟对端读取特征
    pub async fn read(&self, peer: &str, offset: usize) -> Result<Vec<u8>, GattStatus> {
        let (reply, rx) = oneshot::channel();
        self.emit(GattEvent::Read {
            peer: PeerAddress::new(peer),
            offset,
            mtu: None,
            reply,
        });
        rx.await.unwrap_or(Err(GattStatus::Failed))
    }

    /// 模拟对端写入特征
    pub async fn write(&self, peer: &str, data: &[u8]) -> Result<(), GattStatus> {
        let (reply, rx) = oneshot::channel();
        self.emit(GattEvent::Write {
            peer: PeerAddress::new(peer),
            data: data.to_vec(),
            with_response: true,
            reply,
        });
        rx.await.unwrap_or(Err(GattStatus::Failed))
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: RadioCall) {
        self.state().calls.push(call);
    }
}

impl Radio for MockRadio {
    fn start_advertising(&self, packet: AdvertisementPacket) {
        self.record(RadioCall::StartAdvertising(packet.clone()));
        if !self.auto_ack {
            return;
        }
        let failure = self.state().advertise_failures.pop_front();
        match failure {
            Some(cause) => self.emit(AdvertiseEvent::StartFailed(cause)),
            None => {
                self.emit(AdvertiseEvent::Started);
                if let Some(air) = &self.air {
                    air.advertise(&self.address, packet);
                }
            }
        }
    }

    fn stop_advertising(&self) {
        self.record(RadioCall::StopAdvertising);
        if !self.auto_ack {
            return;
        }
        if let Some(air) = &self.air {
            air.withdraw(&self.address);
        }
        self.emit(AdvertiseEvent::Stopped);
    }

    fn start_scan(&self, filter: ScanFilter) {
        self.record(RadioCall::StartScan(filter));
        if !self.auto_ack {
            return;
        }
        let failure = self.state().scan_failures.pop_front();
        match failure {
            Some(cause) => self.emit(ScanEvent::StartFailed(cause)),
            None => {
                self.emit(ScanEvent::Started);
                if let Some(air) = &self.air {
                    air.listen(&self.address, filter);
                }
            }
        }
    }

    fn stop_scan(&self) {
        self.record(RadioCall::StopScan);
        if !self.auto_ack {
            return;
        }
        if let Some(air) = &self.air {
            air.deafen(&self.address);
        }
        self.emit(ScanEvent::Stopped);
    }

    fn open_gatt_server(&self, service: GattServiceSpec) {
        self.record(RadioCall::OpenGattServer(service));
        if !self.auto_ack {
            return;
        }
        let failure = self.state().gatt_failures.pop_front();
        match failure {
            Some(cause) => self.emit(GattEvent::OpenFailed(cause)),
            None => self.emit(GattEvent::Opened),
        }
    }

    fn close_gatt_server(&self) {
        self.record(RadioCall::CloseGattServer);
        if self.auto_ack {
            self.emit(GattEvent::Closed);
        }
    }

    fn notify_value(&self, value: Vec<u8>) {
        self.record(RadioCall::NotifyValue(value));
    }
}

struct Station {
    sink: EventSink,
    advertising: Option<AdvertisementPacket>,
    scanning: Option<ScanFilter>,
}

/// 共享的空中信道
#[derive(Clone, Default)]
pub struct MockAir {
    stations: Arc<Mutex<BTreeMap<PeerAddress, Station>>>,
}

impl MockAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// 重新发送当前所有广播，模拟周期性的重复广播包
    pub fn rebroadcast(&self) {
        let stations = self.stations();
        for (address, station) in stations.iter() {
            if let Some(packet) = &station.advertising {
                Self::deliver(&stations, address, packet);
            }
        }
    }

    fn stations(&self) -> MutexGuard<'_, BTreeMap<PeerAddress, Station>> {
        self.stations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join(&self, address: PeerAddress, sink: EventSink) {
        self.stations().insert(
            address,
            Station {
                sink,
                advertising: None,
                scanning: None,
            },
        );
    }

    fn advertise(&self, from: &PeerAddress, packet: AdvertisementPacket) {
        let mut stations = self.stations();
        Self::deliver(&stations, from, &packet);
        if let Some(station) = stations.get_mut(from) {
            station.advertising = Some(packet);
        }
    }

    fn withdraw(&self, from: &PeerAddress) {
        if let Some(station) = self.stations().get_mut(from) {
            station.advertising = None;
        }
    }

    fn listen(&self, address: &PeerAddress, filter: ScanFilter) {
        let mut stations = self.stations();
        let Some(station) = stations.get_mut(address) else {
            return;
        };
        station.scanning = Some(filter);

        // 扫描开始时立即收到正在进行的广播
        let sink = station.sink.clone();
        for (from, other) in stations.iter() {
            if from == address {
                continue;
            }
            let packet = other
                .advertising
                .as_ref()
                .filter(|p| p.service_uuid == filter.service_uuid);
            if let Some(packet) = packet {
                sink.emit(ScanEvent::Record(AdvertisementRecord::from_packet(
                    from.clone(),
                    packet,
                    Some(MOCK_RSSI),
                )));
            }
        }
    }

    fn deafen(&self, address: &PeerAddress) {
        if let Some(station) = self.stations().get_mut(address) {
            station.scanning = None;
        }
    }

    fn deliver(
        stations: &BTreeMap<PeerAddress, Station>,
        from: &PeerAddress,
        packet: &AdvertisementPacket,
    ) {
        for (address, station) in stations {
            if address == from {
                continue;
            }
            let Some(filter) = station.scanning else {
                continue;
            };
            if filter.service_uuid == packet.service_uuid {
                station.sink.emit(ScanEvent::Record(AdvertisementRecord::from_packet(
                    from.clone(),
                    packet,
                    Some(MOCK_RSSI),
                )));
            }
        }
    }
}
