//! BlueZ 无线电后端
//!
//! [`BluerRadio`] 把 [`Radio`] 请求放进队列，由单个后台任务按顺序执行。
//! 会话和适配器在第一次使用时创建。广播可以走 D-Bus (bluer)，
//! 也可以走 MGMT socket (btmgmt) 以固定 Legacy 包布局。

use bluer::adv::AdvertisementHandle;
use bluer::{Adapter, ErrorKind, Session};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ble::mgmt_advertiser::{self, LegacyAdvConfig, MgmtLegacyAdvertiser};
use crate::ble::server::{GattServerHandle, build_advertisement};
use crate::ble::{
    AdvertiseEvent, AdvertisementPacket, EventSink, GattEvent, GattServiceSpec, Radio, ScanEvent,
    ScanFilter, scanner,
};
use crate::config::{AdvertiserBackend, SyncSettings};
use crate::error::FailureCause;

/// MGMT 广播实例
const ADV_INSTANCE: u8 = 1;

/// 将 bluer 错误归类
pub fn classify(error: &bluer::Error) -> FailureCause {
    classify_kind(&error.kind, &error.message)
}

fn classify_kind(kind: &ErrorKind, message: &str) -> FailureCause {
    // BlueZ 以 NotPermitted 报告广播实例耗尽
    if message.contains("Maximum advertisements") {
        return FailureCause::TooManyAdvertisers;
    }
    match kind {
        ErrorKind::NotPermitted | ErrorKind::NotAuthorized => FailureCause::PermissionDenied,
        ErrorKind::NotSupported => FailureCause::Unsupported,
        ErrorKind::InvalidLength => FailureCause::PayloadTooLarge,
        ErrorKind::AlreadyExists | ErrorKind::InProgress => FailureCause::AlreadyActive,
        _ => FailureCause::Internal,
    }
}

#[derive(Debug)]
enum RadioCommand {
    StartAdvertising(AdvertisementPacket),
    StopAdvertising,
    StartScan(ScanFilter),
    StopScan,
    OpenGatt(GattServiceSpec),
    CloseGatt,
    Notify(Vec<u8>),
}

/// 基于 BlueZ 的 [`Radio`]
pub struct BluerRadio {
    tx: mpsc::UnboundedSender<RadioCommand>,
}

impl BluerRadio {
    /// 启动后台任务，必须在 tokio 运行时中调用
    pub fn spawn(settings: &SyncSettings, sink: EventSink) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            backend: settings.backend,
            controller_index: settings.controller_index,
            sink,
            session: None,
            adapter: None,
            advertisement: None,
            mgmt: None,
            scan: None,
            gatt: None,
        };
        tokio::spawn(worker.run(rx));
        Self { tx }
    }

    fn send(&self, command: RadioCommand) {
        if let Err(e) = self.tx.send(command) {
            debug!("Radio worker gone, dropping {:?}", e.0);
        }
    }
}

impl Radio for BluerRadio {
    fn start_advertising(&self, packet: AdvertisementPacket) {
        self.send(RadioCommand::StartAdvertising(packet));
    }

    fn stop_advertising(&self) {
        self.send(RadioCommand::StopAdvertising);
    }

    fn start_scan(&self, filter: ScanFilter) {
        self.send(RadioCommand::StartScan(filter));
    }

    fn stop_scan(&self) {
        self.send(RadioCommand::StopScan);
    }

    fn open_gatt_server(&self, service: GattServiceSpec) {
        self.send(RadioCommand::OpenGatt(service));
    }

    fn close_gatt_server(&self) {
        self.send(RadioCommand::CloseGatt);
    }

    fn notify_value(&self, value: Vec<u8>) {
        self.send(RadioCommand::Notify(value));
    }
}

struct ScanTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Worker {
    backend: AdvertiserBackend,
    controller_index: u16,
    sink: EventSink,
    session: Option<Session>,
    adapter: Option<Adapter>,
    advertisement: Option<AdvertisementHandle>,
    mgmt: Option<MgmtLegacyAdvertiser>,
    scan: Option<ScanTask>,
    gatt: Option<GattServerHandle>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RadioCommand>) {
        debug!("BlueZ radio worker started ({:?} advertiser)", self.backend);
        while let Some(command) = rx.recv().await {
            match command {
                RadioCommand::StartAdvertising(packet) => self.start_advertising(packet).await,
                RadioCommand::StopAdvertising => self.stop_advertising().await,
                RadioCommand::StartScan(filter) => self.start_scan(filter).await,
                RadioCommand::StopScan => self.stop_scan().await,
                RadioCommand::OpenGatt(service) => self.open_gatt(service).await,
                RadioCommand::CloseGatt => {
                    if self.gatt.take().is_some() {
                        info!("GATT application unregistered");
                    }
                    self.sink.emit(GattEvent::Closed);
                }
                RadioCommand::Notify(value) => {
                    if let Some(gatt) = &self.gatt {
                        gatt.notify(&value).await;
                    }
                }
            }
        }

        self.stop_scan().await;
        self.stop_advertising().await;
        debug!("BlueZ radio worker stopped");
    }

    async fn adapter(&mut self) -> bluer::Result<Adapter> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }

        debug!("Initializing BLE session...");
        let session = Session::new().await?;
        let name = format!("hci{}", self.controller_index);
        let adapter = session.adapter(&name)?;
        debug!("Powering on adapter: {}", name);
        adapter.set_powered(true).await?;

        self.session = Some(session);
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    async fn start_advertising(&mut self, packet: AdvertisementPacket) {
        let result = match self.backend {
            AdvertiserBackend::Dbus => self.advertise_dbus(&packet).await,
            AdvertiserBackend::Mgmt => self.advertise_mgmt(&packet).await,
        };
        match result {
            Ok(()) => {
                info!(
                    "Advertising {} bytes for vendor 0x{:04X}",
                    packet.payload.len(),
                    packet.vendor_id
                );
                self.sink.emit(AdvertiseEvent::Started);
            }
            Err(cause) => {
                self.sink.emit(AdvertiseEvent::StartFailed(cause));
            }
        }
    }

    async fn advertise_dbus(&mut self, packet: &AdvertisementPacket) -> Result<(), FailureCause> {
        self.advertisement = None;
        let adapter = self.adapter().await.map_err(|e| {
            warn!("Bluetooth adapter unavailable: {}", e);
            classify(&e)
        })?;
        let handle = adapter
            .advertise(build_advertisement(packet))
            .await
            .map_err(|e| {
                warn!("Failed to register advertisement: {}", e);
                classify(&e)
            })?;
        self.advertisement = Some(handle);
        Ok(())
    }

    async fn advertise_mgmt(&mut self, packet: &AdvertisementPacket) -> Result<(), FailureCause> {
        let config = LegacyAdvConfig::from_packet(packet, self.controller_index, ADV_INSTANCE)
            .map_err(|e| {
                warn!("{}", e);
                e.cause()
            })?;

        let mut advertiser = match self.mgmt.take() {
            Some(advertiser) => advertiser,
            None => MgmtLegacyAdvertiser::new(self.controller_index)
                .await
                .map_err(|e| {
                    warn!("Failed to open MGMT socket: {}", e);
                    mgmt_advertiser::classify_error(&e)
                })?,
        };
        let result = advertiser.start(config).await;
        self.mgmt = Some(advertiser);
        result.map_err(|e| {
            warn!("MGMT advertising failed: {:#}", e);
            mgmt_advertiser::classify_error(&e)
        })
    }

    async fn stop_advertising(&mut self) {
        if self.advertisement.take().is_some() {
            info!("Advertisement unregistered");
        }
        if let Some(mgmt) = self.mgmt.as_mut() {
            if let Err(e) = mgmt.stop().await {
                warn!("Failed to stop MGMT advertising: {}", e);
            }
        }
        self.sink.emit(AdvertiseEvent::Stopped);
    }

    async fn start_scan(&mut self, filter: ScanFilter) {
        if self.scan.is_some() {
            self.stop_scan().await;
        }
        let adapter = match self.adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("Bluetooth adapter unavailable: {}", e);
                self.sink.emit(ScanEvent::StartFailed(classify(&e)));
                return;
            }
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(scanner::run_scan(
            adapter,
            filter,
            self.sink.clone(),
            cancel.clone(),
        ));
        self.scan = Some(ScanTask { cancel, task });
    }

    /// 扫描任务自己发出结束事件；只有任务异常退出时由这里补发 `Stopped`
    async fn stop_scan(&mut self) {
        let Some(scan) = self.scan.take() else {
            // 启动失败时已经发出 StartFailed
            debug!("No scan task to stop");
            return;
        };
        scan.cancel.cancel();
        if let Err(e) = scan.task.await {
            warn!("Scan task failed: {}", e);
            self.sink.emit(ScanEvent::Stopped);
        }
    }

    async fn open_gatt(&mut self, service: GattServiceSpec) {
        self.gatt = None;
        let adapter = match self.adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("Bluetooth adapter unavailable: {}", e);
                self.sink.emit(GattEvent::OpenFailed(classify(&e)));
                return;
            }
        };

        match GattServerHandle::serve(&adapter, service, self.sink.clone()).await {
            Ok(handle) => {
                info!("GATT server started on '{}'", adapter.name());
                self.gatt = Some(handle);
                self.sink.emit(GattEvent::Opened);
            }
            Err(e) => {
                warn!("Failed to register GATT application: {}", e);
                self.sink.emit(GattEvent::OpenFailed(classify(&e)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_bluez_errors() {
        assert_eq!(
            classify_kind(&ErrorKind::NotPermitted, "Maximum advertisements reached"),
            FailureCause::TooManyAdvertisers
        );
        assert_eq!(
            classify_kind(&ErrorKind::NotPermitted, "Operation not permitted"),
            FailureCause::PermissionDenied
        );
        assert_eq!(
            classify_kind(&ErrorKind::InvalidLength, ""),
            FailureCause::PayloadTooLarge
        );
        assert_eq!(
            classify_kind(&ErrorKind::NotSupported, ""),
            FailureCause::Unsupported
        );
        assert_eq!(classify_kind(&ErrorKind::Failed, ""), FailureCause::Internal);
    }
}
