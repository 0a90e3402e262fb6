//! GATT Server - 服务端的 BLE 广播和服务
//!
//! 基于 bluer (BlueZ D-Bus) 的 GATT 应用，只有一个服务和一个特征：
//!
//! - Read: 返回当前值
//! - Write / Write Without Response: 写入新值
//! - Notify: 值变化时推送给已订阅的对端
//!
//! 回调本身不持有状态，每个请求都通过 [`EventSink`] 转交协调器，
//! 再经 oneshot 通道取回结果。

use bluer::{
    Adapter, Address, DeviceEvent, DeviceProperty,
    adv::{Advertisement, Feature, Type},
    gatt::local::{
        Application, Characteristic, CharacteristicNotifier, CharacteristicNotify,
        CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
        CharacteristicWriteMethod, ReqError, Service,
    },
    gatt::WriteOp,
};
use futures_util::{FutureExt, StreamExt};
use log::{debug, info, trace};
use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

use crate::ble::{
    AdvertisementPacket, EventSink, GattEvent, GattServiceSpec, GattStatus, PeerAddress,
};

/// 已订阅通知的对端
pub type Notifiers = Arc<Mutex<Vec<CharacteristicNotifier>>>;

fn to_req_error(status: GattStatus) -> ReqError {
    match status {
        GattStatus::Failed => ReqError::Failed,
        GattStatus::NotPermitted => ReqError::NotPermitted,
    }
}

/// 构造 D-Bus 广播
///
/// 服务 UUID 和厂商数据放在同一个广播中，BlueZ 决定如何分配到广播包和扫描响应。
pub fn build_advertisement(packet: &AdvertisementPacket) -> Advertisement {
    let mut system_includes = BTreeSet::new();
    if packet.include_tx_power {
        system_includes.insert(Feature::TxPower);
    }

    Advertisement {
        advertisement_type: if packet.connectable {
            Type::Peripheral
        } else {
            Type::Broadcast
        },
        service_uuids: BTreeSet::from([packet.service_uuid]),
        manufacturer_data: packet.manufacturer_data(),
        local_name: packet.local_name.clone(),
        discoverable: Some(true),
        system_includes,
        ..Default::default()
    }
}

/// 监视对端的连接状态，断开时投递 [`GattEvent::Disconnected`]
#[derive(Clone)]
pub struct PeerWatch {
    adapter: Adapter,
    sink: EventSink,
    watched: Arc<std::sync::Mutex<BTreeSet<Address>>>,
    cancel: CancellationToken,
}

impl PeerWatch {
    pub fn new(adapter: Adapter, sink: EventSink, cancel: CancellationToken) -> Self {
        Self {
            adapter,
            sink,
            watched: Arc::new(std::sync::Mutex::new(BTreeSet::new())),
            cancel,
        }
    }

    /// 第一次见到某个对端时开始监视
    pub fn observe(&self, address: Address) {
        let newly_seen = self
            .watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address);
        if !newly_seen {
            return;
        }

        self.sink.emit(GattEvent::Connected(PeerAddress::from(address)));
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.watch(address).await {
                debug!("Stopped watching {}: {}", address, e);
            }
            this.watched
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&address);
        });
    }

    async fn watch(&self, address: Address) -> bluer::Result<()> {
        let device = self.adapter.device(address)?;
        let mut events = device.events().await?;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                event = events.next() => match event {
                    Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) | None => {
                        debug!("Device {} disconnected", address);
                        self.sink.emit(GattEvent::Disconnected(PeerAddress::from(address)));
                        return Ok(());
                    }
                    Some(other) => trace!("Device {} event: {:?}", address, other),
                },
            }
        }
    }
}

/// 构造 GATT 应用
pub fn build_application(
    service: GattServiceSpec,
    sink: EventSink,
    notifiers: Notifiers,
    peers: PeerWatch,
) -> Application {
    let read_sink = sink.clone();
    let read_peers = peers.clone();
    let read = CharacteristicRead {
        read: true,
        fun: Box::new(move |req| {
            let sink = read_sink.clone();
            let peers = read_peers.clone();
            async move {
                peers.observe(req.device_address);
                let (reply, rx) = oneshot::channel();
                let event = GattEvent::Read {
                    peer: PeerAddress::from(req.device_address),
                    offset: usize::from(req.offset),
                    mtu: Some(req.mtu),
                    reply,
                };
                if !sink.emit(event) {
                    return Err(ReqError::Failed);
                }
                rx.await
                    .map_err(|_| ReqError::Failed)?
                    .map_err(to_req_error)
            }
            .boxed()
        }),
        ..Default::default()
    };

    let write = CharacteristicWrite {
        write: true,
        write_without_response: true,
        method: CharacteristicWriteMethod::Fun(Box::new(move |data, req| {
            let sink = sink.clone();
            let peers = peers.clone();
            async move {
                peers.observe(req.device_address);
                let (reply, rx) = oneshot::channel();
                let event = GattEvent::Write {
                    peer: PeerAddress::from(req.device_address),
                    data,
                    with_response: !matches!(req.op_type, WriteOp::Command),
                    reply,
                };
                if !sink.emit(event) {
                    return Err(ReqError::Failed);
                }
                rx.await
                    .map_err(|_| ReqError::Failed)?
                    .map_err(to_req_error)
            }
            .boxed()
        })),
        ..Default::default()
    };

    let notify = CharacteristicNotify {
        notify: true,
        method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
            let notifiers = notifiers.clone();
            async move {
                debug!("Peer subscribed to notifications");
                notifiers.lock().await.push(notifier);
            }
            .boxed()
        })),
        ..Default::default()
    };

    Application {
        services: vec![Service {
            uuid: service.service_uuid,
            primary: true,
            characteristics: vec![Characteristic {
                uuid: service.characteristic_uuid,
                read: Some(read),
                write: Some(write),
                notify: Some(notify),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// 推送新值，顺便清理已取消订阅的对端
pub async fn push_notification(notifiers: &Notifiers, value: &[u8]) {
    let mut notifiers = notifiers.lock().await;
    notifiers.retain(|notifier| !notifier.is_stopped());
    for notifier in notifiers.iter_mut() {
        if let Err(e) = notifier.notify(value.to_vec()).await {
            debug!("Notification failed: {}", e);
        }
    }
    if !notifiers.is_empty() {
        info!("Notified {} subscriber(s)", notifiers.len());
    }
}

/// GATT 服务句柄，drop 时注销应用并停止监视对端
pub struct GattServerHandle {
    _app_handle: bluer::gatt::local::ApplicationHandle,
    notifiers: Notifiers,
    cancel: CancellationToken,
}

impl GattServerHandle {
    /// 注册 GATT 应用
    pub async fn serve(
        adapter: &Adapter,
        service: GattServiceSpec,
        sink: EventSink,
    ) -> bluer::Result<Self> {
        let notifiers: Notifiers = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let peers = PeerWatch::new(adapter.clone(), sink.clone(), cancel.clone());
        let app = build_application(service, sink, notifiers.clone(), peers);

        debug!(
            "Registering GATT application with service_uuid={}",
            service.service_uuid
        );
        let app_handle = adapter.serve_gatt_application(app).await?;
        debug!("GATT application registered successfully");

        Ok(Self {
            _app_handle: app_handle,
            notifiers,
            cancel,
        })
    }

    pub async fn notify(&self, value: &[u8]) {
        push_notification(&self.notifiers, value).await;
    }
}

impl Drop for GattServerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
