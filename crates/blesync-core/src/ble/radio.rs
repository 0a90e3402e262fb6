//! 无线电抽象
//!
//! [`Radio`] 的所有方法都只是提交请求，立即返回；结果以事件形式通过
//! [`EventSink`] 投递到协调器的事件队列。同一角色的事件保持后端发出的顺序。

use log::debug;
use tokio::sync::{mpsc, oneshot};

use crate::ble::{
    AdvertisementPacket, AdvertisementRecord, GattServiceSpec, PeerAddress, ScanFilter,
};
use crate::error::FailureCause;
use crate::sync::SyncEvent;

/// GATT 请求的错误响应
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Failed,
    NotPermitted,
}

pub type GattReply<T> = oneshot::Sender<Result<T, GattStatus>>;

/// 广播事件
#[derive(Debug)]
pub enum AdvertiseEvent {
    Started,
    StartFailed(FailureCause),
    /// 停止确认；即使此前没有活动广播也会发出
    Stopped,
    /// 重启等待结束（内部定时器）
    SettleElapsed(u64),
}

/// 扫描事件
///
/// 每次 `start_scan` 恰好以一个 `StartFailed` 或 `Stopped` 结束。扫描会话可能自行结束
/// （适配器消失、发现流中断），此时不经 `stop_scan` 直接发出 `Stopped`。
#[derive(Debug)]
pub enum ScanEvent {
    Started,
    StartFailed(FailureCause),
    Record(AdvertisementRecord),
    Stopped,
}

/// GATT 服务事件
#[derive(Debug)]
pub enum GattEvent {
    Opened,
    OpenFailed(FailureCause),
    Closed,
    Connected(PeerAddress),
    Disconnected(PeerAddress),
    Read {
        peer: PeerAddress,
        offset: usize,
        mtu: Option<u16>,
        reply: GattReply<Vec<u8>>,
    },
    Write {
        peer: PeerAddress,
        data: Vec<u8>,
        with_response: bool,
        reply: GattReply<()>,
    },
}

/// 无线电后端
pub trait Radio: Send + Sync {
    fn start_advertising(&self, packet: AdvertisementPacket);
    fn stop_advertising(&self);
    fn start_scan(&self, filter: ScanFilter);
    fn stop_scan(&self);
    fn open_gatt_server(&self, service: GattServiceSpec);
    fn close_gatt_server(&self);
    /// 向已订阅的对端推送新值
    fn notify_value(&self, value: Vec<u8>);
}

/// 协调器事件队列的发送端
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

pub type EventInbox = mpsc::UnboundedReceiver<SyncEvent>;

pub fn event_channel() -> (EventSink, EventInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}

impl EventSink {
    /// 投递事件，协调器已退出时返回 `false`
    pub fn emit(&self, event: impl Into<SyncEvent>) -> bool {
        let event = event.into();
        match self.tx.send(event) {
            Ok(()) => true,
            Err(e) => {
                debug!("Coordinator gone, dropping event: {:?}", e.0);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
