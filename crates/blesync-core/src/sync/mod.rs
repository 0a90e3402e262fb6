//! 同步角色与事件循环
//!
//! 所有无线电事件和用户命令汇入同一个队列，由 [`RoleCoordinator`] 在单个
//! 任务中依次处理，状态只在这里被修改。调用方通过 [`SyncHandle`] 提交命令，
//! 通过 [`SyncNotice`] 通道获知结果。

pub mod advertising;
pub mod coordinator;
pub mod gatt;
pub mod scanning;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::ble::{
    AdvertiseEvent, EventSink, GattEvent, PeerAddress, Radio, ScanEvent, event_channel,
};
use crate::config::SyncSettings;
use crate::error::{FailureCause, SyncError};
use crate::logging::{LogEntry, LogLevel};
use crate::permissions::PermissionGate;

pub use advertising::{AdvertisePhase, AdvertisingEngine};
pub use coordinator::RoleCoordinator;
pub use gatt::{GattBridge, GattPhase, PeerState};
pub use scanning::{DedupCache, ScanPhase, ScanningEngine};

/// 当前角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Idle,
    Serving,
    Scanning,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Idle => "idle",
            Role::Serving => "serving",
            Role::Scanning => "scanning",
        })
    }
}

/// 失败所属的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Serve,
    Scan,
    Advertise,
    GattServer,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Serve => "Serve",
            Operation::Scan => "Scan",
            Operation::Advertise => "Advertising",
            Operation::GattServer => "GATT server",
        })
    }
}

/// 扫描到的新值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedValue {
    pub value: String,
    pub peer: PeerAddress,
    pub rssi: Option<i16>,
}

/// 协调器对外发出的通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    RoleChanged(Role),
    AdvertisingStarted { value: String },
    AdvertisingStopped,
    PayloadTruncated { original_len: usize, sent_len: usize },
    ScanStarted,
    ScanStopped,
    ValueReceived(ReceivedValue),
    GattOpened,
    GattClosed,
    PeerConnected(PeerAddress),
    PeerDisconnected(PeerAddress),
    StateWritten { peer: PeerAddress, value: String },
    Failed { operation: Operation, cause: FailureCause },
}

impl SyncNotice {
    /// 转换为事件日志条目
    pub fn to_log_entry(&self) -> LogEntry {
        match self {
            SyncNotice::RoleChanged(role) => {
                LogEntry::new(LogLevel::Info, format!("Role: {}", role))
            }
            SyncNotice::AdvertisingStarted { value } => {
                LogEntry::new(LogLevel::Info, format!("Advertising: {}", value))
            }
            SyncNotice::AdvertisingStopped => LogEntry::new(LogLevel::Info, "Advertising stopped"),
            SyncNotice::PayloadTruncated {
                original_len,
                sent_len,
            } => LogEntry::new(
                LogLevel::Warn,
                format!(
                    "Warning: value truncated from {} to {} bytes",
                    original_len, sent_len
                ),
            ),
            SyncNotice::ScanStarted => LogEntry::new(LogLevel::Info, "Listening for broadcasts"),
            SyncNotice::ScanStopped => LogEntry::new(LogLevel::Info, "Scan stopped"),
            SyncNotice::ValueReceived(received) => {
                let rssi = received
                    .rssi
                    .map(|r| format!(" (RSSI {} dBm)", r))
                    .unwrap_or_default();
                LogEntry::new(
                    LogLevel::Info,
                    format!("Received from {}: {}{}", received.peer, received.value, rssi),
                )
            }
            SyncNotice::GattOpened => LogEntry::new(LogLevel::Info, "GATT server ready"),
            SyncNotice::GattClosed => LogEntry::new(LogLevel::Info, "GATT server closed"),
            SyncNotice::PeerConnected(peer) => {
                LogEntry::new(LogLevel::Info, format!("Peer connected: {}", peer))
            }
            SyncNotice::PeerDisconnected(peer) => {
                LogEntry::new(LogLevel::Info, format!("Peer disconnected: {}", peer))
            }
            SyncNotice::StateWritten { peer, value } => {
                LogEntry::new(LogLevel::Info, format!("{} wrote: {}", peer, value))
            }
            SyncNotice::Failed { operation, cause } => {
                LogEntry::new(LogLevel::Error, format!("{} failed: {}", operation, cause))
            }
        }
    }
}

pub type NoticeSink = mpsc::UnboundedSender<SyncNotice>;
pub type NoticeReceiver = mpsc::UnboundedReceiver<SyncNotice>;

/// 状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub role: Role,
    pub advertising: bool,
    pub scanning: bool,
    pub gatt_open: bool,
    pub current_value: String,
    pub last_received: Option<ReceivedValue>,
    pub connected_peers: Vec<PeerAddress>,
    pub payload_limit: usize,
}

/// 用户命令
#[derive(Debug)]
pub enum Command {
    /// `None` 表示沿用当前值
    Serve(Option<String>),
    Update(String),
    Scan,
    Stop,
    Status(oneshot::Sender<SyncStatus>),
    Shutdown,
}

/// 事件队列中的条目
#[derive(Debug)]
pub enum SyncEvent {
    Command(Command),
    Advertise(AdvertiseEvent),
    Scan(ScanEvent),
    Gatt(GattEvent),
}

impl From<Command> for SyncEvent {
    fn from(command: Command) -> Self {
        SyncEvent::Command(command)
    }
}

impl From<AdvertiseEvent> for SyncEvent {
    fn from(event: AdvertiseEvent) -> Self {
        SyncEvent::Advertise(event)
    }
}

impl From<ScanEvent> for SyncEvent {
    fn from(event: ScanEvent) -> Self {
        SyncEvent::Scan(event)
    }
}

impl From<GattEvent> for SyncEvent {
    fn from(event: GattEvent) -> Self {
        SyncEvent::Gatt(event)
    }
}

/// 向协调器提交命令的句柄
///
/// 所有方法都不阻塞，结果通过通知通道返回。
#[derive(Debug, Clone)]
pub struct SyncHandle {
    sink: EventSink,
}

impl SyncHandle {
    pub fn new(sink: EventSink) -> Self {
        Self { sink }
    }

    /// 进入服务端角色并广播 `value`
    pub fn serve(&self, value: impl Into<String>) -> Result<(), SyncError> {
        self.send(Command::Serve(Some(value.into())))
    }

    /// 以当前值进入服务端角色
    pub fn serve_current(&self) -> Result<(), SyncError> {
        self.send(Command::Serve(None))
    }

    /// 更新广播的值
    pub fn update(&self, value: impl Into<String>) -> Result<(), SyncError> {
        self.send(Command::Update(value.into()))
    }

    /// 进入客户端角色
    pub fn scan(&self) -> Result<(), SyncError> {
        self.send(Command::Scan)
    }

    /// 停止当前角色
    pub fn stop(&self) -> Result<(), SyncError> {
        self.send(Command::Stop)
    }

    /// 停止所有活动并结束事件循环
    pub fn shutdown(&self) -> Result<(), SyncError> {
        self.send(Command::Shutdown)
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx))?;
        rx.await.map_err(|_| SyncError::ChannelClosed)
    }

    fn send(&self, command: Command) -> Result<(), SyncError> {
        if self.sink.emit(command) {
            Ok(())
        } else {
            Err(SyncError::ChannelClosed)
        }
    }
}

/// [`launch`] 的返回值
pub struct Launched<R> {
    pub handle: SyncHandle,
    pub notices: NoticeReceiver,
    pub radio: Arc<R>,
    pub task: JoinHandle<()>,
}

/// 创建事件队列、无线电后端和协调器，并在后台运行事件循环
pub fn launch<R, F>(
    settings: SyncSettings,
    permissions: Arc<dyn PermissionGate>,
    make_radio: F,
) -> Launched<R>
where
    R: Radio + 'static,
    F: FnOnce(EventSink) -> R,
{
    let (sink, inbox) = event_channel();
    let radio = Arc::new(make_radio(sink.clone()));
    let (coordinator, notices) =
        RoleCoordinator::new(settings, radio.clone(), permissions, sink.clone(), inbox);
    let task = tokio::spawn(coordinator.run());

    Launched {
        handle: SyncHandle::new(sink),
        notices,
        radio,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_log_entries() {
        let entry = SyncNotice::PayloadTruncated {
            original_len: 19,
            sent_len: 18,
        }
        .to_log_entry();
        assert_eq!(entry.level, LogLevel::Warn);
        assert_eq!(entry.message, "Warning: value truncated from 19 to 18 bytes");

        let entry = SyncNotice::Failed {
            operation: Operation::Advertise,
            cause: FailureCause::TooManyAdvertisers,
        }
        .to_log_entry();
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.message, "Advertising failed: too many advertisers");
    }

    #[test]
    fn test_status_serializes_role_in_lowercase() {
        let status = SyncStatus {
            role: Role::Serving,
            advertising: true,
            scanning: false,
            gatt_open: true,
            current_value: "PAGE:2".to_string(),
            last_received: None,
            connected_peers: vec![],
            payload_limit: 18,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"role\":\"serving\""));
    }
}
