//! 扫描引擎（客户端角色）
//!
//! 只接收带有服务 UUID 的广播，从配置的厂商 ID 字段取出载荷并解码。
//! 与上一次交付的值相同则丢弃，否则交付一次。单条记录解码失败不会
//! 影响扫描会话。

use log::{debug, error, info, trace, warn};
use std::sync::Arc;

use crate::ble::{AdvertisementRecord, Radio, ScanEvent, ScanFilter};
use crate::codec::{self, PayloadCodec};
use crate::config::SyncSettings;
use crate::error::{FailureCause, SyncError};
use crate::sync::{NoticeSink, Operation, ReceivedValue, Role, SyncNotice};

/// 扫描阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Idle,
    Starting,
    Active,
    StopPending,
}

/// 上一次交付的值
#[derive(Debug, Clone, Default)]
pub struct DedupCache {
    last: Option<String>,
}

impl DedupCache {
    /// 值与上次不同则记录并返回 `true`
    pub fn observe(&mut self, value: &str) -> bool {
        if self.last.as_deref() == Some(value) {
            return false;
        }
        self.last = Some(value.to_string());
        true
    }

    pub fn last(&self) -> Option<&str> {
        self.last.as_deref()
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

pub struct ScanningEngine {
    radio: Arc<dyn Radio>,
    notices: NoticeSink,
    codec: PayloadCodec,
    filter: ScanFilter,
    phase: ScanPhase,
    dedup: DedupCache,
    last_delivered: Option<ReceivedValue>,
    dropped: u64,
}

impl ScanningEngine {
    pub fn new(settings: &SyncSettings, radio: Arc<dyn Radio>, notices: NoticeSink) -> Self {
        Self {
            radio,
            notices,
            codec: PayloadCodec::from_settings(settings),
            filter: ScanFilter {
                service_uuid: settings.service_uuid,
                vendor_id: settings.vendor_id,
            },
            phase: ScanPhase::Idle,
            dedup: DedupCache::default(),
            last_delivered: None,
            dropped: 0,
        }
    }

    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == ScanPhase::Active
    }

    pub fn is_idle(&self) -> bool {
        self.phase == ScanPhase::Idle
    }

    pub fn filter(&self) -> ScanFilter {
        self.filter
    }

    pub fn last_delivered(&self) -> Option<&ReceivedValue> {
        self.last_delivered.as_ref()
    }

    /// 被丢弃的无效记录数
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// 使用配置的过滤条件开始扫描
    pub fn start(&mut self) -> Result<(), SyncError> {
        self.start_with(self.filter)
    }

    pub fn start_with(&mut self, filter: ScanFilter) -> Result<(), SyncError> {
        if !self.is_idle() {
            return Err(SyncError::AlreadyActive(Role::Scanning));
        }
        info!(
            "Starting scan: service={}, vendor=0x{:04X}",
            filter.service_uuid, filter.vendor_id
        );
        self.filter = filter;
        self.dedup.reset();
        self.dropped = 0;
        self.phase = ScanPhase::Starting;
        self.radio.start_scan(filter);
        Ok(())
    }

    /// 停止扫描，可重复调用
    pub fn stop(&mut self) {
        self.dedup.reset();
        match self.phase {
            ScanPhase::Idle | ScanPhase::StopPending => {}
            ScanPhase::Starting | ScanPhase::Active => {
                debug!("Stopping scan");
                self.phase = ScanPhase::StopPending;
                self.radio.stop_scan();
            }
        }
    }

    /// 处理扫描事件，返回最终的启动失败原因
    pub fn handle_event(&mut self, event: ScanEvent) -> Option<FailureCause> {
        match event {
            ScanEvent::Started => {
                if self.phase == ScanPhase::Starting {
                    info!("Scan started");
                    self.phase = ScanPhase::Active;
                    self.notify(SyncNotice::ScanStarted);
                }
                None
            }
            ScanEvent::StartFailed(cause) => match self.phase {
                ScanPhase::Starting => {
                    error!("Scan failed: {}", cause);
                    self.phase = ScanPhase::Idle;
                    self.notify(SyncNotice::Failed {
                        operation: Operation::Scan,
                        cause,
                    });
                    Some(cause)
                }
                // 已经请求停止，启动失败即为会话结束
                ScanPhase::StopPending => {
                    debug!("Scan failed to start ({}) after stop was requested", cause);
                    self.phase = ScanPhase::Idle;
                    self.notify(SyncNotice::ScanStopped);
                    None
                }
                ScanPhase::Idle | ScanPhase::Active => {
                    debug!("Ignoring scan failure ({}) in phase {:?}", cause, self.phase);
                    None
                }
            },
            ScanEvent::Record(record) => {
                if let Some(received) = self.process(&record) {
                    self.notify(SyncNotice::ValueReceived(received));
                }
                None
            }
            ScanEvent::Stopped => {
                match self.phase {
                    ScanPhase::StopPending => info!("Scan stopped"),
                    ScanPhase::Starting | ScanPhase::Active => {
                        warn!("Scan session ended by the radio");
                        self.dedup.reset();
                    }
                    ScanPhase::Idle => return None,
                }
                self.phase = ScanPhase::Idle;
                self.notify(SyncNotice::ScanStopped);
                None
            }
        }
    }

    /// 过滤、解码并去重一条记录
    ///
    /// 返回需要交付的新值。
    pub fn process(&mut self, record: &AdvertisementRecord) -> Option<ReceivedValue> {
        if !matches!(self.phase, ScanPhase::Starting | ScanPhase::Active) {
            trace!("Dropping record from {} outside a scan", record.address);
            return None;
        }
        if !record.advertises(self.filter.service_uuid) {
            trace!("Ignoring {}: service UUID not advertised", record.address);
            return None;
        }
        let Some(payload) = record.vendor_payload(self.filter.vendor_id) else {
            trace!(
                "Ignoring {}: no data for vendor 0x{:04X}",
                record.address, self.filter.vendor_id
            );
            return None;
        };

        let value = match self.codec.decode(payload) {
            Ok(value) => value,
            Err(e) => {
                debug!(
                    "Dropping record from {} ({}): {}",
                    record.address,
                    codec::decode(payload),
                    e
                );
                self.dropped += 1;
                return None;
            }
        };

        if !self.dedup.observe(&value) {
            trace!("Duplicate value from {}: '{}'", record.address, value);
            return None;
        }

        debug!(
            "New value from {} (RSSI {:?}): '{}'",
            record.address, record.rssi, value
        );
        let received = ReceivedValue {
            value,
            peer: record.address.clone(),
            rssi: record.rssi,
        };
        self.last_delivered = Some(received.clone());
        Some(received)
    }

    fn notify(&self, notice: SyncNotice) {
        let _ = self.notices.send(notice);
    }
}
